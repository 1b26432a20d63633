//! The client-facing request plane.
//!
//! Clients may contact any member. Connect requests bind locally on
//! whichever server accepted the connection; everything else is handled
//! by the leader, so non-leaders forward requests over the server plane
//! (or answer `NoLeader` when no leader is known). On the leader,
//! mutating requests become log entries and complete when applied;
//! queries execute from memory against committed state.

use tracing::debug;

use cohort_common::{ConnectionId, ErrorKind, Timestamp};
use cohort_protocol::client::{
    ClientRequest, ClientResponse, CommandRequest, CommandResponse, ConnectResponse,
    KeepAliveResponse, MetadataResponse, QueryRequest, QueryResponse, RegisterResponse,
    UnregisterResponse,
};
use cohort_protocol::entry::Entry;
use cohort_protocol::raft::Outbound;
use cohort_protocol::{Consistency, Status};

use crate::context::{ClientEffect, PendingKind, PendingRequest, Role, ServerContext};
use crate::state_machine::StateMachine;

impl<S: StateMachine> ServerContext<S> {
    /// Handles a client request received on a local connection.
    ///
    /// Responses and event pushes surface as [`ClientEffect`]s; messages
    /// to other servers (replication triggered by an append) are
    /// returned.
    pub fn handle_client(
        &mut self,
        connection: ConnectionId,
        request_id: u64,
        request: ClientRequest,
        now: Timestamp,
    ) -> Vec<Outbound> {
        self.local_connections.insert(connection);

        // Connect binds locally on whichever member holds the client's
        // connection; it needs no leader.
        if let ClientRequest::Connect(request) = &request {
            if let Some(session) = self.executor.sessions_mut().get_mut(request.session) {
                session.bind(request.connection);
            }
            self.respond(
                connection,
                request_id,
                ClientResponse::Connect(ConnectResponse {
                    status: Status::Ok,
                    leader: self.leader_client_address(),
                    members: self.member_client_addresses(),
                }),
            );
            return Vec::new();
        }

        match self.role() {
            Role::Leader => self.leader_client(connection, request_id, request, now),
            Role::Inactive => {
                let response = error_response(&request, ErrorKind::IllegalMemberState);
                self.respond(connection, request_id, response);
                Vec::new()
            }
            _ => {
                match self.leader {
                    Some(leader) if leader != self.id => {
                        debug!(member = self.id, leader, "forwarding client request");
                        self.effects.push(ClientEffect::Forward {
                            connection,
                            request: request_id,
                            leader,
                            body: request,
                        });
                    }
                    _ => {
                        let response = error_response(&request, ErrorKind::NoLeader);
                        self.respond(connection, request_id, response);
                    }
                }
                Vec::new()
            }
        }
    }

    fn leader_client(
        &mut self,
        connection: ConnectionId,
        request_id: u64,
        request: ClientRequest,
        now: Timestamp,
    ) -> Vec<Outbound> {
        // Client operations wait until the leader's initial entries have
        // committed.
        if self.initializing() {
            let response = error_response(&request, ErrorKind::NoLeader);
            self.respond(connection, request_id, response);
            return Vec::new();
        }

        match request {
            ClientRequest::Register(request) => {
                let timeout = if request.timeout == 0 {
                    self.config.session_timeout_ms()
                } else {
                    request.timeout
                };
                let Some(index) = self.append_entry(Entry::OpenSession {
                    timestamp: now,
                    client: request.client,
                    timeout,
                }) else {
                    let response = ClientResponse::Register(RegisterResponse {
                        status: Status::Error(ErrorKind::InternalError),
                        session: 0,
                        leader: self.leader_client_address(),
                        members: self.member_client_addresses(),
                        timeout: 0,
                    });
                    self.respond(connection, request_id, response);
                    return Vec::new();
                };
                self.pending.insert(
                    index,
                    PendingRequest {
                        connection,
                        request: request_id,
                        kind: PendingKind::OpenSession,
                    },
                );
                self.leader_cycle(now)
            }

            ClientRequest::KeepAlive(request) => {
                let Some(index) = self.append_entry(Entry::KeepAlive {
                    timestamp: now,
                    sessions: request.sessions,
                }) else {
                    let response = ClientResponse::KeepAlive(KeepAliveResponse {
                        status: Status::Error(ErrorKind::InternalError),
                        leader: self.leader_client_address(),
                        members: self.member_client_addresses(),
                    });
                    self.respond(connection, request_id, response);
                    return Vec::new();
                };
                self.pending.insert(
                    index,
                    PendingRequest {
                        connection,
                        request: request_id,
                        kind: PendingKind::KeepAlive,
                    },
                );
                self.leader_cycle(now)
            }

            ClientRequest::Unregister(request) => {
                if !self.executor.registry().contains(request.session) {
                    let response = ClientResponse::Unregister(UnregisterResponse {
                        status: Status::Error(ErrorKind::UnknownSession),
                    });
                    self.respond(connection, request_id, response);
                    return Vec::new();
                }
                let Some(index) = self.append_entry(Entry::CloseSession {
                    timestamp: now,
                    session: request.session,
                    expired: false,
                }) else {
                    let response = ClientResponse::Unregister(UnregisterResponse {
                        status: Status::Error(ErrorKind::InternalError),
                    });
                    self.respond(connection, request_id, response);
                    return Vec::new();
                };
                self.pending.insert(
                    index,
                    PendingRequest {
                        connection,
                        request: request_id,
                        kind: PendingKind::CloseSession,
                    },
                );
                self.leader_cycle(now)
            }

            ClientRequest::Command(request) => {
                self.leader_command(connection, request_id, request, now)
            }

            ClientRequest::Query(request) => {
                self.leader_query(connection, request_id, request, now)
            }

            ClientRequest::Metadata(request) => {
                let Some(index) = self.append_entry(Entry::Metadata {
                    timestamp: now,
                    session: request.session,
                }) else {
                    let response = ClientResponse::Metadata(MetadataResponse {
                        status: Status::Error(ErrorKind::InternalError),
                        sessions: Vec::new(),
                    });
                    self.respond(connection, request_id, response);
                    return Vec::new();
                };
                self.pending.insert(
                    index,
                    PendingRequest {
                        connection,
                        request: request_id,
                        kind: PendingKind::Metadata,
                    },
                );
                self.leader_cycle(now)
            }

            ClientRequest::Connect(_) => unreachable!("handled before role dispatch"),
        }
    }

    fn leader_command(
        &mut self,
        connection: ConnectionId,
        request_id: u64,
        request: CommandRequest,
        now: Timestamp,
    ) -> Vec<Outbound> {
        let registry = self.executor.registry();
        if !registry.contains(request.session) {
            let response =
                CommandResponse::error(ErrorKind::UnknownSession, self.leader_client_address());
            self.respond(connection, request_id, ClientResponse::Command(response));
            return Vec::new();
        }

        // The request-sequence gate rejects duplicates and reordered
        // submissions before they reach the log.
        if let Err(last_sequence) = registry.try_admit(request.session, request.sequence) {
            // A retransmission of an applied command is answered from the
            // session's response cache.
            if let Some(result) = self
                .executor
                .sessions()
                .get(request.session)
                .and_then(|session| session.result(request.sequence))
            {
                let response = CommandResponse {
                    status: match &result.result {
                        Ok(_) => Status::Ok,
                        Err(kind) => Status::Error(*kind),
                    },
                    index: result.index,
                    event_index: result.event_index,
                    result: result.result.clone().ok(),
                    last_sequence: None,
                    leader: self.leader_client_address(),
                };
                self.respond(connection, request_id, ClientResponse::Command(response));
                return Vec::new();
            }

            let response = CommandResponse {
                status: Status::Error(ErrorKind::CommandError),
                index: 0,
                event_index: 0,
                result: None,
                last_sequence: Some(last_sequence),
                leader: self.leader_client_address(),
            };
            self.respond(connection, request_id, ClientResponse::Command(response));
            return Vec::new();
        }

        let Some(index) = self.append_entry(Entry::Command {
            timestamp: now,
            session: request.session,
            sequence: request.sequence,
            payload: request.payload,
        }) else {
            let response =
                CommandResponse::error(ErrorKind::InternalError, self.leader_client_address());
            self.respond(connection, request_id, ClientResponse::Command(response));
            return Vec::new();
        };

        self.pending.insert(
            index,
            PendingRequest {
                connection,
                request: request_id,
                kind: PendingKind::Command {
                    session: request.session,
                    sequence: request.sequence,
                },
            },
        );
        self.leader_cycle(now)
    }

    fn leader_query(
        &mut self,
        connection: ConnectionId,
        request_id: u64,
        request: QueryRequest,
        now: Timestamp,
    ) -> Vec<Outbound> {
        if !self.executor.registry().contains(request.session) {
            let response = ClientResponse::Query(QueryResponse {
                status: Status::Error(ErrorKind::UnknownSession),
                index: 0,
                event_index: 0,
                result: None,
            });
            self.respond(connection, request_id, response);
            return Vec::new();
        }

        // The lease level refuses to serve when the leader has not heard
        // from a quorum within the election timeout.
        if request.consistency == Consistency::LinearizableLease && !self.lease_current(now) {
            let response = ClientResponse::Query(QueryResponse {
                status: Status::Error(ErrorKind::QueryError),
                index: 0,
                event_index: 0,
                result: None,
            });
            self.respond(connection, request_id, response);
            return Vec::new();
        }

        let tag = self.allocate_query_tag(connection, request_id, request.consistency);
        self.executor.submit_query(
            tag,
            request.session,
            request.sequence,
            request.index,
            request.payload,
        );
        self.drain_executor(now);

        // Linearizable queries force a heartbeat round; on a single
        // member the quorum is immediate.
        self.leader_cycle(now)
    }

    fn respond(&mut self, connection: ConnectionId, request: u64, response: ClientResponse) {
        self.effects.push(ClientEffect::Respond {
            connection,
            request,
            response,
        });
    }
}

fn error_response(request: &ClientRequest, kind: ErrorKind) -> ClientResponse {
    match request {
        ClientRequest::Register(_) => ClientResponse::Register(RegisterResponse {
            status: Status::Error(kind),
            session: 0,
            leader: None,
            members: Vec::new(),
            timeout: 0,
        }),
        ClientRequest::KeepAlive(_) => ClientResponse::KeepAlive(KeepAliveResponse {
            status: Status::Error(kind),
            leader: None,
            members: Vec::new(),
        }),
        ClientRequest::Unregister(_) => ClientResponse::Unregister(UnregisterResponse {
            status: Status::Error(kind),
        }),
        ClientRequest::Connect(_) => ClientResponse::Connect(ConnectResponse {
            status: Status::Error(kind),
            leader: None,
            members: Vec::new(),
        }),
        ClientRequest::Command(_) => {
            ClientResponse::Command(CommandResponse::error(kind, None))
        }
        ClientRequest::Query(_) => ClientResponse::Query(QueryResponse {
            status: Status::Error(kind),
            index: 0,
            event_index: 0,
            result: None,
        }),
        ClientRequest::Metadata(_) => ClientResponse::Metadata(MetadataResponse {
            status: Status::Error(kind),
            sessions: Vec::new(),
        }),
    }
}
