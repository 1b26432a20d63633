//! The server context: shared state and the role state machine.
//!
//! A server is a single state machine over six roles (Inactive, Reserve,
//! Passive, Follower, Candidate, Leader). All role mutations, log writes,
//! and timer firings happen on one driving loop; the context is `&mut`
//! throughout and owns the log writer, cluster state, and executor
//! exclusively. Role transitions swap the role variant, dropping the
//! departing role's volatile state (votes, replication views, waiters).
//!
//! The context is deterministic: time enters only through the `now`
//! arguments of [`ServerContext::tick`] and the message handlers, which
//! makes every scenario in the test suite replayable.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::BytesMut;
use rand::Rng;
use tracing::{debug, info, warn};

use cohort_common::{
    ConnectionId, ErrorKind, LogIndex, MemberId, SessionId, Term, Timestamp,
};
use cohort_protocol::client::{ClientRequest, ClientResponse, PublishMessage};
use cohort_protocol::entry::Entry;
use cohort_protocol::member::{Configuration, MemberType};
use cohort_protocol::raft::Outbound;
use cohort_protocol::Consistency;
use cohort_storage::{
    Log, LogWriter, MetaStore, PendingSnapshot, SnapshotStore, StorageConfig,
};

use crate::appender::LeaderAppender;
use crate::cluster::ClusterState;
use crate::config::ServerConfig;
use crate::executor::{StateMachineExecutor, STATE_MACHINE_ID};
use crate::state_machine::StateMachine;

/// The role of a server within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initial and terminal state; rejects every request.
    Inactive,
    /// Stateless standby; tracks configuration only.
    Reserve,
    /// Asynchronous replica; applies committed entries, never votes.
    Passive,
    /// Voting member following a leader.
    Follower,
    /// Voting member running an election.
    Candidate,
    /// The exclusive writer of the current term.
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::Inactive => "inactive",
            Role::Reserve => "reserve",
            Role::Passive => "passive",
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// Volatile state of a candidate.
#[derive(Debug)]
pub(crate) struct CandidateState {
    /// True while in the advisory pre-vote round.
    pub polling: bool,
    /// Members that granted the current round.
    pub votes: HashSet<MemberId>,
}

/// Volatile state of a leader.
pub(crate) struct LeaderVolatile {
    /// The replication driver.
    pub appender: LeaderAppender,
    /// Index of an uncommitted Configuration entry, or 0.
    pub configuring: LogIndex,
    /// Index of the leader's Initialize entry.
    pub leader_index: LogIndex,
    /// Linearizable query responses held until a quorum acknowledges a
    /// heartbeat sent at or after their registration time.
    pub linearizable: Vec<(Timestamp, ConnectionId, u64, ClientResponse)>,
}

/// Per-role volatile state.
pub(crate) enum RoleState {
    Inactive,
    Reserve,
    Passive,
    Follower,
    Candidate(CandidateState),
    Leader(LeaderVolatile),
}

impl RoleState {
    pub(crate) fn role(&self) -> Role {
        match self {
            RoleState::Inactive => Role::Inactive,
            RoleState::Reserve => Role::Reserve,
            RoleState::Passive => Role::Passive,
            RoleState::Follower => Role::Follower,
            RoleState::Candidate(_) => Role::Candidate,
            RoleState::Leader(_) => Role::Leader,
        }
    }
}

/// What a deferred client request is waiting for.
#[derive(Debug)]
pub(crate) enum PendingKind {
    OpenSession,
    KeepAlive,
    CloseSession,
    Command { session: SessionId, sequence: u64 },
    Metadata,
}

/// A client request deferred until its entry is applied.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub connection: ConnectionId,
    pub request: u64,
    pub kind: PendingKind,
}

/// An effect addressed to the client plane, produced by the core and
/// carried out by the hosting server loop.
#[derive(Debug)]
pub enum ClientEffect {
    /// Send a response on a local connection.
    Respond {
        /// The local connection.
        connection: ConnectionId,
        /// The request correlation id.
        request: u64,
        /// The response body.
        response: ClientResponse,
    },
    /// Proxy a request to the leader on the submitter's behalf.
    Forward {
        /// The local connection awaiting the response.
        connection: ConnectionId,
        /// The request correlation id.
        request: u64,
        /// The member to forward to.
        leader: MemberId,
        /// The request body.
        body: ClientRequest,
    },
    /// Push an event message to a locally attached connection.
    Publish {
        /// The local connection.
        connection: ConnectionId,
        /// The event message.
        message: PublishMessage,
    },
}

/// Snapshot chunks being received from the leader.
pub(crate) struct PendingInstall {
    pub index: LogIndex,
    pub data: BytesMut,
}

/// The server core.
pub struct ServerContext<S: StateMachine> {
    pub(crate) id: MemberId,
    pub(crate) config: ServerConfig,
    pub(crate) meta: MetaStore,
    pub(crate) log: Arc<Log>,
    pub(crate) writer: LogWriter,
    pub(crate) snapshots: Arc<SnapshotStore>,
    pub(crate) cluster: ClusterState,
    pub(crate) executor: StateMachineExecutor<S>,
    pub(crate) role: RoleState,
    pub(crate) term: Term,
    pub(crate) voted_for: Option<MemberId>,
    pub(crate) leader: Option<MemberId>,
    /// When the election timer fires; 0 while unarmed.
    pub(crate) election_deadline: Timestamp,
    pub(crate) pending: HashMap<LogIndex, PendingRequest>,
    /// Query correlation tags handed to the executor.
    pub(crate) query_tags: HashMap<u64, (ConnectionId, u64, Consistency)>,
    pub(crate) next_query_tag: u64,
    /// Connections attached to this server, eligible for event pushes.
    pub(crate) local_connections: HashSet<ConnectionId>,
    pub(crate) effects: Vec<ClientEffect>,
    pub(crate) install: Option<PendingInstall>,
    /// Lowest index replicated everywhere, as last heard from the leader.
    pub(crate) global_index: LogIndex,
}

impl<S: StateMachine> ServerContext<S> {
    /// Creates a server core over the given storage, state machine, and
    /// seed configuration.
    ///
    /// A configuration stored in the meta file (from a previous run)
    /// takes precedence over the seed.
    pub fn new(
        id: MemberId,
        config: ServerConfig,
        storage: StorageConfig,
        machine: S,
        seed: Configuration,
    ) -> cohort_common::Result<Self> {
        config
            .validate()
            .map_err(|message| cohort_common::CohortError::new(ErrorKind::ConfigurationError, message))?;

        let log = Log::open(storage.clone())
            .map_err(|e| cohort_common::CohortError::new(ErrorKind::InternalError, e.to_string()))?;
        let writer = log.writer();
        let snapshots = Arc::new(
            SnapshotStore::open(storage.clone())
                .map_err(|e| cohort_common::CohortError::new(ErrorKind::InternalError, e.to_string()))?,
        );
        let meta = MetaStore::open(&storage)
            .map_err(|e| cohort_common::CohortError::new(ErrorKind::InternalError, e.to_string()))?;

        let stored = meta.load();
        let configuration = stored.configuration.clone().unwrap_or(seed);
        let cluster = ClusterState::new(id, configuration);
        let executor = StateMachineExecutor::new(machine, snapshots.clone());

        let role = match cluster.local_type() {
            None | Some(MemberType::Reserve) => RoleState::Reserve,
            Some(MemberType::Passive) => RoleState::Passive,
            Some(MemberType::Active) => RoleState::Follower,
        };
        info!(member = id, role = %role.role(), term = stored.term, "server starting");

        Ok(Self {
            id,
            config,
            meta,
            log,
            writer,
            snapshots,
            cluster,
            executor,
            role,
            term: stored.term,
            voted_for: stored.voted_for,
            leader: None,
            election_deadline: 0,
            pending: HashMap::new(),
            query_tags: HashMap::new(),
            next_query_tag: 1,
            local_connections: HashSet::new(),
            effects: Vec::new(),
            install: None,
            global_index: 0,
        })
    }

    /// Returns this server's member id.
    pub fn member_id(&self) -> MemberId {
        self.id
    }

    /// Returns the current role.
    pub fn role(&self) -> Role {
        self.role.role()
    }

    /// Returns the current term.
    pub fn term(&self) -> Term {
        self.term
    }

    /// Returns the known leader, if any.
    pub fn leader(&self) -> Option<MemberId> {
        self.leader
    }

    /// Returns the log.
    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    /// Returns the commit index.
    pub fn commit_index(&self) -> LogIndex {
        self.log.commit_index()
    }

    /// Returns the executor.
    pub fn executor(&self) -> &StateMachineExecutor<S> {
        &self.executor
    }

    /// Returns the cluster state.
    pub fn cluster(&self) -> &ClusterState {
        &self.cluster
    }

    /// Drains client-plane effects produced since the last call.
    pub fn take_effects(&mut self) -> Vec<ClientEffect> {
        std::mem::take(&mut self.effects)
    }

    /// Advances timers. Returns messages to send to peers.
    pub fn tick(&mut self, now: Timestamp) -> Vec<Outbound> {
        let mut out = Vec::new();
        match self.role.role() {
            Role::Inactive | Role::Reserve | Role::Passive => {}
            Role::Follower | Role::Candidate => {
                if self.election_deadline == 0 {
                    self.reset_election_timer(now);
                } else if now >= self.election_deadline {
                    debug!(member = self.id, term = self.term, "election timeout");
                    out.extend(self.start_election(now));
                }
            }
            Role::Leader => {
                out.extend(self.leader_cycle(now));
            }
        }
        self.drain_executor(now);
        out
    }

    /// Arms the election timer with a randomized deadline between one and
    /// two election timeouts from `now`.
    pub(crate) fn reset_election_timer(&mut self, now: Timestamp) {
        let timeout = self.config.election_timeout_ms();
        let jitter = rand::thread_rng().gen_range(timeout..=timeout * 2);
        self.election_deadline = now + jitter;
    }

    /// Persists and applies a term update. Clears the vote and leader
    /// when the term advances.
    pub(crate) fn update_term(&mut self, term: Term, leader: Option<MemberId>) {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.leader = leader;
            if let Err(error) = self.meta.store_vote(self.term, self.voted_for) {
                warn!("failed to persist term: {error}");
            }
        } else if leader.is_some() && self.leader.is_none() {
            self.leader = leader;
        }
    }

    /// Records a vote for the current term.
    pub(crate) fn record_vote(&mut self, candidate: MemberId) {
        self.voted_for = Some(candidate);
        if let Err(error) = self.meta.store_vote(self.term, self.voted_for) {
            warn!("failed to persist vote: {error}");
        }
    }

    /// Transitions between roles, dropping the departing role's volatile
    /// state.
    pub(crate) fn transition(&mut self, role: Role, now: Timestamp) -> Vec<Outbound> {
        if self.role.role() == role {
            return Vec::new();
        }
        info!(member = self.id, from = %self.role.role(), to = %role, term = self.term, "transitioning");

        // Leaving the leader role fails everything in flight.
        if let RoleState::Leader(leader) = &mut self.role {
            let linearizable = std::mem::take(&mut leader.linearizable);
            for (_, connection, request, _) in linearizable {
                self.effects.push(ClientEffect::Respond {
                    connection,
                    request,
                    response: ClientResponse::Query(cohort_protocol::client::QueryResponse {
                        status: cohort_protocol::Status::Error(ErrorKind::NoLeader),
                        index: 0,
                        event_index: 0,
                        result: None,
                    }),
                });
            }
            self.fail_pending(ErrorKind::NoLeader);
        }

        self.role = match role {
            Role::Inactive => RoleState::Inactive,
            Role::Reserve => RoleState::Reserve,
            Role::Passive => RoleState::Passive,
            Role::Follower => RoleState::Follower,
            Role::Candidate => RoleState::Candidate(CandidateState {
                polling: true,
                votes: HashSet::new(),
            }),
            Role::Leader => RoleState::Leader(LeaderVolatile {
                appender: LeaderAppender::new(self.id, &self.config),
                configuring: 0,
                leader_index: 0,
                linearizable: Vec::new(),
            }),
        };

        match role {
            Role::Follower | Role::Candidate => self.reset_election_timer(now),
            _ => self.election_deadline = 0,
        }

        if role == Role::Leader {
            self.take_leadership(now)
        } else {
            Vec::new()
        }
    }

    /// Fails all deferred client requests with the given error.
    pub(crate) fn fail_pending(&mut self, kind: ErrorKind) {
        let pending = std::mem::take(&mut self.pending);
        for (_, request) in pending {
            let response = match request.kind {
                PendingKind::Command { .. } => ClientResponse::Command(
                    cohort_protocol::client::CommandResponse::error(kind, self.leader_client_address()),
                ),
                PendingKind::OpenSession => {
                    ClientResponse::Register(cohort_protocol::client::RegisterResponse {
                        status: cohort_protocol::Status::Error(kind),
                        session: 0,
                        leader: self.leader_client_address(),
                        members: self.member_client_addresses(),
                        timeout: 0,
                    })
                }
                PendingKind::KeepAlive => {
                    ClientResponse::KeepAlive(cohort_protocol::client::KeepAliveResponse {
                        status: cohort_protocol::Status::Error(kind),
                        leader: self.leader_client_address(),
                        members: self.member_client_addresses(),
                    })
                }
                PendingKind::CloseSession => {
                    ClientResponse::Unregister(cohort_protocol::client::UnregisterResponse {
                        status: cohort_protocol::Status::Error(kind),
                    })
                }
                PendingKind::Metadata => {
                    ClientResponse::Metadata(cohort_protocol::client::MetadataResponse {
                        status: cohort_protocol::Status::Error(kind),
                        sessions: Vec::new(),
                    })
                }
            };
            self.effects.push(ClientEffect::Respond {
                connection: request.connection,
                request: request.request,
                response,
            });
        }
    }

    /// Returns the leader's client-facing address, when known.
    pub(crate) fn leader_client_address(&self) -> Option<std::net::SocketAddr> {
        self.leader
            .and_then(|id| self.cluster.configuration().member(id))
            .map(|m| m.client_address)
    }

    /// Returns the client addresses of all members.
    pub(crate) fn member_client_addresses(&self) -> Vec<std::net::SocketAddr> {
        self.cluster
            .configuration()
            .members
            .iter()
            .map(|m| m.client_address)
            .collect()
    }

    /// Observes a configuration: updates cluster state, persists it, and
    /// applies any role change required by the local member's new type.
    pub(crate) fn observe_configuration(
        &mut self,
        configuration: Configuration,
        now: Timestamp,
    ) -> Vec<Outbound> {
        let last_index = self.log.last_index();
        let _transition = self.cluster.configure(configuration, last_index);
        if let Err(error) = self.meta.store_configuration(self.cluster.configuration()) {
            warn!("failed to persist configuration: {error}");
        }

        let role = self.role.role();
        if role == Role::Inactive {
            return Vec::new();
        }
        match self.cluster.local_type() {
            // Promotion goes through Passive; the passive append path
            // promotes to Follower once caught up to the leader's commit.
            Some(MemberType::Active) => match role {
                Role::Reserve => self.transition(Role::Passive, now),
                _ => Vec::new(),
            },
            Some(MemberType::Passive) => match role {
                Role::Passive => Vec::new(),
                _ => self.transition(Role::Passive, now),
            },
            Some(MemberType::Reserve) => match role {
                Role::Reserve => Vec::new(),
                _ => self.transition(Role::Reserve, now),
            },
            // Removed from the cluster entirely.
            None => self.transition(Role::Inactive, now),
        }
    }

    /// Applies committed entries through the executor and completes any
    /// deferred client requests whose entries were applied.
    pub(crate) fn apply_all(&mut self, now: Timestamp) {
        let commit = self.log.commit_index();
        let mut index = self.executor.last_applied() + 1;
        while index <= commit {
            match self.log.get(index) {
                Ok(Some(entry)) => self.executor.apply(&entry),
                Ok(None) => {
                    // Skipped or compacted; the executor tracks applied
                    // position itself when installing snapshots.
                }
                Err(error) => {
                    warn!(index, "failed to read committed entry: {error}");
                    break;
                }
            }
            index += 1;
        }

        self.drain_executor(now);
        self.complete_applied();
        self.maybe_compact(now);
    }

    /// Moves executor outputs into client-plane effects.
    pub(crate) fn drain_executor(&mut self, now: Timestamp) {
        for event in self.executor.take_events() {
            if event.connection != 0 && self.local_connections.contains(&event.connection) {
                self.effects.push(ClientEffect::Publish {
                    connection: event.connection,
                    message: event.message,
                });
            }
        }

        for completion in self.executor.take_command_completions() {
            let Some(pending) = self.pending.remove(&completion.index) else {
                continue;
            };
            if let PendingKind::Command { session, sequence } = &pending.kind {
                if *session != completion.session || *sequence != completion.sequence {
                    debug!(
                        index = completion.index,
                        "completion does not match deferred request"
                    );
                }
            }
            let response = cohort_protocol::client::CommandResponse {
                status: match &completion.result.result {
                    Ok(_) => cohort_protocol::Status::Ok,
                    Err(kind) => cohort_protocol::Status::Error(*kind),
                },
                index: completion.result.index,
                event_index: completion.result.event_index,
                result: completion.result.result.clone().ok(),
                last_sequence: None,
                leader: self.leader_client_address(),
            };
            self.effects.push(ClientEffect::Respond {
                connection: pending.connection,
                request: pending.request,
                response: ClientResponse::Command(response),
            });
        }

        let completions = self.executor.take_query_completions();
        for completion in completions {
            let Some((connection, request, consistency)) =
                self.query_tags.remove(&completion.tag)
            else {
                continue;
            };
            let response = ClientResponse::Query(cohort_protocol::client::QueryResponse {
                status: match &completion.result.result {
                    Ok(_) => cohort_protocol::Status::Ok,
                    Err(kind) => cohort_protocol::Status::Error(*kind),
                },
                index: completion.result.index,
                event_index: completion.result.event_index,
                result: completion.result.result.ok(),
            });

            // Linearizable queries wait for a heartbeat round that
            // started at or after this point; without leadership the
            // result cannot be verified and the client must retry.
            if consistency == Consistency::Linearizable {
                match &mut self.role {
                    RoleState::Leader(leader) => {
                        leader
                            .linearizable
                            .push((now, connection, request, response));
                    }
                    _ => {
                        self.effects.push(ClientEffect::Respond {
                            connection,
                            request,
                            response: ClientResponse::Query(
                                cohort_protocol::client::QueryResponse {
                                    status: cohort_protocol::Status::Error(ErrorKind::NoLeader),
                                    index: 0,
                                    event_index: 0,
                                    result: None,
                                },
                            ),
                        });
                    }
                }
                continue;
            }
            self.effects.push(ClientEffect::Respond {
                connection,
                request,
                response,
            });
        }
    }

    /// Completes deferred non-command requests whose entries have been
    /// applied.
    pub(crate) fn complete_applied(&mut self) {
        let applied = self.executor.last_applied();
        let ready: Vec<LogIndex> = self
            .pending
            .iter()
            .filter(|(index, request)| {
                **index <= applied && !matches!(request.kind, PendingKind::Command { .. })
            })
            .map(|(index, _)| *index)
            .collect();

        for index in ready {
            let request = self.pending.remove(&index).expect("listed above");
            let response = match request.kind {
                PendingKind::OpenSession => {
                    let timeout = self
                        .executor
                        .sessions()
                        .get(index)
                        .map(|s| s.timeout())
                        .unwrap_or(0);
                    ClientResponse::Register(cohort_protocol::client::RegisterResponse {
                        status: cohort_protocol::Status::Ok,
                        session: index,
                        leader: self.leader_client_address(),
                        members: self.member_client_addresses(),
                        timeout,
                    })
                }
                PendingKind::KeepAlive => {
                    ClientResponse::KeepAlive(cohort_protocol::client::KeepAliveResponse {
                        status: cohort_protocol::Status::Ok,
                        leader: self.leader_client_address(),
                        members: self.member_client_addresses(),
                    })
                }
                PendingKind::CloseSession => {
                    ClientResponse::Unregister(cohort_protocol::client::UnregisterResponse {
                        status: cohort_protocol::Status::Ok,
                    })
                }
                PendingKind::Metadata => {
                    let sessions = self
                        .executor
                        .sessions()
                        .iter()
                        .map(|s| cohort_protocol::client::SessionMetadata {
                            session: s.id(),
                            client: s.client().to_string(),
                            timeout: s.timeout(),
                        })
                        .collect();
                    ClientResponse::Metadata(cohort_protocol::client::MetadataResponse {
                        status: cohort_protocol::Status::Ok,
                        sessions,
                    })
                }
                PendingKind::Command { .. } => unreachable!("filtered above"),
            };
            self.effects.push(ClientEffect::Respond {
                connection: request.connection,
                request: request.request,
                response,
            });
        }
    }

    /// Compacts the log below the fully-replicated, snapshotted prefix.
    pub(crate) fn maybe_compact(&mut self, now: Timestamp) {
        let Some(snapshot) = self.snapshots.snapshot_by_id(STATE_MACHINE_ID) else {
            return;
        };
        let bound = match self.role {
            RoleState::Leader(ref leader) => leader
                .appender
                .global_index(&self.cluster, self.log.last_index(), now),
            _ => self.global_index,
        };
        let compact_to = snapshot.index().min(bound);
        if compact_to > self.log.first_index() {
            if let Err(error) = self.log.compact(compact_to) {
                warn!("compaction failed: {error}");
            }
        }
    }

    /// Appends an entry as leader, stamping the current term.
    pub(crate) fn append_entry(&mut self, entry: Entry) -> Option<LogIndex> {
        match self.writer.append(self.term, entry) {
            Ok(indexed) => Some(indexed.index),
            Err(error) => {
                // A leader that cannot write its own log steps down.
                warn!("append failed: {error}");
                None
            }
        }
    }

    /// Allocates a query correlation tag.
    pub(crate) fn allocate_query_tag(
        &mut self,
        connection: ConnectionId,
        request: u64,
        consistency: Consistency,
    ) -> u64 {
        let tag = self.next_query_tag;
        self.next_query_tag += 1;
        self.query_tags.insert(tag, (connection, request, consistency));
        tag
    }

    /// Accumulates an incoming snapshot chunk; returns true once the
    /// snapshot is complete and stored.
    pub(crate) fn receive_install_chunk(
        &mut self,
        index: LogIndex,
        offset: u64,
        data: &[u8],
        complete: bool,
    ) -> bool {
        if offset == 0 {
            self.install = Some(PendingInstall {
                index,
                data: BytesMut::new(),
            });
        }
        let Some(install) = &mut self.install else {
            return false;
        };
        if install.index != index || install.data.len() as u64 != offset {
            // Out-of-order chunk; restart from scratch on the next
            // offset-zero chunk.
            self.install = None;
            return false;
        }
        install.data.extend_from_slice(data);

        if !complete {
            return false;
        }

        let install = self.install.take().expect("checked above");
        let mut pending: PendingSnapshot =
            self.snapshots.create_snapshot(STATE_MACHINE_ID, index);
        pending.writer().write_raw(&install.data);
        match self.snapshots.complete(pending) {
            Ok(_) => {
                // Fast-forward the log past the snapshot so replication
                // can continue from index + 1.
                let last = self.log.last_index();
                if last < index {
                    if let Err(error) = self.writer.skip(index - last) {
                        warn!("failed to skip past snapshot: {error}");
                    }
                }
                let _ = self.log.commit(index);
                true
            }
            Err(error) => {
                warn!("failed to store installed snapshot: {error}");
                false
            }
        }
    }
}
