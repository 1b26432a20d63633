//! Server assembly.
//!
//! [`Server`] wires a [`ServerContext`] to a transport and a TCP client
//! listener, and drives everything from one event loop: a periodic tick
//! for timers, incoming peer messages, and incoming client requests all
//! mutate the context on this single task. Snapshot persistence is the
//! only work pushed off the loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use cohort_common::{ConnectionId, MemberId};
use cohort_protocol::client::{ClientEnvelope, ClientRequest, ClientResponse, ServerEnvelope};
use cohort_protocol::frame;
use cohort_protocol::member::{Configuration, Member, MemberType};
use cohort_protocol::raft::{JoinRequest, Outbound, RaftMessage};
use cohort_storage::StorageConfig;

use crate::config::ServerConfig;
use crate::context::{ClientEffect, ServerContext};
use crate::state_machine::StateMachine;
use crate::transport::{TcpTransport, Transport};

/// How often the context's timers are advanced.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// How often a joining server retries its Join request.
const JOIN_RETRY_INTERVAL: Duration = Duration::from_millis(1000);

/// A running Cohort server.
pub struct Server<S: StateMachine> {
    context: ServerContext<S>,
    transport: Arc<dyn Transport>,
    local: Member,
    join_targets: Vec<MemberId>,
}

impl<S: StateMachine> Server<S> {
    /// Bootstraps a new cluster from a seed member list that includes
    /// this server as an active member.
    pub async fn bootstrap(
        local: Member,
        others: Vec<Member>,
        config: ServerConfig,
        storage: StorageConfig,
        machine: S,
    ) -> cohort_common::Result<Self> {
        let mut members = vec![local.clone()];
        members.extend(others);
        let seed = Configuration::seed(members);

        let transport = Self::connect_transport(&local, &seed).await?;
        let context = ServerContext::new(local.id, config, storage, machine, seed)?;
        Ok(Self {
            context,
            transport,
            local,
            join_targets: Vec::new(),
        })
    }

    /// Joins an existing cluster through the given seed members.
    pub async fn join(
        local: Member,
        seeds: Vec<Member>,
        config: ServerConfig,
        storage: StorageConfig,
        machine: S,
    ) -> cohort_common::Result<Self> {
        let join_targets: Vec<MemberId> = seeds.iter().map(|m| m.id).collect();
        let seed = Configuration::seed(seeds);

        let transport = Self::connect_transport(&local, &seed).await?;
        let context = ServerContext::new(local.id, config, storage, machine, seed)?;
        Ok(Self {
            context,
            transport,
            local,
            join_targets,
        })
    }

    async fn connect_transport(
        local: &Member,
        configuration: &Configuration,
    ) -> cohort_common::Result<Arc<dyn Transport>> {
        let peers: HashMap<MemberId, SocketAddr> = configuration
            .members
            .iter()
            .filter(|m| m.id != local.id)
            .map(|m| (m.id, m.server_address))
            .collect();
        let transport = TcpTransport::bind(local.id, local.server_address, peers)
            .await
            .map_err(|e| {
                cohort_common::CohortError::new(
                    cohort_common::ErrorKind::InternalError,
                    e.to_string(),
                )
            })?;
        Ok(transport)
    }

    /// Returns the server core, for inspection.
    pub fn context(&self) -> &ServerContext<S> {
        &self.context
    }

    /// Runs the server until the task is cancelled.
    pub async fn run(mut self) -> cohort_common::Result<()> {
        let listener = TcpListener::bind(self.local.client_address)
            .await
            .map_err(cohort_common::CohortError::Io)?;
        info!(member = self.local.id, address = %self.local.client_address, "accepting clients");

        let (client_tx, mut client_rx) =
            mpsc::unbounded_channel::<(ConnectionId, ClientEnvelope)>();
        let (respond_tx, mut respond_rx) =
            mpsc::unbounded_channel::<(ConnectionId, ServerEnvelope)>();
        let mut connections: HashMap<ConnectionId, mpsc::UnboundedSender<ServerEnvelope>> =
            HashMap::new();
        let mut forwards: HashMap<MemberId, mpsc::UnboundedSender<(ConnectionId, u64, ClientRequest)>> =
            HashMap::new();
        let mut next_connection: ConnectionId = 1;

        let mut tick = tokio::time::interval(TICK_INTERVAL);
        let mut join_timer = tokio::time::interval(JOIN_RETRY_INTERVAL);
        // A separate handle so the receive future does not borrow `self`
        // across the handler arms.
        let transport = self.transport.clone();

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let now = epoch_ms();
                    let out = self.context.tick(now);
                    self.send_all(out);
                    self.carry_effects(&mut connections, &mut forwards, &respond_tx);
                }

                _ = join_timer.tick(), if !self.join_targets.is_empty() => {
                    if self.context.cluster().local_member().is_some() {
                        self.join_targets.clear();
                    } else {
                        let request = RaftMessage::Join(JoinRequest {
                            member: self.local.clone().with_type(MemberType::Reserve),
                        });
                        for target in &self.join_targets {
                            let _ = self.transport.send(*target, request.clone());
                        }
                    }
                }

                incoming = transport.recv() => {
                    let Some(incoming) = incoming else { break };
                    let now = epoch_ms();
                    let out = self.context.handle_raft(incoming.from, incoming.message, now);
                    self.send_all(out);
                    self.carry_effects(&mut connections, &mut forwards, &respond_tx);
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            let connection = next_connection;
                            next_connection += 1;
                            debug!(connection, %remote, "client connected");

                            let (tx, rx) = mpsc::unbounded_channel();
                            connections.insert(connection, tx);
                            tokio::spawn(client_connection(
                                stream,
                                connection,
                                client_tx.clone(),
                                rx,
                            ));
                        }
                        Err(error) => warn!("client accept failed: {error}"),
                    }
                }

                request = client_rx.recv() => {
                    let Some((connection, envelope)) = request else { break };
                    let now = epoch_ms();
                    let out = self.context.handle_client(
                        connection,
                        envelope.id,
                        envelope.request,
                        now,
                    );
                    self.send_all(out);
                    self.carry_effects(&mut connections, &mut forwards, &respond_tx);
                }

                routed = respond_rx.recv() => {
                    let Some((connection, envelope)) = routed else { break };
                    if let Some(sender) = connections.get(&connection) {
                        if sender.send(envelope).is_err() {
                            connections.remove(&connection);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn send_all(&self, out: Vec<Outbound>) {
        for outbound in out {
            if let Err(error) = self.transport.send(outbound.to, outbound.message) {
                debug!(to = outbound.to, "send failed: {error}");
            }
        }
    }

    fn carry_effects(
        &mut self,
        connections: &mut HashMap<ConnectionId, mpsc::UnboundedSender<ServerEnvelope>>,
        forwards: &mut HashMap<MemberId, mpsc::UnboundedSender<(ConnectionId, u64, ClientRequest)>>,
        respond_tx: &mpsc::UnboundedSender<(ConnectionId, ServerEnvelope)>,
    ) {
        for effect in self.context.take_effects() {
            match effect {
                ClientEffect::Respond {
                    connection,
                    request,
                    response,
                } => {
                    if let Some(sender) = connections.get(&connection) {
                        let envelope = ServerEnvelope {
                            id: request,
                            response,
                        };
                        if sender.send(envelope).is_err() {
                            connections.remove(&connection);
                        }
                    }
                }
                ClientEffect::Publish {
                    connection,
                    message,
                } => {
                    if let Some(sender) = connections.get(&connection) {
                        let envelope = ServerEnvelope {
                            id: 0,
                            response: ClientResponse::Publish(message),
                        };
                        let _ = sender.send(envelope);
                    }
                }
                ClientEffect::Forward {
                    connection,
                    request,
                    leader,
                    body,
                } => {
                    let sender = forwards.entry(leader).or_insert_with(|| {
                        let address = self
                            .context
                            .cluster()
                            .configuration()
                            .member(leader)
                            .map(|m| m.client_address);
                        let (tx, rx) = mpsc::unbounded_channel();
                        if let Some(address) = address {
                            tokio::spawn(forward_connection(address, rx, respond_tx.clone()));
                        }
                        tx
                    });
                    if sender.send((connection, request, body)).is_err() {
                        forwards.remove(&leader);
                    }
                }
            }
        }
    }
}

/// Reads framed requests from one client connection and writes queued
/// responses back.
async fn client_connection(
    stream: TcpStream,
    connection: ConnectionId,
    requests: mpsc::UnboundedSender<(ConnectionId, ClientEnvelope)>,
    mut responses: mpsc::UnboundedReceiver<ServerEnvelope>,
) {
    let (mut reader, mut writer) = stream.into_split();

    let write_task = tokio::spawn(async move {
        while let Some(envelope) = responses.recv().await {
            let Ok(framed) = frame::encode(&envelope) else {
                continue;
            };
            if writer.write_all(&framed).await.is_err() {
                break;
            }
        }
    });

    let mut buf = BytesMut::with_capacity(16 * 1024);
    loop {
        loop {
            match frame::decode::<ClientEnvelope>(&mut buf) {
                Ok(Some(envelope)) => {
                    if requests.send((connection, envelope)).is_err() {
                        write_task.abort();
                        return;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    debug!(connection, "dropping client: {error}");
                    write_task.abort();
                    return;
                }
            }
        }
        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    write_task.abort();
}

/// Proxies forwarded requests to the leader's client port and routes
/// responses back to the originating connections.
async fn forward_connection(
    address: SocketAddr,
    mut requests: mpsc::UnboundedReceiver<(ConnectionId, u64, ClientRequest)>,
    responses: mpsc::UnboundedSender<(ConnectionId, ServerEnvelope)>,
) {
    let Ok(stream) = TcpStream::connect(address).await else {
        debug!(%address, "forward connect failed");
        return;
    };
    let (mut reader, mut writer) = stream.into_split();

    let pending: Arc<parking_lot::Mutex<HashMap<u64, (ConnectionId, u64)>>> =
        Arc::new(parking_lot::Mutex::new(HashMap::new()));
    let pending_reader = pending.clone();

    let read_task = tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(16 * 1024);
        loop {
            loop {
                match frame::decode::<ServerEnvelope>(&mut buf) {
                    Ok(Some(envelope)) => {
                        let Some((connection, request)) =
                            pending_reader.lock().remove(&envelope.id)
                        else {
                            continue;
                        };
                        let routed = ServerEnvelope {
                            id: request,
                            response: envelope.response,
                        };
                        if responses.send((connection, routed)).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => return,
                }
            }
            match reader.read_buf(&mut buf).await {
                Ok(0) => return,
                Ok(_) => {}
                Err(_) => return,
            }
        }
    });

    let mut next_id: u64 = 1;
    while let Some((connection, request, body)) = requests.recv().await {
        let id = next_id;
        next_id += 1;
        pending.lock().insert(id, (connection, request));

        let envelope = ClientEnvelope { id, request: body };
        let Ok(framed) = frame::encode(&envelope) else {
            continue;
        };
        if writer.write_all(&framed).await.is_err() {
            break;
        }
    }
    read_task.abort();
}

/// Returns the wall clock in milliseconds since the Unix epoch.
pub(crate) fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
