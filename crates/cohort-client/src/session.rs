//! The session client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use cohort_common::{ConnectionId, ErrorKind, SessionId};
use cohort_protocol::client::{
    ClientRequest, ClientResponse, CommandRequest, ConnectRequest, KeepAliveRequest,
    QueryRequest, RegisterRequest, UnregisterRequest,
};
use cohort_protocol::entry::SessionAck;
use cohort_protocol::{Consistency, Status};

use crate::connection::Connection;

/// How many times an operation is retried across leader changes before
/// giving up.
const MAX_RETRIES: usize = 8;

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The cluster reported a typed error.
    #[error("cluster error: {0}")]
    Cluster(ErrorKind),

    /// No member could be reached.
    #[error("no member reachable")]
    Unreachable,

    /// The connection closed mid-request.
    #[error("connection lost")]
    ConnectionLost,

    /// No session is registered.
    #[error("no session")]
    NoSession,
}

struct SessionState {
    id: SessionId,
    timeout: u64,
    /// Next command sequence to assign.
    sequence: AtomicU64,
    /// Highest sequence for which a response has been received.
    completed: AtomicU64,
    /// Highest event index received in order.
    event_index: AtomicU64,
    /// Highest log index observed in responses.
    last_index: AtomicU64,
}

struct Shared {
    connection: Mutex<Arc<Connection>>,
    members: Mutex<Vec<SocketAddr>>,
    leader: Mutex<Option<SocketAddr>>,
    session: Mutex<Option<Arc<SessionState>>>,
    connection_id: ConnectionId,
    events_tx: mpsc::UnboundedSender<cohort_protocol::client::PublishMessage>,
}

/// Ordered events delivered to this client's session.
pub struct EventStream {
    inner: mpsc::UnboundedReceiver<Bytes>,
}

impl EventStream {
    /// Receives the next event, in publication order.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inner.recv().await
    }
}

/// A client handle to a Cohort cluster.
pub struct CohortClient {
    shared: Arc<Shared>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<cohort_protocol::client::PublishMessage>>>,
}

impl CohortClient {
    /// Connects to the first reachable member.
    pub async fn connect(members: Vec<SocketAddr>) -> Result<Self, ClientError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut connection = None;
        for address in &members {
            match Connection::open(*address, events_tx.clone()).await {
                Ok(opened) => {
                    connection = Some(opened);
                    break;
                }
                Err(error) => debug!(%address, "connect failed: {error}"),
            }
        }
        let connection = connection.ok_or(ClientError::Unreachable)?;

        Ok(Self {
            shared: Arc::new(Shared {
                connection: Mutex::new(Arc::new(connection)),
                members: Mutex::new(members),
                leader: Mutex::new(None),
                session: Mutex::new(None),
                connection_id: rand::random::<u64>().max(1),
                events_tx,
            }),
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Registers a session and starts the keep-alive loop. `timeout` of
    /// zero requests the cluster default.
    pub async fn register(
        &self,
        client: impl Into<String>,
        timeout: Duration,
    ) -> Result<SessionId, ClientError> {
        let request = ClientRequest::Register(RegisterRequest {
            client: client.into(),
            timeout: timeout.as_millis() as u64,
        });

        let response = self.request_with_retry(request).await?;
        let ClientResponse::Register(response) = response else {
            return Err(ClientError::ConnectionLost);
        };
        if let Status::Error(kind) = response.status {
            return Err(ClientError::Cluster(kind));
        }

        self.learn_members(response.leader, &response.members);
        let state = Arc::new(SessionState {
            id: response.session,
            timeout: response.timeout,
            sequence: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            event_index: AtomicU64::new(0),
            last_index: AtomicU64::new(response.session),
        });
        *self.shared.session.lock() = Some(state.clone());

        // Bind the session to this connection for event delivery.
        let connect = ClientRequest::Connect(ConnectRequest {
            session: state.id,
            connection: self.shared.connection_id,
        });
        let _ = self.request_with_retry(connect).await;

        // Keep-alive at half the session timeout.
        let shared = self.shared.clone();
        let interval = Duration::from_millis((state.timeout / 2).max(100));
        tokio::spawn(keep_alive_loop(shared, state.clone(), interval));

        Ok(state.id)
    }

    /// Returns the ordered event stream for this session. May be taken
    /// once.
    pub fn events(&self) -> Option<EventStream> {
        let mut raw = self.events_rx.lock().take()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = self.shared.clone();

        tokio::spawn(async move {
            while let Some(message) = raw.recv().await {
                let Some(session) = shared.session.lock().clone() else {
                    continue;
                };
                if message.session != session.id {
                    continue;
                }
                // Only in-order batches are accepted; gaps are redelivered
                // after the next keep-alive reports the old index.
                let current = session.event_index.load(Ordering::Acquire);
                if message.previous_index != current {
                    debug!(
                        expected = current,
                        got = message.previous_index,
                        "event gap; awaiting resend"
                    );
                    continue;
                }
                session
                    .event_index
                    .store(message.event_index, Ordering::Release);
                for event in message.events {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            }
        });

        Some(EventStream { inner: rx })
    }

    /// Submits a command, retrying across leader changes and sequence
    /// rejections.
    pub async fn submit(&self, payload: Bytes) -> Result<Bytes, ClientError> {
        let session = self.session()?;
        let sequence = session.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        self.submit_with_sequence(&session, sequence, payload).await
    }

    async fn submit_with_sequence(
        &self,
        session: &Arc<SessionState>,
        mut sequence: u64,
        payload: Bytes,
    ) -> Result<Bytes, ClientError> {
        for _ in 0..MAX_RETRIES {
            let request = ClientRequest::Command(CommandRequest {
                session: session.id,
                sequence,
                payload: payload.clone(),
            });
            let response = self.request_with_retry(request).await?;
            let ClientResponse::Command(response) = response else {
                return Err(ClientError::ConnectionLost);
            };

            match response.status {
                Status::Ok => {
                    session.completed.fetch_max(sequence, Ordering::AcqRel);
                    session
                        .last_index
                        .fetch_max(response.index, Ordering::AcqRel);
                    return Ok(response.result.unwrap_or_default());
                }
                Status::Error(ErrorKind::CommandError) => {
                    // The server tells us the last sequence it has seen;
                    // resubmit just past it.
                    let last = response.last_sequence.unwrap_or(sequence);
                    sequence = last + 1;
                    session.sequence.fetch_max(sequence, Ordering::AcqRel);
                }
                Status::Error(ErrorKind::NoLeader) => {
                    self.learn_leader(response.leader);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Status::Error(kind) => return Err(ClientError::Cluster(kind)),
            }
        }
        Err(ClientError::Unreachable)
    }

    /// Executes a query at the given consistency level.
    pub async fn query(
        &self,
        payload: Bytes,
        consistency: Consistency,
    ) -> Result<Bytes, ClientError> {
        let session = self.session()?;
        let request = ClientRequest::Query(QueryRequest {
            session: session.id,
            sequence: session.sequence.load(Ordering::Acquire),
            index: session.last_index.load(Ordering::Acquire),
            consistency,
            payload,
        });

        let response = self.request_with_retry(request).await?;
        let ClientResponse::Query(response) = response else {
            return Err(ClientError::ConnectionLost);
        };
        match response.status {
            Status::Ok => {
                session
                    .last_index
                    .fetch_max(response.index, Ordering::AcqRel);
                Ok(response.result.unwrap_or_default())
            }
            Status::Error(kind) => Err(ClientError::Cluster(kind)),
        }
    }

    /// Closes the session.
    pub async fn close(&self) -> Result<(), ClientError> {
        let session = self.session()?;
        let request = ClientRequest::Unregister(UnregisterRequest {
            session: session.id,
        });
        let response = self.request_with_retry(request).await?;
        let ClientResponse::Unregister(response) = response else {
            return Err(ClientError::ConnectionLost);
        };
        *self.shared.session.lock() = None;
        match response.status {
            Status::Ok => Ok(()),
            Status::Error(kind) => Err(ClientError::Cluster(kind)),
        }
    }

    fn session(&self) -> Result<Arc<SessionState>, ClientError> {
        self.shared
            .session
            .lock()
            .clone()
            .ok_or(ClientError::NoSession)
    }

    fn learn_members(&self, leader: Option<SocketAddr>, members: &[SocketAddr]) {
        if !members.is_empty() {
            *self.shared.members.lock() = members.to_vec();
        }
        self.learn_leader(leader);
    }

    fn learn_leader(&self, leader: Option<SocketAddr>) {
        if leader.is_some() {
            *self.shared.leader.lock() = leader;
        }
    }

    /// Sends a request, reconnecting to the leader or another member on
    /// failure.
    async fn request_with_retry(
        &self,
        request: ClientRequest,
    ) -> Result<ClientResponse, ClientError> {
        for attempt in 0..MAX_RETRIES {
            let connection = self.shared.connection.lock().clone();
            if let Some(response) = connection.request(request.clone()).await {
                return Ok(response);
            }

            // The connection died; prefer the known leader, then walk
            // the member list.
            warn!(attempt, "connection lost; reconnecting");
            let mut candidates = Vec::new();
            if let Some(leader) = *self.shared.leader.lock() {
                candidates.push(leader);
            }
            candidates.extend(
                self.shared
                    .members
                    .lock()
                    .iter()
                    .copied()
                    .filter(|a| *a != connection.address()),
            );

            let mut reconnected = false;
            for address in candidates {
                if let Ok(opened) =
                    Connection::open(address, self.shared.events_tx.clone()).await
                {
                    let opened = Arc::new(opened);
                    *self.shared.connection.lock() = opened.clone();
                    reconnected = true;

                    // Re-bind the session on the new connection.
                    if let Some(session) = self.shared.session.lock().clone() {
                        let _ = opened
                            .request(ClientRequest::Connect(ConnectRequest {
                                session: session.id,
                                connection: self.shared.connection_id,
                            }))
                            .await;
                    }
                    break;
                }
            }
            if !reconnected {
                tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
            }
        }
        Err(ClientError::Unreachable)
    }
}

/// Periodically renews the session and acknowledges received events.
async fn keep_alive_loop(shared: Arc<Shared>, session: Arc<SessionState>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;

        // Stop once the session is closed or replaced.
        let current = shared.session.lock().clone();
        match current {
            Some(active) if Arc::ptr_eq(&active, &session) => {}
            _ => return,
        }

        let ack = SessionAck {
            session: session.id,
            command_sequence: session.completed.load(Ordering::Acquire),
            event_index: session.event_index.load(Ordering::Acquire),
            connection: shared.connection_id,
        };
        let request = ClientRequest::KeepAlive(KeepAliveRequest {
            sessions: vec![ack],
        });

        let connection = shared.connection.lock().clone();
        match connection.request(request).await {
            Some(ClientResponse::KeepAlive(response)) => {
                if let Status::Error(kind) = response.status {
                    warn!("keep-alive rejected: {kind}");
                }
            }
            Some(_) | None => debug!("keep-alive dropped"),
        }
    }
}
