//! Client sessions.
//!
//! A session is the unit of linearizability: commands carry a per-session
//! sequence number, responses are cached per sequence for replay, and
//! events published by the state machine are queued per session and
//! delivered in order until acknowledged.
//!
//! Session state is owned by the state-machine executor and mutated only
//! during applies. The one exception is the request sequence number,
//! which the leader's request plane reads and advances across contexts;
//! it is an atomic with compare-and-set semantics.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use cohort_common::{ConnectionId, ErrorKind, LogIndex, SessionId, Timestamp};
use cohort_protocol::client::PublishMessage;

/// The lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The session is live.
    Open,
    /// The session timed out at apply time.
    Expired,
    /// The session was closed by the client.
    Closed,
}

/// The cached outcome of one command or query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    /// The log index the operation was applied at.
    pub index: LogIndex,
    /// The session's event index when the operation executed.
    pub event_index: u64,
    /// The state machine's output, or the error kind it failed with.
    pub result: Result<Bytes, ErrorKind>,
}

/// A batch of events published at one log index.
#[derive(Debug, Clone)]
pub struct EventBatch {
    /// The index the events were published at.
    pub event_index: u64,
    /// The index of the previous batch, for gap detection.
    pub previous_index: u64,
    /// The event payloads.
    pub events: Vec<Bytes>,
    /// The timestamp of the publishing entry.
    pub timestamp: Timestamp,
}

impl EventBatch {
    /// Converts the batch into a publish message for a session.
    pub fn to_message(&self, session: SessionId) -> PublishMessage {
        PublishMessage {
            session,
            event_index: self.event_index,
            previous_index: self.previous_index,
            events: self.events.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// A command applied ahead of its predecessors, waiting for the sequence
/// gap to fill.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    /// The command's log index.
    pub index: LogIndex,
    /// The entry timestamp.
    pub timestamp: Timestamp,
    /// The operation payload.
    pub payload: Bytes,
}

/// A single client session.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    client: String,
    timeout: u64,
    timestamp: Timestamp,
    state: SessionState,
    /// Highest command sequence applied to the state machine.
    command_sequence: u64,
    /// Leader-side admission gate; see [`Session::set_request_sequence`].
    request_sequence: Arc<AtomicU64>,
    /// Highest event index published to the session.
    event_index: u64,
    /// Highest log index whose effects the session has observed.
    last_applied: LogIndex,
    connection: ConnectionId,
    results: HashMap<u64, OperationResult>,
    events: VecDeque<EventBatch>,
    /// Commands whose sequence arrived ahead of its predecessors.
    queued_commands: BTreeMap<u64, QueuedCommand>,
}

impl Session {
    /// Creates a new open session.
    pub fn new(id: SessionId, client: String, timeout: u64, timestamp: Timestamp) -> Self {
        Self {
            id,
            client,
            timeout,
            timestamp,
            state: SessionState::Open,
            command_sequence: 0,
            request_sequence: Arc::new(AtomicU64::new(0)),
            event_index: 0,
            last_applied: 0,
            connection: 0,
            results: HashMap::new(),
            events: VecDeque::new(),
            queued_commands: BTreeMap::new(),
        }
    }

    /// Returns the session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Returns the client-chosen name.
    pub fn client(&self) -> &str {
        &self.client
    }

    /// Returns the session timeout in milliseconds.
    pub fn timeout(&self) -> u64 {
        self.timeout
    }

    /// Returns the last liveness timestamp.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Updates the liveness timestamp, which never moves backwards.
    pub fn touch(&mut self, timestamp: Timestamp) {
        self.timestamp = self.timestamp.max(timestamp);
    }

    /// Returns the session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns true if the session can accept operations.
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Returns true if the session's idle time exceeds its timeout at the
    /// given apply-time clock.
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now.saturating_sub(self.timestamp) > self.timeout
    }

    /// Marks the session expired.
    pub fn expire(&mut self) {
        self.state = SessionState::Expired;
    }

    /// Marks the session closed.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Returns the bound connection, or 0 when unbound.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Binds the session to a connection. Last writer wins: a new
    /// connection silently replaces the old one.
    pub fn bind(&mut self, connection: ConnectionId) {
        self.connection = connection;
    }

    /// Returns a shared handle to the request-sequence gate for
    /// cross-context admission checks.
    pub fn request_sequence_handle(&self) -> Arc<AtomicU64> {
        self.request_sequence.clone()
    }

    /// Returns the highest admitted request sequence.
    pub fn request_sequence(&self) -> u64 {
        self.request_sequence.load(Ordering::Acquire)
    }

    /// Admits a request sequence: succeeds iff `sequence` is greater than
    /// the current value. Used by the leader to gate duplicate and
    /// out-of-order submissions.
    pub fn set_request_sequence(&self, sequence: u64) -> bool {
        advance(&self.request_sequence, sequence)
    }

    /// Resets the request sequence to at least `sequence`, as applied
    /// from keep-alive entries after a leader change.
    pub fn reset_request_sequence(&self, sequence: u64) {
        self.request_sequence.fetch_max(sequence, Ordering::AcqRel);
    }

    /// Returns the highest applied command sequence.
    pub fn command_sequence(&self) -> u64 {
        self.command_sequence
    }

    /// Returns the next command sequence the session expects.
    pub fn next_command_sequence(&self) -> u64 {
        self.command_sequence + 1
    }

    /// Advances the applied command sequence; it never moves backwards.
    pub fn set_command_sequence(&mut self, sequence: u64) {
        if sequence > self.command_sequence {
            self.command_sequence = sequence;
        }
        self.reset_request_sequence(sequence);
    }

    /// Returns the highest log index the session has observed.
    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Advances the session's applied index.
    pub fn set_last_applied(&mut self, index: LogIndex) {
        if index > self.last_applied {
            self.last_applied = index;
        }
    }

    /// Caches the result of a command by its sequence number.
    pub fn register_result(&mut self, sequence: u64, result: OperationResult) {
        self.results.insert(sequence, result);
    }

    /// Returns the cached result for a sequence, if still held.
    pub fn result(&self, sequence: u64) -> Option<&OperationResult> {
        self.results.get(&sequence)
    }

    /// Discards cached results up to and including `sequence`, bounding
    /// the response cache to what the client may still retransmit.
    pub fn clear_results(&mut self, sequence: u64) {
        self.results.retain(|&s, _| s > sequence);
    }

    /// Returns the number of cached results.
    pub fn cached_results(&self) -> usize {
        self.results.len()
    }

    /// Queues a command that arrived ahead of its predecessors.
    pub fn queue_command(&mut self, sequence: u64, command: QueuedCommand) {
        self.queued_commands.insert(sequence, command);
    }

    /// Removes and returns the queued command for `sequence`, if any.
    pub fn take_queued_command(&mut self, sequence: u64) -> Option<QueuedCommand> {
        self.queued_commands.remove(&sequence)
    }

    /// Returns the highest published event index.
    pub fn event_index(&self) -> u64 {
        self.event_index
    }

    /// Restores the event index from a snapshot.
    pub fn restore_event_index(&mut self, index: u64) {
        self.event_index = index;
    }

    /// Queues a batch of events published at `index` and returns the
    /// batch for delivery.
    pub fn publish(
        &mut self,
        index: LogIndex,
        events: Vec<Bytes>,
        timestamp: Timestamp,
    ) -> &EventBatch {
        let batch = EventBatch {
            event_index: index,
            previous_index: self.event_index,
            events,
            timestamp,
        };
        self.event_index = index;
        self.events.push_back(batch);
        self.events.back().expect("just pushed")
    }

    /// Discards delivered batches up to and including `index`.
    pub fn ack_events(&mut self, index: u64) {
        while self
            .events
            .front()
            .is_some_and(|batch| batch.event_index <= index)
        {
            self.events.pop_front();
        }
    }

    /// Returns the batches that remain undelivered past `index`, for
    /// resend after a reconnect.
    pub fn events_after(&self, index: u64) -> impl Iterator<Item = &EventBatch> {
        self.events
            .range(..)
            .filter(move |batch| batch.event_index > index)
    }

    /// Returns the highest index through which the client has completed
    /// all events: the predecessor of the oldest unacknowledged batch, or
    /// the session's applied index when nothing is pending.
    pub fn last_completed(&self) -> LogIndex {
        self.events
            .front()
            .map(|batch| batch.previous_index)
            .unwrap_or(self.last_applied)
    }
}

fn advance(gate: &AtomicU64, sequence: u64) -> bool {
    let mut current = gate.load(Ordering::Acquire);
    loop {
        if sequence <= current {
            return false;
        }
        match gate.compare_exchange_weak(
            current,
            sequence,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
}

/// A shared view of request-sequence gates, readable from the request
/// plane without touching executor-owned session state.
#[derive(Debug, Default, Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<SessionId, Arc<AtomicU64>>>>,
}

impl SessionRegistry {
    /// Registers a session's gate.
    pub fn register(&self, session: SessionId, gate: Arc<AtomicU64>) {
        self.inner.write().insert(session, gate);
    }

    /// Removes a session's gate.
    pub fn unregister(&self, session: SessionId) {
        self.inner.write().remove(&session);
    }

    /// Returns true if the session is known.
    pub fn contains(&self, session: SessionId) -> bool {
        self.inner.read().contains_key(&session)
    }

    /// Attempts to admit a request sequence for a session.
    ///
    /// Returns `Err` with the last admitted sequence when the submission
    /// is a duplicate or out of order, letting the caller build a
    /// `CommandError` response.
    pub fn try_admit(&self, session: SessionId, sequence: u64) -> Result<(), u64> {
        let gate = match self.inner.read().get(&session) {
            Some(gate) => gate.clone(),
            None => return Ok(()),
        };
        if advance(&gate, sequence) {
            Ok(())
        } else {
            Err(gate.load(Ordering::Acquire))
        }
    }
}

/// The session table owned by the state-machine executor.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: HashMap<SessionId, Session>,
    registry: SessionRegistry,
}

impl SessionManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared registry of request-sequence gates.
    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }

    /// Registers a new session.
    pub fn register(
        &mut self,
        id: SessionId,
        client: String,
        timeout: u64,
        timestamp: Timestamp,
    ) -> &mut Session {
        let session = Session::new(id, client, timeout, timestamp);
        self.registry.register(id, session.request_sequence_handle());
        self.sessions.entry(id).or_insert(session)
    }

    /// Removes a session.
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        self.registry.unregister(id);
        self.sessions.remove(&id)
    }

    /// Returns a session by id.
    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Returns a mutable session by id.
    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Iterates over all sessions.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Iterates mutably over all sessions.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    /// Returns the session ids currently registered, sorted.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Returns the number of sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Removes all sessions, as before a snapshot install.
    pub fn clear(&mut self) {
        for id in self.ids() {
            self.registry.unregister(id);
        }
        self.sessions.clear();
    }
}
