//! The state-machine executor.
//!
//! A single-threaded applicator that feeds committed entries to the user
//! state machine in strict index order. The executor owns the session
//! table and the scheduled-task list, advances a deterministic clock from
//! entry timestamps, expires sessions at apply time, publishes session
//! events, and drives the snapshot lifecycle.
//!
//! Apply sequence for each committed entry:
//! 1. advance the clock to `max(clock, entry.timestamp)`;
//! 2. fire scheduled tasks whose time has come, rescheduling repeating
//!    ones;
//! 3. expire sessions whose deadline has passed;
//! 4. dispatch on the entry variant;
//! 5. drain side-effect callbacks and publish events at the entry index;
//! 6. take a snapshot when the interval has elapsed, complete it once all
//!    sessions have acknowledged events through its index, and install a
//!    newer completed snapshot before the next apply.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use cohort_common::{ErrorKind, LogIndex, SessionId, Timestamp};
use cohort_protocol::entry::{Entry, Indexed, SessionAck};
use cohort_storage::{PendingSnapshot, SnapshotStore};

use crate::session::{OperationResult, QueuedCommand, SessionManager, SessionRegistry};
use crate::state_machine::{ApplyServices, Commit, OperationKind, StateMachine};

/// The id under which the replicated state machine snapshots itself.
pub const STATE_MACHINE_ID: u64 = 1;

/// Interval between snapshots, in deterministic-clock milliseconds.
pub const SNAPSHOT_INTERVAL_MS: u64 = 10 * 60 * 1000;

/// An event batch addressed to a session's bound connection.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    /// The session the events belong to.
    pub session: SessionId,
    /// The connection the session is bound to (0 when unbound).
    pub connection: u64,
    /// The publish message to deliver.
    pub message: cohort_protocol::client::PublishMessage,
}

/// A command result ready to complete a waiting client request.
#[derive(Debug, Clone)]
pub struct CommandCompletion {
    /// The log index of the command entry.
    pub index: LogIndex,
    /// The submitting session.
    pub session: SessionId,
    /// The command sequence.
    pub sequence: u64,
    /// The result to return.
    pub result: OperationResult,
}

/// A released query result, tagged with the caller's correlation value.
#[derive(Debug, Clone)]
pub struct QueryCompletion {
    /// The caller-supplied tag.
    pub tag: u64,
    /// The result to return.
    pub result: OperationResult,
}

struct ScheduledTask<S> {
    time: Timestamp,
    interval: u64,
    callback: Box<dyn FnMut(&mut S) + Send>,
}

struct PendingQuery {
    tag: u64,
    session: SessionId,
    sequence: u64,
    index: LogIndex,
    payload: Bytes,
}

/// The executor.
pub struct StateMachineExecutor<S: StateMachine> {
    machine: S,
    sessions: SessionManager,
    snapshots: Arc<SnapshotStore>,
    /// Deterministic clock: the maximum entry timestamp observed.
    clock: Timestamp,
    last_applied: LogIndex,
    tasks: Vec<ScheduledTask<S>>,
    pending_queries: Vec<PendingQuery>,
    pending_snapshot: Option<PendingSnapshot>,
    snapshot_time: Timestamp,
    snapshot_index: LogIndex,
    events_out: Vec<SessionEvent>,
    commands_out: Vec<CommandCompletion>,
    queries_out: Vec<QueryCompletion>,
}

impl<S: StateMachine> StateMachineExecutor<S> {
    /// Creates an executor over the given machine and snapshot store.
    pub fn new(machine: S, snapshots: Arc<SnapshotStore>) -> Self {
        Self {
            machine,
            sessions: SessionManager::new(),
            snapshots,
            clock: 0,
            last_applied: 0,
            tasks: Vec::new(),
            pending_queries: Vec::new(),
            pending_snapshot: None,
            snapshot_time: 0,
            snapshot_index: 0,
            events_out: Vec::new(),
            commands_out: Vec::new(),
            queries_out: Vec::new(),
        }
    }

    /// Returns the deterministic clock.
    pub fn clock(&self) -> Timestamp {
        self.clock
    }

    /// Returns the highest applied index.
    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Returns the session table.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Returns the mutable session table.
    pub fn sessions_mut(&mut self) -> &mut SessionManager {
        &mut self.sessions
    }

    /// Returns the shared request-sequence registry.
    pub fn registry(&self) -> SessionRegistry {
        self.sessions.registry()
    }

    /// Returns the user state machine.
    pub fn machine(&self) -> &S {
        &self.machine
    }

    /// Drains events published since the last call.
    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events_out)
    }

    /// Drains command completions since the last call.
    pub fn take_command_completions(&mut self) -> Vec<CommandCompletion> {
        std::mem::take(&mut self.commands_out)
    }

    /// Drains query completions since the last call.
    pub fn take_query_completions(&mut self) -> Vec<QueryCompletion> {
        std::mem::take(&mut self.queries_out)
    }

    /// Installs the latest complete snapshot if it is newer than the
    /// executor's applied state, as after receiving one from the leader.
    pub fn install_snapshot_if_newer(&mut self, index: LogIndex) {
        self.maybe_install_snapshot(index);
    }

    /// Applies one committed entry. Entries must arrive in strict index
    /// order; gaps from skipped indices are the caller's to elide.
    pub fn apply(&mut self, indexed: &Indexed<Entry>) {
        let index = indexed.index;
        let timestamp = indexed.entry.timestamp();
        if index <= self.last_applied {
            return;
        }

        self.maybe_install_snapshot(index);
        // The snapshot may already cover this entry.
        if index <= self.last_applied {
            return;
        }
        self.tick(index, timestamp);

        match &indexed.entry {
            Entry::Initialize { .. } | Entry::Configuration { .. } => {}
            Entry::OpenSession {
                timestamp,
                client,
                timeout,
            } => self.apply_open_session(index, *timestamp, client.clone(), *timeout),
            Entry::KeepAlive {
                timestamp,
                sessions,
            } => self.apply_keep_alive(index, *timestamp, sessions),
            Entry::CloseSession {
                timestamp,
                session,
                expired,
            } => self.apply_close_session(index, *timestamp, *session, *expired),
            Entry::Command {
                timestamp,
                session,
                sequence,
                payload,
            } => self.apply_command(index, *timestamp, *session, *sequence, payload.clone()),
            Entry::Query {
                timestamp,
                session,
                sequence,
                payload,
            } => self.apply_logged_query(index, *timestamp, *session, *sequence, payload.clone()),
            Entry::Metadata { .. } => {}
        }

        self.last_applied = index;
        self.release_queries();
    }

    /// Submits a query for execution against committed state.
    ///
    /// The query waits until the session has applied the client's own
    /// writes (`command_sequence >= sequence - 1`) and caught up to the
    /// requested index; `tag` correlates the eventual completion.
    pub fn submit_query(
        &mut self,
        tag: u64,
        session: SessionId,
        sequence: u64,
        index: LogIndex,
        payload: Bytes,
    ) {
        let Some(state) = self.sessions.get(session) else {
            self.queries_out.push(QueryCompletion {
                tag,
                result: OperationResult {
                    index: 0,
                    event_index: 0,
                    result: Err(ErrorKind::UnknownSession),
                },
            });
            return;
        };

        let ready = state.command_sequence() + 1 >= sequence && state.last_applied() >= index;
        if ready {
            let result = self.execute_query(session, payload);
            self.queries_out.push(QueryCompletion { tag, result });
        } else {
            self.pending_queries.push(PendingQuery {
                tag,
                session,
                sequence,
                index,
                payload,
            });
        }
    }

    /// Advances time, fires due scheduled tasks, expires idle sessions,
    /// and moves the snapshot lifecycle along.
    fn tick(&mut self, index: LogIndex, timestamp: Timestamp) {
        self.clock = self.clock.max(timestamp);

        // Fire expired tasks in time order; the list is kept sorted on
        // insertion.
        let mut fired = 0;
        while fired < self.tasks.len() && self.tasks[fired].time <= self.clock {
            fired += 1;
        }
        if fired > 0 {
            let due: Vec<ScheduledTask<S>> = self.tasks.drain(..fired).collect();
            for mut task in due {
                (task.callback)(&mut self.machine);
                if task.interval > 0 {
                    task.time = self.clock + task.interval;
                    self.insert_task(task);
                }
            }
        }

        self.maybe_complete_snapshot(index);
        self.expire_sessions(index);
    }

    fn insert_task(&mut self, task: ScheduledTask<S>) {
        let at = self.tasks.partition_point(|t| t.time <= task.time);
        self.tasks.insert(at, task);
    }

    fn expire_sessions(&mut self, _index: LogIndex) {
        let clock = self.clock;
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|s| s.is_open() && s.is_expired_at(clock))
            .map(|s| s.id())
            .collect();

        for id in expired {
            info!(session = id, "expiring session");
            if let Some(mut session) = self.sessions.remove(id) {
                session.expire();
            }
            self.machine.expire(id);
            self.machine.close(id);
        }
    }

    fn apply_open_session(
        &mut self,
        index: LogIndex,
        timestamp: Timestamp,
        client: String,
        timeout: u64,
    ) {
        debug!(session = index, client = %client, "registering session");
        let session = self.sessions.register(index, client, timeout, timestamp);
        session.set_last_applied(index);
        self.machine.register(index);
    }

    fn apply_keep_alive(&mut self, index: LogIndex, timestamp: Timestamp, acks: &[SessionAck]) {
        for ack in acks {
            let Some(session) = self.sessions.get_mut(ack.session) else {
                continue;
            };
            session.touch(timestamp);
            session.clear_results(ack.command_sequence);
            session.ack_events(ack.event_index);
            session.reset_request_sequence(ack.command_sequence);
            session.set_command_sequence(ack.command_sequence);
            session.set_last_applied(index);
            if ack.connection != 0 {
                session.bind(ack.connection);
            }

            // Resend batches the client has not yet acknowledged.
            let connection = session.connection();
            let resend: Vec<_> = session
                .events_after(ack.event_index)
                .map(|batch| batch.to_message(ack.session))
                .collect();
            for message in resend {
                self.events_out.push(SessionEvent {
                    session: ack.session,
                    connection,
                    message,
                });
            }
        }
    }

    fn apply_close_session(
        &mut self,
        _index: LogIndex,
        _timestamp: Timestamp,
        id: SessionId,
        expired: bool,
    ) {
        debug!(session = id, expired, "closing session");
        if let Some(mut session) = self.sessions.remove(id) {
            if expired {
                session.expire();
            } else {
                session.close();
            }
        }
        if expired {
            self.machine.expire(id);
        }
        self.machine.close(id);
    }

    fn apply_command(
        &mut self,
        index: LogIndex,
        timestamp: Timestamp,
        session_id: SessionId,
        sequence: u64,
        payload: Bytes,
    ) {
        let Some(session) = self.sessions.get_mut(session_id) else {
            self.commands_out.push(CommandCompletion {
                index,
                session: session_id,
                sequence,
                result: OperationResult {
                    index,
                    event_index: 0,
                    result: Err(ErrorKind::UnknownSession),
                },
            });
            return;
        };
        session.touch(timestamp);

        // A sequence below the next expected one is a replay: serve the
        // cached response without re-invoking the state machine. A missing
        // cached result means the client already acknowledged it; a null
        // result is benign.
        if sequence > 0 && sequence < session.next_command_sequence() {
            let result = session.result(sequence).cloned().unwrap_or(OperationResult {
                index,
                event_index: session.event_index(),
                result: Ok(Bytes::new()),
            });
            self.commands_out.push(CommandCompletion {
                index,
                session: session_id,
                sequence,
                result,
            });
            return;
        }

        // A sequence ahead of the next expected one waits for its
        // predecessors.
        if sequence > session.next_command_sequence() {
            session.queue_command(
                sequence,
                QueuedCommand {
                    index,
                    timestamp,
                    payload,
                },
            );
            return;
        }

        self.execute_command(index, timestamp, session_id, sequence, payload);

        // Release any successors that were waiting on this sequence.
        loop {
            let next = match self.sessions.get_mut(session_id) {
                Some(session) => {
                    let next = session.next_command_sequence();
                    match session.take_queued_command(next) {
                        Some(queued) => Some((next, queued)),
                        None => None,
                    }
                }
                None => None,
            };
            match next {
                Some((sequence, queued)) => {
                    self.execute_command(
                        queued.index,
                        queued.timestamp,
                        session_id,
                        sequence,
                        queued.payload,
                    );
                }
                None => break,
            }
        }

        self.maybe_take_snapshot(index);
    }

    fn execute_command(
        &mut self,
        index: LogIndex,
        timestamp: Timestamp,
        session_id: SessionId,
        sequence: u64,
        payload: Bytes,
    ) {
        let event_index_before = match self.sessions.get(session_id) {
            Some(session) if session.is_open() => session.event_index(),
            _ => {
                self.commands_out.push(CommandCompletion {
                    index,
                    session: session_id,
                    sequence,
                    result: OperationResult {
                        index,
                        event_index: 0,
                        result: Err(ErrorKind::UnknownSession),
                    },
                });
                return;
            }
        };

        let mut services = ApplyServices::new(self.clock);
        let mut commit = Commit {
            index,
            session: session_id,
            timestamp,
            kind: OperationKind::Command,
            payload: &payload,
            services: &mut services,
        };

        let applied = self.machine.apply(&mut commit);
        let result = match applied {
            Ok(bytes) => Ok(bytes),
            Err(error) => {
                warn!(session = session_id, sequence, "state machine error: {error}");
                Err(ErrorKind::ApplicationError)
            }
        };

        // Drain side-effect callbacks queued during the apply.
        for task in services.tasks.drain(..) {
            task(&mut self.machine);
        }
        for request in services.schedules.drain(..) {
            let task = ScheduledTask {
                time: self.clock + request.delay,
                interval: request.interval,
                callback: request.callback,
            };
            self.insert_task(task);
        }

        // Publish events at the command's index, one batch per session.
        let mut by_session: Vec<(SessionId, Vec<Bytes>)> = Vec::new();
        for (target, event) in services.events.drain(..) {
            match by_session.iter_mut().find(|(id, _)| *id == target) {
                Some((_, events)) => events.push(event),
                None => by_session.push((target, vec![event])),
            }
        }
        for (target, events) in by_session {
            if let Some(session) = self.sessions.get_mut(target) {
                let batch = session.publish(index, events, timestamp);
                let message = batch.to_message(target);
                let connection = session.connection();
                self.events_out.push(SessionEvent {
                    session: target,
                    connection,
                    message,
                });
            }
        }

        let session = self
            .sessions
            .get_mut(session_id)
            .expect("checked open above");
        let operation_result = OperationResult {
            index,
            event_index: event_index_before,
            result,
        };
        if sequence > 0 {
            session.register_result(sequence, operation_result.clone());
            session.set_command_sequence(sequence);
        }
        session.set_last_applied(index);

        self.commands_out.push(CommandCompletion {
            index,
            session: session_id,
            sequence,
            result: operation_result,
        });
    }

    fn apply_logged_query(
        &mut self,
        index: LogIndex,
        timestamp: Timestamp,
        session_id: SessionId,
        _sequence: u64,
        payload: Bytes,
    ) {
        // Queries reach the log only when the submitter required a log
        // round-trip; they execute without mutating session sequencing.
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.touch(timestamp);
            session.set_last_applied(index);
        }
        let _ = self.execute_query(session_id, payload);
    }

    fn execute_query(&mut self, session_id: SessionId, payload: Bytes) -> OperationResult {
        let Some(session) = self.sessions.get(session_id) else {
            return OperationResult {
                index: 0,
                event_index: 0,
                result: Err(ErrorKind::UnknownSession),
            };
        };
        let index = session.last_applied();
        let event_index = session.event_index();

        let mut services = ApplyServices::new(self.clock);
        let mut commit = Commit {
            index,
            session: session_id,
            timestamp: self.clock,
            kind: OperationKind::Query,
            payload: &payload,
            services: &mut services,
        };

        let result = match self.machine.apply(&mut commit) {
            Ok(bytes) => Ok(bytes),
            Err(_) => Err(ErrorKind::ApplicationError),
        };

        OperationResult {
            index,
            event_index,
            result,
        }
    }

    fn release_queries(&mut self) {
        if self.pending_queries.is_empty() {
            return;
        }

        let mut ready = Vec::new();
        let mut waiting = Vec::new();
        for pending in self.pending_queries.drain(..) {
            match self.sessions.get(pending.session) {
                None => {
                    // The session went away while the query waited.
                    ready.push((pending.tag, None));
                }
                Some(session) => {
                    if session.command_sequence() + 1 >= pending.sequence
                        && session.last_applied() >= pending.index
                    {
                        ready.push((pending.tag, Some((pending.session, pending.payload))));
                    } else {
                        waiting.push(pending);
                    }
                }
            }
        }
        self.pending_queries = waiting;

        for (tag, query) in ready {
            let result = match query {
                Some((session, payload)) => self.execute_query(session, payload),
                None => OperationResult {
                    index: 0,
                    event_index: 0,
                    result: Err(ErrorKind::UnknownSession),
                },
            };
            self.queries_out.push(QueryCompletion { tag, result });
        }
    }

    fn maybe_take_snapshot(&mut self, index: LogIndex) {
        let due = self.pending_snapshot.is_none()
            && self.clock.saturating_sub(self.snapshot_time) >= SNAPSHOT_INTERVAL_MS;
        if !due {
            return;
        }

        info!(index, "taking snapshot");
        let mut pending = self.snapshots.create_temporary(STATE_MACHINE_ID, index);
        {
            let mut writer = pending.writer();
            let ids = self.sessions.ids();
            writer.write_u32(ids.len() as u32);
            for id in ids {
                let session = self.sessions.get(id).expect("listed id");
                writer.write_u64(session.id());
                writer.write_bytes(session.client().as_bytes());
                writer.write_u64(session.timeout());
                writer.write_u64(session.timestamp());
                writer.write_u64(session.command_sequence());
                writer.write_u64(session.event_index());
            }
            self.machine.snapshot(&mut writer);
        }

        if let Err(error) = pending.persist() {
            // Discard and retry at the next interval.
            warn!("snapshot persist failed: {error}");
            self.snapshots.discard(pending);
            self.snapshot_time = self.clock;
            return;
        }

        self.snapshot_time = self.clock;
        self.pending_snapshot = Some(pending);
        self.maybe_complete_snapshot(index);
    }

    fn maybe_complete_snapshot(&mut self, index: LogIndex) {
        let Some(pending) = &self.pending_snapshot else {
            return;
        };

        let mut last_completed = index;
        for session in self.sessions.iter() {
            last_completed = last_completed.min(session.last_completed());
        }
        if last_completed < pending.index() {
            return;
        }

        let pending = self.pending_snapshot.take().expect("checked above");
        let snapshot_index = pending.index();
        match self.snapshots.complete(pending) {
            Ok(_) => {
                debug!(index = snapshot_index, "snapshot complete");
                self.snapshot_index = snapshot_index;
            }
            Err(error) => warn!("snapshot completion failed: {error}"),
        }
    }

    fn maybe_install_snapshot(&mut self, index: LogIndex) {
        let Some(snapshot) = self.snapshots.snapshot_by_id(STATE_MACHINE_ID) else {
            return;
        };
        if snapshot.index() <= self.last_applied {
            // Already reflected in live state; just record it.
            self.snapshot_index = self.snapshot_index.max(snapshot.index());
            return;
        }
        if snapshot.index() <= self.snapshot_index || snapshot.index() > index {
            return;
        }

        info!(index = snapshot.index(), "installing snapshot");
        let mut reader = snapshot.reader();
        let result = (|| -> Result<(), cohort_storage::StorageError> {
            let count = reader.read_u32()?;
            self.sessions.clear();
            for _ in 0..count {
                let id = reader.read_u64()?;
                let client = reader.read_bytes()?;
                let timeout = reader.read_u64()?;
                let timestamp = reader.read_u64()?;
                let command_sequence = reader.read_u64()?;
                let event_index_value = reader.read_u64()?;

                let session = self.sessions.register(
                    id,
                    String::from_utf8_lossy(&client).into_owned(),
                    timeout,
                    timestamp,
                );
                session.set_command_sequence(command_sequence);
                session.restore_event_index(event_index_value);
                session.set_last_applied(snapshot.index());
            }
            Ok(())
        })();

        if let Err(error) = result {
            warn!("snapshot session table corrupt: {error}");
            return;
        }
        if let Err(error) = self.machine.install(&mut reader) {
            warn!("state machine rejected snapshot: {error}");
            return;
        }

        self.snapshot_index = snapshot.index();
        self.last_applied = self.last_applied.max(snapshot.index());
        self.clock = self.clock.max(
            self.sessions
                .iter()
                .map(|s| s.timestamp())
                .max()
                .unwrap_or(self.clock),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{kv, KeyValueMachine};
    use cohort_storage::StorageConfig;

    type Executor = StateMachineExecutor<KeyValueMachine>;

    fn executor() -> Executor {
        let snapshots =
            Arc::new(SnapshotStore::open(StorageConfig::memory("test")).unwrap());
        StateMachineExecutor::new(KeyValueMachine::new(), snapshots)
    }

    fn open_session(executor: &mut Executor, index: LogIndex, timeout: u64) {
        executor.apply(&Indexed::new(
            index,
            1,
            Entry::OpenSession {
                timestamp: index * 10,
                client: format!("client-{index}"),
                timeout,
            },
        ));
    }

    fn command(
        executor: &mut Executor,
        index: LogIndex,
        timestamp: Timestamp,
        session: SessionId,
        sequence: u64,
        payload: Bytes,
    ) {
        executor.apply(&Indexed::new(
            index,
            1,
            Entry::Command {
                timestamp,
                session,
                sequence,
                payload,
            },
        ));
    }

    #[test]
    fn test_open_session_registers() {
        let mut executor = executor();
        open_session(&mut executor, 1, 5000);

        assert_eq!(executor.sessions().len(), 1);
        let session = executor.sessions().get(1).unwrap();
        assert_eq!(session.client(), "client-1");
        assert_eq!(session.last_applied(), 1);
        assert_eq!(executor.last_applied(), 1);
    }

    #[test]
    fn test_command_applies_and_completes() {
        let mut executor = executor();
        open_session(&mut executor, 1, 5000);
        command(&mut executor, 2, 20, 1, 1, kv::op(kv::PUT, "x=1"));

        let completions = executor.take_command_completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].index, 2);
        assert_eq!(completions[0].sequence, 1);
        assert!(completions[0].result.result.is_ok());
        assert_eq!(executor.machine().value("x"), Some("1"));
    }

    #[test]
    fn test_duplicate_command_returns_cached_result() {
        let mut executor = executor();
        open_session(&mut executor, 1, 5000);
        command(&mut executor, 2, 20, 1, 1, kv::op(kv::PUT, "x=1"));
        command(&mut executor, 3, 30, 1, 2, kv::op(kv::PUT, "x=2"));
        executor.take_command_completions();

        let applied_before = executor.machine().applied();

        // The same (session, sequence) replayed: cached result, no
        // further state-machine invocation.
        command(&mut executor, 4, 40, 1, 2, kv::op(kv::PUT, "x=2"));
        let completions = executor.take_command_completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(
            completions[0].result.result.as_ref().unwrap().as_ref(),
            b"1"
        );
        assert_eq!(executor.machine().applied(), applied_before);
        assert_eq!(executor.machine().value("x"), Some("2"));
    }

    #[test]
    fn test_out_of_order_commands_wait_for_gap() {
        let mut executor = executor();
        open_session(&mut executor, 1, 5000);

        // Sequence 3 arrives before sequence 2; it must wait.
        command(&mut executor, 2, 20, 1, 1, kv::op(kv::PUT, "a=1"));
        command(&mut executor, 3, 30, 1, 3, kv::op(kv::PUT, "c=3"));
        executor.take_command_completions();
        assert_eq!(executor.machine().value("c"), None);

        command(&mut executor, 4, 40, 1, 2, kv::op(kv::PUT, "b=2"));
        let completions = executor.take_command_completions();
        assert_eq!(completions.len(), 2);
        assert_eq!(executor.machine().value("b"), Some("2"));
        assert_eq!(executor.machine().value("c"), Some("3"));

        let session = executor.sessions().get(1).unwrap();
        assert_eq!(session.command_sequence(), 3);
    }

    #[test]
    fn test_application_error_is_cached() {
        let mut executor = executor();
        open_session(&mut executor, 1, 5000);
        command(&mut executor, 2, 20, 1, 1, kv::op(99, ""));

        let completions = executor.take_command_completions();
        assert_eq!(
            completions[0].result.result,
            Err(ErrorKind::ApplicationError)
        );

        // Redelivery returns the identical cached error.
        command(&mut executor, 3, 30, 1, 1, kv::op(99, ""));
        let completions = executor.take_command_completions();
        assert_eq!(
            completions[0].result.result,
            Err(ErrorKind::ApplicationError)
        );
    }

    #[test]
    fn test_unknown_session_command() {
        let mut executor = executor();
        command(&mut executor, 1, 10, 99, 1, kv::op(kv::PUT, "x=1"));

        let completions = executor.take_command_completions();
        assert_eq!(completions[0].result.result, Err(ErrorKind::UnknownSession));
    }

    #[test]
    fn test_session_expiration_is_deterministic() {
        let mut executor = executor();
        open_session(&mut executor, 1, 1000); // timestamp 10, timeout 1000

        // Another client's command carries a timestamp past the deadline.
        open_session(&mut executor, 2, 60_000);
        command(&mut executor, 3, 2000, 2, 1, kv::op(kv::PUT, "x=1"));

        assert!(executor.sessions().get(1).is_none());
        assert!(executor.sessions().get(2).is_some());

        // Operations on the expired session now fail.
        command(&mut executor, 4, 2100, 1, 1, kv::op(kv::PUT, "y=1"));
        let completions = executor.take_command_completions();
        let last = completions.last().unwrap();
        assert_eq!(last.result.result, Err(ErrorKind::UnknownSession));
    }

    #[test]
    fn test_keep_alive_defers_expiration() {
        let mut executor = executor();
        open_session(&mut executor, 1, 1000);

        executor.apply(&Indexed::new(
            2,
            1,
            Entry::KeepAlive {
                timestamp: 900,
                sessions: vec![SessionAck {
                    session: 1,
                    command_sequence: 0,
                    event_index: 0,
                    connection: 7,
                }],
            },
        ));

        // 1800 < 900 + 1000, so the session survives.
        open_session(&mut executor, 3, 60_000);
        command(&mut executor, 4, 1800, 3, 1, kv::op(kv::PUT, "x=1"));
        assert!(executor.sessions().get(1).is_some());
        assert_eq!(executor.sessions().get(1).unwrap().connection(), 7);

        // Past the refreshed deadline it expires.
        command(&mut executor, 5, 2000, 3, 2, kv::op(kv::PUT, "x=2"));
        assert!(executor.sessions().get(1).is_none());
    }

    #[test]
    fn test_events_published_in_order() {
        let mut executor = executor();
        open_session(&mut executor, 1, 60_000); // watcher
        open_session(&mut executor, 2, 60_000); // writer
        command(&mut executor, 3, 30, 1, 1, kv::op(kv::WATCH, ""));
        executor.take_events();

        command(&mut executor, 4, 40, 2, 1, kv::op(kv::PUT, "k=1"));
        command(&mut executor, 5, 50, 2, 2, kv::op(kv::PUT, "k=2"));

        let events = executor.take_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].session, 1);
        assert_eq!(events[0].message.event_index, 4);
        assert_eq!(events[0].message.previous_index, 0);
        assert_eq!(events[1].message.event_index, 5);
        assert_eq!(events[1].message.previous_index, 4);

        // The session retains batches until the client acks.
        let session = executor.sessions().get(1).unwrap();
        assert_eq!(session.events_after(0).count(), 2);
    }

    #[test]
    fn test_keep_alive_acks_and_resends_events() {
        let mut executor = executor();
        open_session(&mut executor, 1, 60_000);
        open_session(&mut executor, 2, 60_000);
        command(&mut executor, 3, 30, 1, 1, kv::op(kv::WATCH, ""));
        command(&mut executor, 4, 40, 2, 1, kv::op(kv::PUT, "k=1"));
        command(&mut executor, 5, 50, 2, 2, kv::op(kv::PUT, "k=2"));
        executor.take_events();

        // The client acknowledges the first event only; the second is
        // redelivered.
        executor.apply(&Indexed::new(
            6,
            1,
            Entry::KeepAlive {
                timestamp: 60,
                sessions: vec![SessionAck {
                    session: 1,
                    command_sequence: 1,
                    event_index: 4,
                    connection: 9,
                }],
            },
        ));

        let events = executor.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message.event_index, 5);
        assert_eq!(events[0].connection, 9);

        let session = executor.sessions().get(1).unwrap();
        assert_eq!(session.events_after(0).count(), 1);
    }

    #[test]
    fn test_query_waits_for_session_index() {
        let mut executor = executor();
        open_session(&mut executor, 1, 60_000);
        command(&mut executor, 2, 20, 1, 1, kv::op(kv::PUT, "x=1"));
        executor.take_command_completions();

        // Query at index 4 waits until the session observes index 4.
        executor.submit_query(42, 1, 2, 4, kv::op(kv::GET, "x"));
        assert!(executor.take_query_completions().is_empty());

        command(&mut executor, 3, 30, 1, 2, kv::op(kv::PUT, "x=2"));
        assert!(executor.take_query_completions().is_empty());

        command(&mut executor, 4, 40, 1, 3, kv::op(kv::PUT, "x=3"));
        let completions = executor.take_query_completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].tag, 42);
        assert_eq!(
            completions[0].result.result.as_ref().unwrap().as_ref(),
            b"3"
        );
    }

    #[test]
    fn test_query_ready_immediately() {
        let mut executor = executor();
        open_session(&mut executor, 1, 60_000);
        command(&mut executor, 2, 20, 1, 1, kv::op(kv::PUT, "x=1"));

        executor.submit_query(7, 1, 2, 2, kv::op(kv::GET, "x"));
        let completions = executor.take_query_completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(
            completions[0].result.result.as_ref().unwrap().as_ref(),
            b"1"
        );
        // The query was not logged and did not bump the applied count
        // beyond the command itself... queries still invoke the machine.
        assert!(executor.machine().applied() >= 2);
    }

    #[test]
    fn test_query_unknown_session() {
        let mut executor = executor();
        executor.submit_query(1, 99, 1, 0, kv::op(kv::GET, "x"));
        let completions = executor.take_query_completions();
        assert_eq!(completions[0].result.result, Err(ErrorKind::UnknownSession));
    }

    #[test]
    fn test_scheduled_tasks_fire_on_clock() {
        let mut executor = executor();
        open_session(&mut executor, 1, 60_000);

        executor.apply(&Indexed::new(
            2,
            1,
            Entry::Command {
                timestamp: 100,
                session: 1,
                sequence: 1,
                payload: kv::op(kv::PUT, "seed=1"),
            },
        ));

        // Schedule directly against the executor's task list via a
        // command that uses Commit::schedule.
        // (KeyValueMachine does not schedule; exercise insert/fire
        // directly.)
        executor.insert_task(ScheduledTask {
            time: 500,
            interval: 0,
            callback: Box::new(|machine: &mut KeyValueMachine| {
                machine.expire(0);
            }),
        });
        executor.insert_task(ScheduledTask {
            time: 300,
            interval: 200,
            callback: Box::new(|_machine: &mut KeyValueMachine| {}),
        });
        assert_eq!(executor.tasks.len(), 2);
        assert_eq!(executor.tasks[0].time, 300);

        command(&mut executor, 3, 600, 1, 2, kv::op(kv::PUT, "x=1"));

        // The one-shot fired and is gone; the repeating task was
        // rescheduled to 600 + 200.
        assert_eq!(executor.tasks.len(), 1);
        assert_eq!(executor.tasks[0].time, 800);
    }

    #[test]
    fn test_snapshot_cadence_and_completion() {
        let mut executor = executor();
        open_session(&mut executor, 1, u64::MAX / 2);
        command(&mut executor, 2, 20, 1, 1, kv::op(kv::PUT, "x=1"));
        assert!(executor.snapshots.snapshot_by_id(STATE_MACHINE_ID).is_none());

        // Advance the deterministic clock past the snapshot interval.
        command(
            &mut executor,
            3,
            SNAPSHOT_INTERVAL_MS + 100,
            1,
            2,
            kv::op(kv::PUT, "y=2"),
        );

        // No events are pending, so the snapshot completes immediately.
        let snapshot = executor
            .snapshots
            .snapshot_by_id(STATE_MACHINE_ID)
            .expect("snapshot should complete");
        assert_eq!(snapshot.index(), 3);
        assert_eq!(executor.snapshot_index, 3);
    }

    #[test]
    fn test_snapshot_install_round_trip() {
        let snapshots =
            Arc::new(SnapshotStore::open(StorageConfig::memory("test")).unwrap());

        // Source executor builds state and snapshots at index 3.
        let mut source = StateMachineExecutor::new(KeyValueMachine::new(), snapshots.clone());
        open_session(&mut source, 1, u64::MAX / 2);
        command(&mut source, 2, 20, 1, 1, kv::op(kv::PUT, "x=1"));
        command(
            &mut source,
            3,
            SNAPSHOT_INTERVAL_MS + 100,
            1,
            2,
            kv::op(kv::PUT, "y=2"),
        );
        assert!(snapshots.snapshot_by_id(STATE_MACHINE_ID).is_some());

        // A fresh replica installs the snapshot before applying index 4.
        let mut replica = StateMachineExecutor::new(KeyValueMachine::new(), snapshots);
        command(
            &mut replica,
            4,
            SNAPSHOT_INTERVAL_MS + 200,
            1,
            3,
            kv::op(kv::PUT, "z=3"),
        );

        assert_eq!(replica.machine().value("x"), Some("1"));
        assert_eq!(replica.machine().value("y"), Some("2"));
        assert_eq!(replica.machine().value("z"), Some("3"));
        assert_eq!(replica.last_applied(), 4);

        // The restored session kept its sequence numbering.
        let session = replica.sessions().get(1).unwrap();
        assert_eq!(session.command_sequence(), 3);
    }
}
