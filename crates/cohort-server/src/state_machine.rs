//! State machine interface.
//!
//! The state machine executes the commands the cluster agrees on. All
//! replicas apply the same entries in the same order, so implementations
//! must be deterministic: no wall clocks, no randomness, no I/O that can
//! fail differently across replicas. Time is available through
//! [`Commit::now`], which is derived from log entry timestamps and is
//! identical everywhere.
//!
//! Operations are dispatched by opcode: the first payload byte selects a
//! handler registered in an [`OperationRouter`], or implementations can
//! match on the raw payload directly in [`StateMachine::apply`].

use std::collections::HashMap;

use bytes::Bytes;

use cohort_common::{CohortError, ErrorKind, LogIndex, SessionId, Timestamp};
use cohort_storage::{SnapshotReader, SnapshotWriter};

/// Whether an operation may mutate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// A mutating operation, applied from the log.
    Command,
    /// A read-only operation, served from committed state.
    Query,
}

/// A scheduled callback request produced during an apply.
pub(crate) struct ScheduleRequest<S> {
    /// Delay before the first firing, in milliseconds.
    pub delay: u64,
    /// Re-firing interval; 0 for one-shot tasks.
    pub interval: u64,
    /// The callback.
    pub callback: Box<dyn FnMut(&mut S) + Send>,
}

/// Mutable services available to the state machine during one apply.
pub(crate) struct ApplyServices<S> {
    /// The deterministic clock, advanced to the entry's timestamp.
    pub now: Timestamp,
    /// Events published during the apply, delivered after it commits.
    pub events: Vec<(SessionId, Bytes)>,
    /// Side-effect callbacks queued for after the apply.
    pub tasks: Vec<Box<dyn FnOnce(&mut S) + Send>>,
    /// Scheduled callbacks registered during the apply.
    pub schedules: Vec<ScheduleRequest<S>>,
}

impl<S> ApplyServices<S> {
    pub(crate) fn new(now: Timestamp) -> Self {
        Self {
            now,
            events: Vec::new(),
            tasks: Vec::new(),
            schedules: Vec::new(),
        }
    }
}

/// A single operation being applied to the state machine.
pub struct Commit<'a, S> {
    pub(crate) index: LogIndex,
    pub(crate) session: SessionId,
    pub(crate) timestamp: Timestamp,
    pub(crate) kind: OperationKind,
    pub(crate) payload: &'a [u8],
    pub(crate) services: &'a mut ApplyServices<S>,
}

impl<S> Commit<'_, S> {
    /// Returns the log index of the operation.
    pub fn index(&self) -> LogIndex {
        self.index
    }

    /// Returns the session that submitted the operation.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Returns the timestamp recorded in the operation's entry.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Returns the deterministic clock: the maximum entry timestamp
    /// observed so far. Never decreases.
    pub fn now(&self) -> Timestamp {
        self.services.now
    }

    /// Returns the opaque operation payload.
    pub fn payload(&self) -> &[u8] {
        self.payload
    }

    /// Returns whether the operation is a command or a query.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Publishes an event to a session. Events are assigned the entry's
    /// index and delivered to the session's connection in order.
    ///
    /// Queries cannot publish events.
    pub fn publish(&mut self, session: SessionId, event: Bytes) {
        if self.kind == OperationKind::Command {
            self.services.events.push((session, event));
        }
    }

    /// Queues a callback to run after the current apply completes.
    pub fn execute(&mut self, task: impl FnOnce(&mut S) + Send + 'static) {
        self.services.tasks.push(Box::new(task));
    }

    /// Schedules a one-shot callback `delay_ms` after the current time.
    pub fn schedule(&mut self, delay_ms: u64, callback: impl FnMut(&mut S) + Send + 'static) {
        self.services.schedules.push(ScheduleRequest {
            delay: delay_ms,
            interval: 0,
            callback: Box::new(callback),
        });
    }

    /// Schedules a repeating callback.
    pub fn schedule_repeating(
        &mut self,
        delay_ms: u64,
        interval_ms: u64,
        callback: impl FnMut(&mut S) + Send + 'static,
    ) {
        self.services.schedules.push(ScheduleRequest {
            delay: delay_ms,
            interval: interval_ms,
            callback: Box::new(callback),
        });
    }
}

/// The replicated state machine.
///
/// Implementations must be deterministic; see the module docs.
pub trait StateMachine: Send + Sized + 'static {
    /// Applies an operation and returns its result bytes.
    ///
    /// Errors are wrapped as [`ErrorKind::ApplicationError`], cached
    /// per-session exactly like successful results, and returned to the
    /// client.
    fn apply(&mut self, commit: &mut Commit<'_, Self>) -> Result<Bytes, CohortError>;

    /// Serializes the machine's state into a snapshot.
    fn snapshot(&self, writer: &mut SnapshotWriter<'_>);

    /// Restores the machine's state from a snapshot.
    fn install(&mut self, reader: &mut SnapshotReader) -> Result<(), CohortError>;

    /// Called when a session is registered.
    fn register(&mut self, _session: SessionId) {}

    /// Called when a session expires without closing.
    fn expire(&mut self, _session: SessionId) {}

    /// Called when a session is closed, whether explicitly or by
    /// expiration.
    fn close(&mut self, _session: SessionId) {}
}

/// Handler signature for routed operations.
pub type OperationHandler<S> =
    Box<dyn Fn(&mut S, &mut Commit<'_, S>, &[u8]) -> Result<Bytes, CohortError> + Send>;

/// An explicit opcode-to-handler dispatcher.
///
/// The first byte of an operation payload selects the handler; the rest
/// is passed through as the operation's argument bytes.
pub struct OperationRouter<S> {
    handlers: HashMap<u8, OperationHandler<S>>,
}

impl<S> Default for OperationRouter<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> OperationRouter<S> {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers a handler for an opcode, replacing any previous one.
    pub fn register(
        &mut self,
        opcode: u8,
        handler: impl Fn(&mut S, &mut Commit<'_, S>, &[u8]) -> Result<Bytes, CohortError>
            + Send
            + 'static,
    ) -> &mut Self {
        self.handlers.insert(opcode, Box::new(handler));
        self
    }

    /// Dispatches the commit's payload to the handler registered for its
    /// opcode.
    pub fn dispatch(
        &self,
        machine: &mut S,
        commit: &mut Commit<'_, S>,
    ) -> Result<Bytes, CohortError> {
        let payload = commit.payload();
        let Some((&opcode, args)) = payload.split_first() else {
            return Ok(Bytes::new());
        };
        let args = args.to_vec();
        match self.handlers.get(&opcode) {
            Some(handler) => handler(machine, commit, &args),
            None => Err(CohortError::new(
                ErrorKind::UnknownStateMachine,
                format!("no handler for opcode {opcode}"),
            )),
        }
    }
}

/// A replicated key-value map used throughout the test suites.
///
/// Operations (opcode byte, then UTF-8 arguments):
/// - `1` put: `key=value`, returns the previous value; publishes
///   `key=value` to every watcher.
/// - `2` get: `key`, returns the value or empty bytes.
/// - `3` delete: `key`, returns the removed value.
/// - `4` watch: subscribes the submitting session to put events.
#[derive(Debug, Default)]
pub struct KeyValueMachine {
    entries: HashMap<String, String>,
    watchers: Vec<SessionId>,
    applied: u64,
}

/// Opcodes understood by [`KeyValueMachine`].
pub mod kv {
    /// Store a `key=value` pair.
    pub const PUT: u8 = 1;
    /// Read a key.
    pub const GET: u8 = 2;
    /// Remove a key.
    pub const DELETE: u8 = 3;
    /// Subscribe the session to put events.
    pub const WATCH: u8 = 4;

    use bytes::{BufMut, Bytes, BytesMut};

    /// Builds an operation payload from an opcode and arguments.
    pub fn op(opcode: u8, args: &str) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + args.len());
        buf.put_u8(opcode);
        buf.put_slice(args.as_bytes());
        buf.freeze()
    }
}

impl KeyValueMachine {
    /// Creates an empty machine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of operations applied, for dedup assertions.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Returns the value stored for `key`.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }
}

impl StateMachine for KeyValueMachine {
    fn apply(&mut self, commit: &mut Commit<'_, Self>) -> Result<Bytes, CohortError> {
        self.applied += 1;
        let payload = commit.payload();
        let Some((&opcode, args)) = payload.split_first() else {
            return Ok(Bytes::new());
        };
        let args = std::str::from_utf8(args)
            .map_err(|e| CohortError::new(ErrorKind::ApplicationError, e.to_string()))?
            .to_string();

        match opcode {
            kv::PUT => {
                let (key, value) = args.split_once('=').ok_or_else(|| {
                    CohortError::new(ErrorKind::ApplicationError, "put requires key=value")
                })?;
                let previous = self.entries.insert(key.to_string(), value.to_string());
                for watcher in self.watchers.clone() {
                    commit.publish(watcher, Bytes::from(args.clone()));
                }
                Ok(previous.map(Bytes::from).unwrap_or_default())
            }
            kv::GET => Ok(self
                .entries
                .get(&args)
                .cloned()
                .map(Bytes::from)
                .unwrap_or_default()),
            kv::DELETE => Ok(self
                .entries
                .remove(&args)
                .map(Bytes::from)
                .unwrap_or_default()),
            kv::WATCH => {
                let session = commit.session();
                if !self.watchers.contains(&session) {
                    self.watchers.push(session);
                }
                Ok(Bytes::new())
            }
            other => Err(CohortError::new(
                ErrorKind::ApplicationError,
                format!("unknown opcode {other}"),
            )),
        }
    }

    fn snapshot(&self, writer: &mut SnapshotWriter<'_>) {
        writer.write_u64(self.applied);
        writer.write_u32(self.entries.len() as u32);
        let mut keys: Vec<_> = self.entries.keys().collect();
        keys.sort();
        for key in keys {
            writer.write_bytes(key.as_bytes());
            writer.write_bytes(self.entries[key].as_bytes());
        }
        writer.write_u32(self.watchers.len() as u32);
        for watcher in &self.watchers {
            writer.write_u64(*watcher);
        }
    }

    fn install(&mut self, reader: &mut SnapshotReader) -> Result<(), CohortError> {
        let corrupted =
            |e: cohort_storage::StorageError| CohortError::new(ErrorKind::InternalError, e.to_string());

        self.applied = reader.read_u64().map_err(corrupted)?;
        self.entries.clear();
        let entries = reader.read_u32().map_err(corrupted)?;
        for _ in 0..entries {
            let key = reader.read_bytes().map_err(corrupted)?;
            let value = reader.read_bytes().map_err(corrupted)?;
            self.entries.insert(
                String::from_utf8_lossy(&key).into_owned(),
                String::from_utf8_lossy(&value).into_owned(),
            );
        }
        self.watchers.clear();
        let watchers = reader.read_u32().map_err(corrupted)?;
        for _ in 0..watchers {
            self.watchers.push(reader.read_u64().map_err(corrupted)?);
        }
        Ok(())
    }

    fn expire(&mut self, session: SessionId) {
        self.watchers.retain(|w| *w != session);
    }

    fn close(&mut self, session: SessionId) {
        self.watchers.retain(|w| *w != session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply_command(
        machine: &mut KeyValueMachine,
        index: LogIndex,
        session: SessionId,
        payload: Bytes,
    ) -> (Result<Bytes, CohortError>, Vec<(SessionId, Bytes)>) {
        let mut services = ApplyServices::new(index * 10);
        let mut commit = Commit {
            index,
            session,
            timestamp: index * 10,
            kind: OperationKind::Command,
            payload: &payload,
            services: &mut services,
        };
        let result = machine.apply(&mut commit);
        (result, services.events)
    }

    #[test]
    fn test_put_get_delete() {
        let mut machine = KeyValueMachine::new();

        let (result, _) = apply_command(&mut machine, 1, 1, kv::op(kv::PUT, "x=1"));
        assert!(result.unwrap().is_empty());
        assert_eq!(machine.value("x"), Some("1"));

        let (result, _) = apply_command(&mut machine, 2, 1, kv::op(kv::GET, "x"));
        assert_eq!(result.unwrap().as_ref(), b"1");

        let (result, _) = apply_command(&mut machine, 3, 1, kv::op(kv::PUT, "x=2"));
        assert_eq!(result.unwrap().as_ref(), b"1");

        let (result, _) = apply_command(&mut machine, 4, 1, kv::op(kv::DELETE, "x"));
        assert_eq!(result.unwrap().as_ref(), b"2");
        assert_eq!(machine.value("x"), None);
    }

    #[test]
    fn test_watch_publishes_events() {
        let mut machine = KeyValueMachine::new();

        apply_command(&mut machine, 1, 7, kv::op(kv::WATCH, "")).0.unwrap();
        let (_, events) = apply_command(&mut machine, 2, 1, kv::op(kv::PUT, "k=v"));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 7);
        assert_eq!(events[0].1.as_ref(), b"k=v");
    }

    #[test]
    fn test_session_close_removes_watcher() {
        let mut machine = KeyValueMachine::new();
        apply_command(&mut machine, 1, 7, kv::op(kv::WATCH, "")).0.unwrap();
        machine.close(7);

        let (_, events) = apply_command(&mut machine, 2, 1, kv::op(kv::PUT, "k=v"));
        assert!(events.is_empty());
    }

    #[test]
    fn test_unknown_opcode_is_application_error() {
        let mut machine = KeyValueMachine::new();
        let (result, _) = apply_command(&mut machine, 1, 1, kv::op(99, ""));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::ApplicationError);
    }

    #[test]
    fn test_snapshot_install_round_trip() {
        let mut machine = KeyValueMachine::new();
        apply_command(&mut machine, 1, 1, kv::op(kv::PUT, "a=1")).0.unwrap();
        apply_command(&mut machine, 2, 1, kv::op(kv::PUT, "b=2")).0.unwrap();
        apply_command(&mut machine, 3, 9, kv::op(kv::WATCH, "")).0.unwrap();

        let store = cohort_storage::SnapshotStore::open(
            cohort_storage::StorageConfig::memory("test"),
        )
        .unwrap();
        let mut pending = store.create_temporary(1, 3);
        machine.snapshot(&mut pending.writer());
        let snapshot = store.complete(pending).unwrap();

        let mut restored = KeyValueMachine::new();
        restored.install(&mut snapshot.reader()).unwrap();
        assert_eq!(restored.value("a"), Some("1"));
        assert_eq!(restored.value("b"), Some("2"));
        assert_eq!(restored.applied(), 3);

        // Watchers survive the round trip.
        let (_, events) = apply_command(&mut restored, 4, 1, kv::op(kv::PUT, "c=3"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 9);
    }

    #[test]
    fn test_operation_router() {
        struct Counter {
            count: u64,
        }
        impl StateMachine for Counter {
            fn apply(&mut self, _commit: &mut Commit<'_, Self>) -> Result<Bytes, CohortError> {
                Ok(Bytes::new())
            }
            fn snapshot(&self, writer: &mut SnapshotWriter<'_>) {
                writer.write_u64(self.count);
            }
            fn install(&mut self, reader: &mut SnapshotReader) -> Result<(), CohortError> {
                self.count = reader
                    .read_u64()
                    .map_err(|e| CohortError::new(ErrorKind::InternalError, e.to_string()))?;
                Ok(())
            }
        }

        let mut router = OperationRouter::new();
        router.register(1, |machine: &mut Counter, _commit, _args| {
            machine.count += 1;
            Ok(Bytes::from(machine.count.to_string()))
        });

        let mut machine = Counter { count: 0 };
        let mut services = ApplyServices::new(0);
        let payload = [1u8];
        let mut commit = Commit {
            index: 1,
            session: 1,
            timestamp: 0,
            kind: OperationKind::Command,
            payload: &payload,
            services: &mut services,
        };

        let result = router.dispatch(&mut machine, &mut commit).unwrap();
        assert_eq!(result.as_ref(), b"1");

        // Unknown opcodes are rejected.
        let payload = [9u8];
        let mut commit = Commit {
            index: 2,
            session: 1,
            timestamp: 0,
            kind: OperationKind::Command,
            payload: &payload,
            services: &mut services,
        };
        assert!(router.dispatch(&mut machine, &mut commit).is_err());
    }
}
