//! Log entry payloads.
//!
//! Every record in the replicated log is an [`Indexed`] wrapper around an
//! [`Entry`] variant. The variant determines how the state-machine executor
//! treats the record when it is applied; the wrapper carries the index and
//! term assigned at append time.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use cohort_common::{ConnectionId, LogIndex, SessionId, Term, Timestamp};

use crate::member::Member;

/// A per-session acknowledgement inside a keep-alive entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAck {
    /// The session being kept alive.
    pub session: SessionId,
    /// The highest command sequence for which the client has a response.
    pub command_sequence: u64,
    /// The highest event index the client has received.
    pub event_index: u64,
    /// The connection the session is bound to.
    pub connection: ConnectionId,
}

/// A log entry payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entry {
    /// Empty marker appended on leader election; forces commitment of
    /// prior-term entries.
    Initialize {
        /// The leader's timestamp at election.
        timestamp: Timestamp,
    },

    /// A cluster membership change. Takes effect when observed in the log,
    /// before commitment.
    Configuration {
        /// When the configuration was created.
        timestamp: Timestamp,
        /// The new member set.
        members: Vec<Member>,
    },

    /// A client session registration. The session's id is the index of
    /// this entry.
    OpenSession {
        /// When the registration was logged.
        timestamp: Timestamp,
        /// The client-supplied name.
        client: String,
        /// The session timeout in milliseconds.
        timeout: u64,
    },

    /// Batched session liveness and acknowledgement.
    KeepAlive {
        /// When the keep-alive was logged.
        timestamp: Timestamp,
        /// Acknowledgements, one per session.
        sessions: Vec<SessionAck>,
    },

    /// Explicit session termination.
    CloseSession {
        /// When the close was logged.
        timestamp: Timestamp,
        /// The session to close.
        session: SessionId,
        /// True when the leader closed the session after detecting
        /// expiration rather than at the client's request.
        expired: bool,
    },

    /// A mutating client operation.
    Command {
        /// When the command was logged.
        timestamp: Timestamp,
        /// The submitting session.
        session: SessionId,
        /// The session-scoped command sequence number.
        sequence: u64,
        /// The opaque operation payload.
        payload: Bytes,
    },

    /// A read-only client operation. Logged only when the consistency
    /// level requires a log round-trip.
    Query {
        /// When the query was logged.
        timestamp: Timestamp,
        /// The submitting session.
        session: SessionId,
        /// The session-scoped query sequence number.
        sequence: u64,
        /// The opaque operation payload.
        payload: Bytes,
    },

    /// Session introspection; applies without replicating side effects.
    Metadata {
        /// When the request was logged.
        timestamp: Timestamp,
        /// The requesting session.
        session: SessionId,
    },
}

impl Entry {
    /// Returns the stable storage type code of this entry.
    pub fn type_code(&self) -> u8 {
        match self {
            Entry::Initialize { .. } => 1,
            Entry::Configuration { .. } => 2,
            Entry::OpenSession { .. } => 3,
            Entry::KeepAlive { .. } => 4,
            Entry::CloseSession { .. } => 5,
            Entry::Command { .. } => 6,
            Entry::Query { .. } => 7,
            Entry::Metadata { .. } => 8,
        }
    }

    /// Returns the timestamp recorded in this entry.
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Entry::Initialize { timestamp }
            | Entry::Configuration { timestamp, .. }
            | Entry::OpenSession { timestamp, .. }
            | Entry::KeepAlive { timestamp, .. }
            | Entry::CloseSession { timestamp, .. }
            | Entry::Command { timestamp, .. }
            | Entry::Query { timestamp, .. }
            | Entry::Metadata { timestamp, .. } => *timestamp,
        }
    }
}

/// An entry with its assigned position in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indexed<T = Entry> {
    /// The entry's log index.
    pub index: LogIndex,
    /// The leader's term when the entry was appended.
    pub term: Term,
    /// The entry payload.
    pub entry: T,
}

impl<T> Indexed<T> {
    /// Creates a new indexed entry.
    pub fn new(index: LogIndex, term: Term, entry: T) -> Self {
        Self { index, term, entry }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes_distinct() {
        let entries = [
            Entry::Initialize { timestamp: 0 },
            Entry::Configuration {
                timestamp: 0,
                members: Vec::new(),
            },
            Entry::OpenSession {
                timestamp: 0,
                client: "c".into(),
                timeout: 1000,
            },
            Entry::KeepAlive {
                timestamp: 0,
                sessions: Vec::new(),
            },
            Entry::CloseSession {
                timestamp: 0,
                session: 1,
                expired: false,
            },
            Entry::Command {
                timestamp: 0,
                session: 1,
                sequence: 1,
                payload: Bytes::new(),
            },
            Entry::Query {
                timestamp: 0,
                session: 1,
                sequence: 1,
                payload: Bytes::new(),
            },
            Entry::Metadata {
                timestamp: 0,
                session: 1,
            },
        ];

        let mut codes: Vec<u8> = entries.iter().map(|e| e.type_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), entries.len());
    }

    #[test]
    fn test_timestamp_accessor() {
        let entry = Entry::Command {
            timestamp: 42,
            session: 3,
            sequence: 1,
            payload: Bytes::from("op"),
        };
        assert_eq!(entry.timestamp(), 42);
    }

    #[test]
    fn test_serialization_round_trip() {
        let indexed = Indexed::new(
            7,
            2,
            Entry::OpenSession {
                timestamp: 100,
                client: "client-1".into(),
                timeout: 5000,
            },
        );

        let bytes = bincode::serialize(&indexed).unwrap();
        let decoded: Indexed = bincode::deserialize(&bytes).unwrap();
        assert_eq!(indexed, decoded);
    }
}
