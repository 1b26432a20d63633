//! Protocol error taxonomy.
//!
//! Every client-visible failure is one of the [`ErrorKind`] variants below.
//! The kinds have stable single-byte wire codes so responses can carry them
//! across versions, and each kind tells the client whether a retry can
//! succeed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for operations that fail with a [`CohortError`].
pub type Result<T> = std::result::Result<T, CohortError>;

/// The closed set of protocol error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorKind {
    /// No leader is known to the receiving server. Retryable.
    NoLeader = 1,
    /// The receiving member's role cannot serve the request.
    IllegalMemberState = 2,
    /// The session is unknown, expired, or closed.
    UnknownSession = 3,
    /// No state machine is registered for the request.
    UnknownStateMachine = 4,
    /// A command arrived out of sequence; the response carries the last
    /// sequence the server has seen so the client can retransmit.
    CommandError = 5,
    /// A query could not be served at the requested consistency level.
    QueryError = 6,
    /// A membership change was rejected.
    ConfigurationError = 7,
    /// The user state machine failed while applying an operation.
    ApplicationError = 8,
    /// An unexpected internal failure (I/O, corruption).
    InternalError = 9,
}

impl ErrorKind {
    /// Returns the stable wire code for this kind.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Looks up a kind by its wire code.
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ErrorKind::NoLeader),
            2 => Some(ErrorKind::IllegalMemberState),
            3 => Some(ErrorKind::UnknownSession),
            4 => Some(ErrorKind::UnknownStateMachine),
            5 => Some(ErrorKind::CommandError),
            6 => Some(ErrorKind::QueryError),
            7 => Some(ErrorKind::ConfigurationError),
            8 => Some(ErrorKind::ApplicationError),
            9 => Some(ErrorKind::InternalError),
            _ => None,
        }
    }

    /// Returns true if the operation may succeed when retried, possibly
    /// against a different member.
    pub const fn retryable(self) -> bool {
        matches!(self, ErrorKind::NoLeader | ErrorKind::CommandError)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::NoLeader => "no leader",
            ErrorKind::IllegalMemberState => "illegal member state",
            ErrorKind::UnknownSession => "unknown session",
            ErrorKind::UnknownStateMachine => "unknown state machine",
            ErrorKind::CommandError => "command sequence error",
            ErrorKind::QueryError => "query error",
            ErrorKind::ConfigurationError => "configuration error",
            ErrorKind::ApplicationError => "application error",
            ErrorKind::InternalError => "internal error",
        };
        f.write_str(name)
    }
}

/// An error raised by a Cohort server or client.
#[derive(Debug, Error)]
pub enum CohortError {
    /// A typed protocol error.
    #[error("{kind}: {message}")]
    Protocol {
        /// The protocol error kind.
        kind: ErrorKind,
        /// Human-readable detail.
        message: String,
    },

    /// An I/O error from storage or the network.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CohortError {
    /// Creates a protocol error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        CohortError::Protocol {
            kind,
            message: message.into(),
        }
    }

    /// Returns the protocol kind of this error, mapping I/O failures to
    /// [`ErrorKind::InternalError`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            CohortError::Protocol { kind, .. } => *kind,
            CohortError::Io(_) => ErrorKind::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for code in 1..=9u8 {
            let kind = ErrorKind::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
        }
        assert!(ErrorKind::from_code(0).is_none());
        assert!(ErrorKind::from_code(10).is_none());
    }

    #[test]
    fn test_retryable() {
        assert!(ErrorKind::NoLeader.retryable());
        assert!(ErrorKind::CommandError.retryable());
        assert!(!ErrorKind::UnknownSession.retryable());
        assert!(!ErrorKind::ApplicationError.retryable());
    }

    #[test]
    fn test_error_kind_mapping() {
        let err = CohortError::new(ErrorKind::NoLeader, "cluster has no leader");
        assert_eq!(err.kind(), ErrorKind::NoLeader);

        let io = CohortError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(io.kind(), ErrorKind::InternalError);
    }
}
