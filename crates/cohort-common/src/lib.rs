//! # cohort-common
//!
//! Shared vocabulary for the Cohort consensus library: identifier types,
//! the protocol error taxonomy, and constants used across crates.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error taxonomy
pub mod error;

pub use error::{CohortError, ErrorKind, Result};

/// A Raft term number (monotonically increasing epoch).
pub type Term = u64;

/// The position of an entry in the replicated log.
///
/// Indices are dense and strictly increasing per replica; index 0 means
/// "before the first entry" and is never occupied.
pub type LogIndex = u64;

/// A cluster member identifier.
pub type MemberId = u64;

/// A client session identifier.
///
/// Session ids equal the log index of the session's registration entry,
/// which makes them globally unique and monotonic.
pub type SessionId = u64;

/// A client connection identifier, scoped to the server that accepted it.
pub type ConnectionId = u64;

/// Milliseconds since the Unix epoch, as recorded in log entries.
pub type Timestamp = u64;
