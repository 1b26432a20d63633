//! # cohort-protocol
//!
//! Message types exchanged between Cohort servers and clients, the cluster
//! membership vocabulary, and the log entry payloads that flow through
//! both the wire protocol and the storage layer.
//!
//! Messages are plain `serde` structs encoded with `bincode`; the frame
//! module provides the length-prefixed envelope used on TCP connections.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Client-facing request and response types
pub mod client;
/// Log entry payloads
pub mod entry;
/// Length-prefixed wire framing
pub mod frame;
/// Cluster membership types
pub mod member;
/// Server-to-server request and response types
pub mod raft;

use serde::{Deserialize, Serialize};

pub use client::{ClientRequest, ClientResponse};
pub use entry::{Entry, Indexed, SessionAck};
pub use member::{Configuration, Member, MemberStatus, MemberType};
pub use raft::RaftMessage;

/// The consistency level of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// The query executes on the leader against committed state, ordered
    /// after the session's own writes, without any leadership re-check.
    Sequential,
    /// The query executes on the leader, which must have heard from a
    /// quorum within the last election-timeout window.
    LinearizableLease,
    /// The query executes on the leader, which confirms leadership with a
    /// round of heartbeats after execution and before responding.
    Linearizable,
}

/// The status of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// The request was handled successfully.
    Ok,
    /// The request failed with the given error kind.
    Error(cohort_common::ErrorKind),
}

impl Status {
    /// Returns true if the status is [`Status::Ok`].
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Returns the error kind if the status is an error.
    pub fn error(&self) -> Option<cohort_common::ErrorKind> {
        match self {
            Status::Ok => None,
            Status::Error(kind) => Some(*kind),
        }
    }
}
