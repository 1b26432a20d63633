//! Server-to-server transport.
//!
//! The transport moves [`RaftMessage`]s between members. Two
//! implementations are provided: [`MemoryTransport`] connects servers
//! through in-process channels for tests, and [`TcpTransport`] frames
//! messages over TCP for deployments.

mod memory;
mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use cohort_common::MemberId;
use cohort_protocol::raft::RaftMessage;

/// Errors from transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The target member has no known address or channel.
    #[error("unknown member: {0}")]
    UnknownMember(MemberId),

    /// The transport is closed.
    #[error("transport closed")]
    Closed,

    /// Message framing failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// An underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// A message received from a peer.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// The sending member.
    pub from: MemberId,
    /// The message.
    pub message: RaftMessage,
}

/// Abstract transport between cluster members.
pub trait Transport: Send + Sync + 'static {
    /// Queues a message for delivery to a member. Fire-and-forget:
    /// delivery failures surface as missing responses, which the
    /// protocol already tolerates.
    fn send(&self, to: MemberId, message: RaftMessage) -> TransportResult<()>;

    /// Receives the next incoming message; `None` once closed.
    fn recv(&self) -> Pin<Box<dyn Future<Output = Option<IncomingMessage>> + Send + '_>>;

    /// Returns the local member id.
    fn local_id(&self) -> MemberId;

    /// Closes the transport.
    fn close(&self);
}
