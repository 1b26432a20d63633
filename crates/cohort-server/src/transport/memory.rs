//! In-memory transport for tests.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use cohort_common::MemberId;
use cohort_protocol::raft::RaftMessage;

use super::{IncomingMessage, Transport, TransportError, TransportResult};

/// A hub connecting [`MemoryTransport`]s in one process.
#[derive(Default, Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<HashMap<MemberId, mpsc::UnboundedSender<IncomingMessage>>>>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a member and returns its transport.
    pub fn register(&self, member: MemberId) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().insert(member, tx);
        MemoryTransport {
            member,
            network: self.clone(),
            incoming: tokio::sync::Mutex::new(rx),
        }
    }

    /// Disconnects a member, simulating a crash or partition.
    pub fn disconnect(&self, member: MemberId) {
        self.inner.lock().remove(&member);
    }

    fn deliver(&self, from: MemberId, to: MemberId, message: RaftMessage) -> TransportResult<()> {
        let sender = self
            .inner
            .lock()
            .get(&to)
            .cloned()
            .ok_or(TransportError::UnknownMember(to))?;
        sender
            .send(IncomingMessage { from, message })
            .map_err(|_| TransportError::Closed)
    }
}

/// A transport backed by a [`MemoryNetwork`].
pub struct MemoryTransport {
    member: MemberId,
    network: MemoryNetwork,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<IncomingMessage>>,
}

impl Transport for MemoryTransport {
    fn send(&self, to: MemberId, message: RaftMessage) -> TransportResult<()> {
        self.network.deliver(self.member, to, message)
    }

    fn recv(&self) -> Pin<Box<dyn Future<Output = Option<IncomingMessage>> + Send + '_>> {
        Box::pin(async move { self.incoming.lock().await.recv().await })
    }

    fn local_id(&self) -> MemberId {
        self.member
    }

    fn close(&self) {
        self.network.disconnect(self.member);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_protocol::raft::{PollRequest, RaftMessage};

    fn poll(term: u64) -> RaftMessage {
        RaftMessage::Poll(PollRequest {
            term,
            candidate: 1,
            log_index: 0,
            log_term: 0,
        })
    }

    #[tokio::test]
    async fn test_round_trip() {
        let network = MemoryNetwork::new();
        let a = network.register(1);
        let b = network.register(2);

        a.send(2, poll(5)).unwrap();
        let incoming = b.recv().await.unwrap();
        assert_eq!(incoming.from, 1);
        assert_eq!(incoming.message, poll(5));
    }

    #[tokio::test]
    async fn test_unknown_member() {
        let network = MemoryNetwork::new();
        let a = network.register(1);
        assert!(matches!(
            a.send(9, poll(1)),
            Err(TransportError::UnknownMember(9))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_drops_messages() {
        let network = MemoryNetwork::new();
        let a = network.register(1);
        let _b = network.register(2);

        network.disconnect(2);
        assert!(a.send(2, poll(1)).is_err());
    }
}
