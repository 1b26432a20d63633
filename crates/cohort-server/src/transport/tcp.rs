//! TCP transport.
//!
//! Each message is framed with the protocol's length-prefixed envelope
//! and preceded on a fresh connection by an 8-byte handshake carrying
//! the sender's member id. Outbound connections are opened lazily per
//! peer and re-opened after failures; sends are fire-and-forget, as the
//! protocol tolerates loss.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use cohort_common::MemberId;
use cohort_protocol::frame;
use cohort_protocol::raft::RaftMessage;

use super::{IncomingMessage, Transport, TransportError, TransportResult};

/// TCP transport between members.
pub struct TcpTransport {
    member: MemberId,
    peers: Arc<Mutex<HashMap<MemberId, SocketAddr>>>,
    outbound: Arc<Mutex<HashMap<MemberId, mpsc::UnboundedSender<RaftMessage>>>>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<IncomingMessage>>,
}

impl TcpTransport {
    /// Binds the local server address and starts accepting peer
    /// connections.
    pub async fn bind(
        member: MemberId,
        address: SocketAddr,
        peers: HashMap<MemberId, SocketAddr>,
    ) -> TransportResult<Arc<Self>> {
        let listener = TcpListener::bind(address).await?;
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let transport = Arc::new(Self {
            member,
            peers: Arc::new(Mutex::new(peers)),
            outbound: Arc::new(Mutex::new(HashMap::new())),
            incoming: tokio::sync::Mutex::new(incoming_rx),
        });

        tokio::spawn(accept_loop(listener, incoming_tx));
        Ok(transport)
    }

    /// Records or updates a peer's address.
    pub fn set_peer(&self, member: MemberId, address: SocketAddr) {
        let replaced = self.peers.lock().insert(member, address);
        if replaced != Some(address) {
            // Any cached connection points at the old address.
            self.outbound.lock().remove(&member);
        }
    }

    fn sender_for(&self, to: MemberId) -> TransportResult<mpsc::UnboundedSender<RaftMessage>> {
        if let Some(sender) = self.outbound.lock().get(&to) {
            if !sender.is_closed() {
                return Ok(sender.clone());
            }
        }

        let address = self
            .peers
            .lock()
            .get(&to)
            .copied()
            .ok_or(TransportError::UnknownMember(to))?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound.lock().insert(to, tx.clone());
        tokio::spawn(outbound_loop(self.member, to, address, rx));
        Ok(tx)
    }
}

impl Transport for TcpTransport {
    fn send(&self, to: MemberId, message: RaftMessage) -> TransportResult<()> {
        let sender = self.sender_for(to)?;
        sender.send(message).map_err(|_| TransportError::Closed)
    }

    fn recv(&self) -> Pin<Box<dyn Future<Output = Option<IncomingMessage>> + Send + '_>> {
        Box::pin(async move { self.incoming.lock().await.recv().await })
    }

    fn local_id(&self) -> MemberId {
        self.member
    }

    fn close(&self) {
        self.outbound.lock().clear();
    }
}

async fn accept_loop(
    listener: TcpListener,
    incoming: mpsc::UnboundedSender<IncomingMessage>,
) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!("accept failed: {error}");
                continue;
            }
        };
        debug!(%remote, "peer connected");
        tokio::spawn(read_loop(stream, incoming.clone()));
    }
}

async fn read_loop(mut stream: TcpStream, incoming: mpsc::UnboundedSender<IncomingMessage>) {
    // Handshake: the sender's member id.
    let mut id_buf = [0u8; 8];
    if stream.read_exact(&mut id_buf).await.is_err() {
        return;
    }
    let from = u64::from_be_bytes(id_buf);

    let mut buf = BytesMut::with_capacity(64 * 1024);
    loop {
        loop {
            match frame::decode::<RaftMessage>(&mut buf) {
                Ok(Some(message)) => {
                    if incoming.send(IncomingMessage { from, message }).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(from, "dropping connection: {error}");
                    return;
                }
            }
        }

        match stream.read_buf(&mut buf).await {
            Ok(0) => return,
            Ok(_) => {}
            Err(_) => return,
        }
    }
}

async fn outbound_loop(
    local: MemberId,
    to: MemberId,
    address: SocketAddr,
    mut rx: mpsc::UnboundedReceiver<RaftMessage>,
) {
    let mut stream = match TcpStream::connect(address).await {
        Ok(stream) => stream,
        Err(error) => {
            debug!(to, %address, "connect failed: {error}");
            // Dropping the receiver fails queued sends; the caller will
            // re-open on the next send.
            rx.close();
            return;
        }
    };

    if stream.write_all(&local.to_be_bytes()).await.is_err() {
        rx.close();
        return;
    }

    while let Some(message) = rx.recv().await {
        let framed = match frame::encode(&message) {
            Ok(framed) => framed,
            Err(error) => {
                warn!(to, "encode failed: {error}");
                continue;
            }
        };
        if stream.write_all(&framed).await.is_err() {
            debug!(to, "peer connection lost");
            rx.close();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_protocol::raft::{PollRequest, VoteRequest};

    async fn pair() -> (Arc<TcpTransport>, Arc<TcpTransport>) {
        let addr_a: SocketAddr = "127.0.0.1:0".parse().unwrap();

        // Bind ephemeral listeners first to learn the ports.
        let listener_a = TcpListener::bind(addr_a).await.unwrap();
        let listener_b = TcpListener::bind(addr_a).await.unwrap();
        let a_addr = listener_a.local_addr().unwrap();
        let b_addr = listener_b.local_addr().unwrap();
        drop(listener_a);
        drop(listener_b);

        let mut peers_a = HashMap::new();
        peers_a.insert(2, b_addr);
        let mut peers_b = HashMap::new();
        peers_b.insert(1, a_addr);

        let a = TcpTransport::bind(1, a_addr, peers_a).await.unwrap();
        let b = TcpTransport::bind(2, b_addr, peers_b).await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (a, b) = pair().await;

        let message = RaftMessage::Poll(PollRequest {
            term: 3,
            candidate: 1,
            log_index: 7,
            log_term: 2,
        });
        a.send(2, message.clone()).unwrap();

        let incoming = b.recv().await.unwrap();
        assert_eq!(incoming.from, 1);
        assert_eq!(incoming.message, message);
    }

    #[tokio::test]
    async fn test_bidirectional() {
        let (a, b) = pair().await;

        a.send(
            2,
            RaftMessage::Poll(PollRequest {
                term: 1,
                candidate: 1,
                log_index: 0,
                log_term: 0,
            }),
        )
        .unwrap();
        let _ = b.recv().await.unwrap();

        b.send(
            1,
            RaftMessage::Vote(VoteRequest {
                term: 2,
                candidate: 2,
                log_index: 0,
                log_term: 0,
            }),
        )
        .unwrap();
        let incoming = a.recv().await.unwrap();
        assert_eq!(incoming.from, 2);
        assert!(matches!(incoming.message, RaftMessage::Vote(_)));
    }

    #[tokio::test]
    async fn test_unknown_member() {
        let (a, _b) = pair().await;
        assert!(matches!(
            a.send(
                9,
                RaftMessage::Poll(PollRequest {
                    term: 1,
                    candidate: 1,
                    log_index: 0,
                    log_term: 0,
                })
            ),
            Err(TransportError::UnknownMember(9))
        ));
    }
}
