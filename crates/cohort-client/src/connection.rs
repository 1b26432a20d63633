//! The client's framed connection to one server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use cohort_protocol::client::{
    ClientEnvelope, ClientRequest, ClientResponse, PublishMessage, ServerEnvelope,
};
use cohort_protocol::frame;

/// A connection to one server, multiplexing requests by correlation id
/// and surfacing pushed events.
pub(crate) struct Connection {
    address: SocketAddr,
    writer: mpsc::UnboundedSender<ClientEnvelope>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<ClientResponse>>>>,
    next_id: AtomicU64,
}

impl Connection {
    /// Opens a connection and starts its reader task. Pushed events go
    /// to `events`.
    pub async fn open(
        address: SocketAddr,
        events: mpsc::UnboundedSender<PublishMessage>,
    ) -> std::io::Result<Self> {
        let stream = TcpStream::connect(address).await?;
        let (mut reader, mut writer) = stream.into_split();

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<ClientResponse>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let pending_reader = pending.clone();

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<ClientEnvelope>();

        tokio::spawn(async move {
            while let Some(envelope) = writer_rx.recv().await {
                let Ok(framed) = frame::encode(&envelope) else {
                    continue;
                };
                if writer.write_all(&framed).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(16 * 1024);
            loop {
                loop {
                    match frame::decode::<ServerEnvelope>(&mut buf) {
                        Ok(Some(envelope)) => {
                            if envelope.id == 0 {
                                if let ClientResponse::Publish(message) = envelope.response {
                                    let _ = events.send(message);
                                }
                                continue;
                            }
                            if let Some(sender) = pending_reader.lock().remove(&envelope.id) {
                                let _ = sender.send(envelope.response);
                            }
                        }
                        Ok(None) => break,
                        Err(error) => {
                            debug!("connection codec error: {error}");
                            return;
                        }
                    }
                }
                match reader.read_buf(&mut buf).await {
                    Ok(0) => return,
                    Ok(_) => {}
                    Err(_) => return,
                }
            }
        });

        Ok(Self {
            address,
            writer: writer_tx,
            pending,
            next_id: AtomicU64::new(1),
        })
    }

    /// Returns the server address this connection targets.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Sends a request and awaits its response.
    pub async fn request(&self, request: ClientRequest) -> Option<ClientResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let envelope = ClientEnvelope { id, request };
        if self.writer.send(envelope).is_err() {
            self.pending.lock().remove(&id);
            return None;
        }
        rx.await.ok()
    }
}
