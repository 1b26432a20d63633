//! Client-facing protocol messages.
//!
//! Clients speak to any member; requests a member cannot serve locally are
//! forwarded to the known leader. Responses carry the leader's client
//! address and the member list so clients can re-route after failover.

use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use cohort_common::{ConnectionId, ErrorKind, LogIndex, SessionId, Timestamp};

use crate::entry::SessionAck;
use crate::{Consistency, Status};

/// Session registration arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// A client-chosen name, recorded for introspection.
    pub client: String,
    /// The requested session timeout in milliseconds.
    pub timeout: u64,
}

/// Session registration response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// The response status.
    pub status: Status,
    /// The new session id (the log index of the registration).
    pub session: SessionId,
    /// The leader's client address, when known.
    pub leader: Option<SocketAddr>,
    /// Client addresses of all members.
    pub members: Vec<SocketAddr>,
    /// The granted session timeout in milliseconds.
    pub timeout: u64,
}

/// Batched session keep-alive arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    /// Acknowledgements, one per session held by the client.
    pub sessions: Vec<SessionAck>,
}

/// Keep-alive response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    /// The response status.
    pub status: Status,
    /// The leader's client address, when known.
    pub leader: Option<SocketAddr>,
    /// Client addresses of all members.
    pub members: Vec<SocketAddr>,
}

/// Session termination arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterRequest {
    /// The session to close.
    pub session: SessionId,
}

/// Session termination response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterResponse {
    /// The response status.
    pub status: Status,
}

/// Binds a session to the submitting connection for event delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// The session to bind.
    pub session: SessionId,
    /// The connection to bind it to.
    pub connection: ConnectionId,
}

/// Connect response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    /// The response status.
    pub status: Status,
    /// The leader's client address, when known.
    pub leader: Option<SocketAddr>,
    /// Client addresses of all members.
    pub members: Vec<SocketAddr>,
}

/// A mutating operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// The submitting session.
    pub session: SessionId,
    /// The session-scoped sequence number.
    pub sequence: u64,
    /// The opaque operation payload.
    pub payload: Bytes,
}

/// Command response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// The response status.
    pub status: Status,
    /// The log index at which the command was applied.
    pub index: LogIndex,
    /// The session's event index at apply time.
    pub event_index: u64,
    /// The state machine's output, when the command succeeded.
    pub result: Option<Bytes>,
    /// On [`ErrorKind::CommandError`], the last sequence the server has
    /// seen, so the client knows what to retransmit.
    pub last_sequence: Option<u64>,
    /// The leader's client address, when known.
    pub leader: Option<SocketAddr>,
}

impl CommandResponse {
    /// Creates an error response of the given kind.
    pub fn error(kind: ErrorKind, leader: Option<SocketAddr>) -> Self {
        Self {
            status: Status::Error(kind),
            index: 0,
            event_index: 0,
            result: None,
            last_sequence: None,
            leader,
        }
    }
}

/// A read-only operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// The submitting session.
    pub session: SessionId,
    /// The session-scoped query sequence number.
    pub sequence: u64,
    /// The highest index whose effects the query must observe.
    pub index: LogIndex,
    /// The consistency level.
    pub consistency: Consistency,
    /// The opaque operation payload.
    pub payload: Bytes,
}

/// Query response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// The response status.
    pub status: Status,
    /// The session's last applied index at execution time.
    pub index: LogIndex,
    /// The session's event index at execution time.
    pub event_index: u64,
    /// The state machine's output, when the query succeeded.
    pub result: Option<Bytes>,
}

/// Session introspection arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRequest {
    /// The requesting session.
    pub session: SessionId,
}

/// A session record returned by metadata queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// The session id.
    pub session: SessionId,
    /// The client-chosen name.
    pub client: String,
    /// The session timeout in milliseconds.
    pub timeout: u64,
}

/// Metadata response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataResponse {
    /// The response status.
    pub status: Status,
    /// All open sessions.
    pub sessions: Vec<SessionMetadata>,
}

/// Events pushed to a session's bound connection, in event-index order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishMessage {
    /// The session the events belong to.
    pub session: SessionId,
    /// The index these events were published at.
    pub event_index: u64,
    /// The previous event index, so clients can detect gaps.
    pub previous_index: u64,
    /// The event payloads.
    pub events: Vec<Bytes>,
    /// The timestamp of the publishing entry.
    pub timestamp: Timestamp,
}

/// All client-to-server requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum ClientRequest {
    Register(RegisterRequest),
    KeepAlive(KeepAliveRequest),
    Unregister(UnregisterRequest),
    Connect(ConnectRequest),
    Command(CommandRequest),
    Query(QueryRequest),
    Metadata(MetadataRequest),
}

/// All server-to-client responses and pushes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum ClientResponse {
    Register(RegisterResponse),
    KeepAlive(KeepAliveResponse),
    Unregister(UnregisterResponse),
    Connect(ConnectResponse),
    Command(CommandResponse),
    Query(QueryResponse),
    Metadata(MetadataResponse),
    Publish(PublishMessage),
}

/// A client request paired with a correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEnvelope {
    /// Correlation id echoed in the response; 0 is reserved for pushes.
    pub id: u64,
    /// The request body.
    pub request: ClientRequest,
}

/// A server response paired with the request's correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEnvelope {
    /// The correlation id of the request, or 0 for a push.
    pub id: u64,
    /// The response body.
    pub response: ClientResponse,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_round_trip() {
        let request = ClientRequest::Command(CommandRequest {
            session: 3,
            sequence: 1,
            payload: Bytes::from("set x=1"),
        });

        let bytes = bincode::serialize(&request).unwrap();
        let decoded: ClientRequest = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_command_error_response() {
        let response = CommandResponse::error(ErrorKind::NoLeader, None);
        assert_eq!(response.status, Status::Error(ErrorKind::NoLeader));
        assert!(response.result.is_none());
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelope = ClientEnvelope {
            id: 17,
            request: ClientRequest::Metadata(MetadataRequest { session: 3 }),
        };
        let bytes = bincode::serialize(&envelope).unwrap();
        let decoded: ClientEnvelope = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.id, 17);
    }
}
