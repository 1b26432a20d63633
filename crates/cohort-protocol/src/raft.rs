//! Server-to-server protocol messages.
//!
//! ```text
//! Leader Election:
//!   Candidate ──Poll──▶ Active member      (advisory pre-vote)
//!   Candidate ──Vote──▶ Active member      (binding vote)
//!
//! Log Replication:
//!   Leader ──Append──▶ Follower/Passive
//!   Leader ──Install──▶ Follower           (snapshot transfer)
//!   Leader ──Configure──▶ Reserve          (configuration propagation)
//!
//! Membership:
//!   Joining server ──Join/Leave/Reconfigure──▶ Leader
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use cohort_common::{LogIndex, MemberId, Term, Timestamp};

use crate::entry::{Entry, Indexed};
use crate::member::Member;
use crate::Status;

/// AppendEntries arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendRequest {
    /// The leader's term.
    pub term: Term,
    /// The leader's member id.
    pub leader: MemberId,
    /// The index of the entry immediately preceding the batch.
    pub log_index: LogIndex,
    /// The term of the entry at `log_index`.
    pub log_term: Term,
    /// Entries to store; empty for a heartbeat.
    pub entries: Vec<Indexed<Entry>>,
    /// The leader's commit index.
    pub commit_index: LogIndex,
    /// The lowest match index across all members; bounds compaction of
    /// fully-replicated prefixes.
    pub global_index: LogIndex,
}

/// AppendEntries response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    /// The response status.
    pub status: Status,
    /// The responder's term.
    pub term: Term,
    /// True if the entries were appended.
    pub succeeded: bool,
    /// On success, the last index appended; on failure, the hint from
    /// which the leader should retry.
    pub log_index: LogIndex,
}

/// Poll (pre-vote) arguments. Identical in shape to [`VoteRequest`] but
/// advisory: responders do not record a vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRequest {
    /// The would-be candidate's next term.
    pub term: Term,
    /// The polling member.
    pub candidate: MemberId,
    /// Index of the candidate's last entry.
    pub log_index: LogIndex,
    /// Term of the candidate's last entry.
    pub log_term: Term,
}

/// Poll response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResponse {
    /// The response status.
    pub status: Status,
    /// The responder's term.
    pub term: Term,
    /// True if the responder would grant a vote.
    pub accepted: bool,
}

/// Vote arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's term.
    pub term: Term,
    /// The candidate requesting the vote.
    pub candidate: MemberId,
    /// Index of the candidate's last entry.
    pub log_index: LogIndex,
    /// Term of the candidate's last entry.
    pub log_term: Term,
}

/// Vote response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The response status.
    pub status: Status,
    /// The responder's term.
    pub term: Term,
    /// True if the vote was granted.
    pub voted: bool,
}

/// A chunk of a snapshot being installed on a follower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRequest {
    /// The leader's term.
    pub term: Term,
    /// The leader's member id.
    pub leader: MemberId,
    /// The state machine id the snapshot covers.
    pub id: u64,
    /// The log index the snapshot reflects.
    pub index: LogIndex,
    /// Byte offset of this chunk in the snapshot.
    pub offset: u64,
    /// The chunk data.
    pub data: Bytes,
    /// True if this is the final chunk.
    pub complete: bool,
}

/// Install response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallResponse {
    /// The response status.
    pub status: Status,
    /// The responder's term.
    pub term: Term,
}

/// Configuration propagation to reserve and passive members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureRequest {
    /// The leader's term.
    pub term: Term,
    /// The leader's member id.
    pub leader: MemberId,
    /// The configuration entry's index.
    pub index: LogIndex,
    /// The configuration entry's timestamp.
    pub timestamp: Timestamp,
    /// The member set.
    pub members: Vec<Member>,
}

/// Configure response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureResponse {
    /// The response status.
    pub status: Status,
    /// The responder's term.
    pub term: Term,
}

/// Request to add a member to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// The joining member.
    pub member: Member,
}

/// Request to remove a member from the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveRequest {
    /// The leaving member.
    pub member: Member,
}

/// Request to change an existing member's type or addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconfigureRequest {
    /// The updated member record.
    pub member: Member,
    /// The configuration index the caller observed; stale values are
    /// rejected.
    pub index: LogIndex,
}

/// Response to Join, Leave, and Reconfigure requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationResponse {
    /// The response status.
    pub status: Status,
    /// The new configuration entry's index.
    pub index: LogIndex,
    /// The new configuration entry's term.
    pub term: Term,
    /// The new configuration entry's timestamp.
    pub timestamp: Timestamp,
    /// The new member set.
    pub members: Vec<Member>,
}

/// All server-to-server messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum RaftMessage {
    Append(AppendRequest),
    AppendReply(AppendResponse),
    Poll(PollRequest),
    PollReply(PollResponse),
    Vote(VoteRequest),
    VoteReply(VoteResponse),
    Install(InstallRequest),
    InstallReply(InstallResponse),
    Configure(ConfigureRequest),
    ConfigureReply(ConfigureResponse),
    Join(JoinRequest),
    Leave(LeaveRequest),
    Reconfigure(ReconfigureRequest),
    ConfigurationReply(ConfigurationResponse),
}

impl RaftMessage {
    /// Returns the term carried by the message, if any.
    pub fn term(&self) -> Option<Term> {
        match self {
            RaftMessage::Append(m) => Some(m.term),
            RaftMessage::AppendReply(m) => Some(m.term),
            RaftMessage::Poll(m) => Some(m.term),
            RaftMessage::PollReply(m) => Some(m.term),
            RaftMessage::Vote(m) => Some(m.term),
            RaftMessage::VoteReply(m) => Some(m.term),
            RaftMessage::Install(m) => Some(m.term),
            RaftMessage::InstallReply(m) => Some(m.term),
            RaftMessage::Configure(m) => Some(m.term),
            RaftMessage::ConfigureReply(m) => Some(m.term),
            RaftMessage::ConfigurationReply(m) => Some(m.term),
            RaftMessage::Join(_) | RaftMessage::Leave(_) | RaftMessage::Reconfigure(_) => None,
        }
    }

    /// Returns a short name for the message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            RaftMessage::Append(_) => "Append",
            RaftMessage::AppendReply(_) => "AppendReply",
            RaftMessage::Poll(_) => "Poll",
            RaftMessage::PollReply(_) => "PollReply",
            RaftMessage::Vote(_) => "Vote",
            RaftMessage::VoteReply(_) => "VoteReply",
            RaftMessage::Install(_) => "Install",
            RaftMessage::InstallReply(_) => "InstallReply",
            RaftMessage::Configure(_) => "Configure",
            RaftMessage::ConfigureReply(_) => "ConfigureReply",
            RaftMessage::Join(_) => "Join",
            RaftMessage::Leave(_) => "Leave",
            RaftMessage::Reconfigure(_) => "Reconfigure",
            RaftMessage::ConfigurationReply(_) => "ConfigurationReply",
        }
    }
}

/// A message addressed to a peer.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// The target member.
    pub to: MemberId,
    /// The message to send.
    pub message: RaftMessage,
}

impl Outbound {
    /// Creates a new outbound message.
    pub fn new(to: MemberId, message: RaftMessage) -> Self {
        Self { to, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_request_round_trip() {
        let request = AppendRequest {
            term: 3,
            leader: 1,
            log_index: 10,
            log_term: 2,
            entries: vec![Indexed::new(11, 3, Entry::Initialize { timestamp: 50 })],
            commit_index: 9,
            global_index: 7,
        };

        let bytes = bincode::serialize(&RaftMessage::Append(request.clone())).unwrap();
        let decoded: RaftMessage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, RaftMessage::Append(request));
    }

    #[test]
    fn test_message_term() {
        let poll = RaftMessage::Poll(PollRequest {
            term: 5,
            candidate: 2,
            log_index: 0,
            log_term: 0,
        });
        assert_eq!(poll.term(), Some(5));
        assert_eq!(poll.type_name(), "Poll");

        let join = RaftMessage::Join(JoinRequest {
            member: Member::new(
                4,
                crate::member::MemberType::Reserve,
                "127.0.0.1:5004".parse().unwrap(),
                "127.0.0.1:6004".parse().unwrap(),
            ),
        });
        assert_eq!(join.term(), None);
    }
}
