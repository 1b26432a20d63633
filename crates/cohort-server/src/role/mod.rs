//! Role-specific message handling.
//!
//! [`ServerContext::handle_raft`] is the single entry point for
//! server-to-server messages. It applies term supremacy (any message with
//! a higher term forces voting members back to Follower), then dispatches
//! to the handler for the message type; each handler consults the current
//! role. Poll messages are exempt from term supremacy: pre-votes are
//! advisory and must not inflate terms.

mod active;
mod candidate;
mod leader;

use tracing::trace;

use cohort_common::{MemberId, Timestamp};
use cohort_protocol::raft::{Outbound, RaftMessage};

use crate::context::{Role, ServerContext};
use crate::state_machine::StateMachine;

impl<S: StateMachine> ServerContext<S> {
    /// Handles a message from another server, returning the messages to
    /// send in response.
    pub fn handle_raft(
        &mut self,
        from: MemberId,
        message: RaftMessage,
        now: Timestamp,
    ) -> Vec<Outbound> {
        trace!(member = self.id, from, message = message.type_name(), "handling");
        let mut out = Vec::new();

        // Term supremacy. Polls are advisory and excluded.
        let advisory = matches!(
            message,
            RaftMessage::Poll(_) | RaftMessage::PollReply(_)
        );
        if !advisory {
            if let Some(term) = message.term() {
                if term > self.term {
                    let leader = match &message {
                        RaftMessage::Append(m) => Some(m.leader),
                        RaftMessage::Install(m) => Some(m.leader),
                        RaftMessage::Configure(m) => Some(m.leader),
                        _ => None,
                    };
                    self.update_term(term, leader);
                    if matches!(self.role(), Role::Candidate | Role::Leader) {
                        out.extend(self.transition(Role::Follower, now));
                    }
                }
            }
        }

        match message {
            RaftMessage::Append(request) => out.extend(self.handle_append(from, request, now)),
            RaftMessage::Poll(request) => out.push(self.handle_poll(from, request)),
            RaftMessage::Vote(request) => out.push(self.handle_vote(from, request, now)),
            RaftMessage::Install(request) => out.push(self.handle_install(from, request, now)),
            RaftMessage::Configure(request) => {
                out.extend(self.handle_configure(from, request, now))
            }
            RaftMessage::Join(request) => out.extend(self.handle_join(from, request, now)),
            RaftMessage::Leave(request) => out.extend(self.handle_leave(from, request, now)),
            RaftMessage::Reconfigure(request) => {
                out.extend(self.handle_reconfigure(from, request, now))
            }
            RaftMessage::AppendReply(response) => {
                out.extend(self.handle_append_reply(from, response, now))
            }
            RaftMessage::PollReply(response) => {
                out.extend(self.handle_poll_reply(from, response, now))
            }
            RaftMessage::VoteReply(response) => {
                out.extend(self.handle_vote_reply(from, response, now))
            }
            RaftMessage::InstallReply(response) => {
                self.handle_install_reply(from, response, now)
            }
            RaftMessage::ConfigurationReply(response) => {
                out.extend(self.handle_configuration_reply(response, now))
            }
            RaftMessage::ConfigureReply(_) => {}
        }

        out
    }
}
