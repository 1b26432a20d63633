//! Election handling: the pre-vote (Poll) round followed by the binding
//! Vote round.
//!
//! A candidate first polls the other active members with its *next* term
//! without incrementing anything; only when a majority indicates it
//! would win does it increment the term, vote for itself, and request
//! binding votes. This keeps unreachable or partitioned members from
//! inflating the cluster term.

use std::collections::HashSet;

use tracing::{debug, info};

use cohort_common::{MemberId, Timestamp};
use cohort_protocol::member::MemberType;
use cohort_protocol::raft::{
    Outbound, PollRequest, PollResponse, RaftMessage, VoteRequest, VoteResponse,
};

use crate::context::{CandidateState, Role, RoleState, ServerContext};
use crate::state_machine::StateMachine;

impl<S: StateMachine> ServerContext<S> {
    /// Starts (or restarts) an election with a pre-vote round.
    pub fn start_election(&mut self, now: Timestamp) -> Vec<Outbound> {
        if !self.cluster.is_voter() {
            return Vec::new();
        }

        let mut out = self.transition(Role::Candidate, now);
        // Restarting an election resets the round state.
        let mut votes = HashSet::new();
        votes.insert(self.id);
        self.role = RoleState::Candidate(CandidateState {
            polling: true,
            votes,
        });
        self.reset_election_timer(now);

        debug!(member = self.id, term = self.term, "polling members");
        let request = PollRequest {
            term: self.term + 1,
            candidate: self.id,
            log_index: self.log.last_index(),
            log_term: self.log.last_term(),
        };
        for member in self.remote_active_members() {
            out.push(Outbound::new(member, RaftMessage::Poll(request.clone())));
        }

        if self.poll_quorum_reached() {
            out.extend(self.start_vote_round(now));
        }
        out
    }

    /// Handles a Poll response while polling.
    pub(crate) fn handle_poll_reply(
        &mut self,
        from: MemberId,
        response: PollResponse,
        now: Timestamp,
    ) -> Vec<Outbound> {
        // A higher term in an advisory reply still means this member is
        // behind.
        if response.term > self.term {
            self.update_term(response.term, None);
            return self.transition(Role::Follower, now);
        }

        let accepted = {
            let RoleState::Candidate(candidate) = &mut self.role else {
                return Vec::new();
            };
            if !candidate.polling {
                return Vec::new();
            }
            if response.accepted {
                candidate.votes.insert(from);
            }
            response.accepted
        };

        if accepted && self.poll_quorum_reached() {
            self.start_vote_round(now)
        } else {
            Vec::new()
        }
    }

    /// Handles a Vote response while voting.
    pub(crate) fn handle_vote_reply(
        &mut self,
        from: MemberId,
        response: VoteResponse,
        now: Timestamp,
    ) -> Vec<Outbound> {
        if self.role() != Role::Candidate || response.term != self.term {
            return Vec::new();
        }

        let won = {
            let RoleState::Candidate(candidate) = &mut self.role else {
                return Vec::new();
            };
            if candidate.polling {
                return Vec::new();
            }
            if response.voted {
                candidate.votes.insert(from);
            }
            candidate.votes.len() >= self.cluster.quorum_size()
        };

        if won {
            info!(member = self.id, term = self.term, "won election");
            self.transition(Role::Leader, now)
        } else {
            Vec::new()
        }
    }

    /// Moves from the poll round to the binding vote round.
    fn start_vote_round(&mut self, now: Timestamp) -> Vec<Outbound> {
        self.term += 1;
        self.record_vote(self.id);

        let mut votes = HashSet::new();
        votes.insert(self.id);
        self.role = RoleState::Candidate(CandidateState {
            polling: false,
            votes,
        });

        debug!(member = self.id, term = self.term, "requesting votes");
        let request = VoteRequest {
            term: self.term,
            candidate: self.id,
            log_index: self.log.last_index(),
            log_term: self.log.last_term(),
        };
        let mut out: Vec<Outbound> = self
            .remote_active_members()
            .into_iter()
            .map(|member| Outbound::new(member, RaftMessage::Vote(request.clone())))
            .collect();

        // A single-member cluster wins immediately.
        if 1 >= self.cluster.quorum_size() {
            info!(member = self.id, term = self.term, "won election");
            out.extend(self.transition(Role::Leader, now));
        }
        out
    }

    fn poll_quorum_reached(&self) -> bool {
        match &self.role {
            RoleState::Candidate(candidate) => {
                candidate.polling && candidate.votes.len() >= self.cluster.quorum_size()
            }
            _ => false,
        }
    }

    pub(crate) fn remote_active_members(&self) -> Vec<MemberId> {
        self.cluster
            .configuration()
            .members_of(MemberType::Active)
            .map(|m| m.id)
            .filter(|id| *id != self.id)
            .collect()
    }
}
