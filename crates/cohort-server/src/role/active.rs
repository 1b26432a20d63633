//! Append, poll, vote, install, and configure handling for replica
//! roles (Reserve, Passive, Follower).

use tracing::{debug, warn};

use cohort_common::{ErrorKind, MemberId, Timestamp};
use cohort_protocol::entry::Entry;
use cohort_protocol::member::{Configuration, MemberType};
use cohort_protocol::raft::{
    AppendRequest, AppendResponse, ConfigureRequest, ConfigureResponse, InstallRequest,
    InstallResponse, Outbound, PollRequest, PollResponse, RaftMessage, VoteRequest, VoteResponse,
};
use cohort_protocol::Status;

use crate::context::{Role, ServerContext};
use crate::state_machine::StateMachine;

impl<S: StateMachine> ServerContext<S> {
    /// Handles an Append request in any replica role.
    pub(crate) fn handle_append(
        &mut self,
        from: MemberId,
        request: AppendRequest,
        now: Timestamp,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();

        // Stale leaders learn the current term from the rejection.
        if request.term < self.term {
            out.push(Outbound::new(
                from,
                RaftMessage::AppendReply(AppendResponse {
                    status: Status::Ok,
                    term: self.term,
                    succeeded: false,
                    log_index: self.log.last_index(),
                }),
            ));
            return out;
        }

        // A valid append identifies the leader for this term.
        self.leader = Some(request.leader);
        match self.role() {
            Role::Candidate => {
                out.extend(self.transition(Role::Follower, now));
                self.reset_election_timer(now);
            }
            Role::Follower => self.reset_election_timer(now),
            _ => {}
        }

        match self.role() {
            Role::Inactive => {
                out.push(Outbound::new(
                    from,
                    RaftMessage::AppendReply(AppendResponse {
                        status: Status::Error(ErrorKind::IllegalMemberState),
                        term: self.term,
                        succeeded: false,
                        log_index: 0,
                    }),
                ));
            }
            Role::Reserve => {
                // Reserve members hold no log; they track the leader's
                // progress markers only.
                self.global_index = request.global_index;
                out.push(Outbound::new(
                    from,
                    RaftMessage::AppendReply(AppendResponse {
                        status: Status::Ok,
                        term: self.term,
                        succeeded: true,
                        log_index: 0,
                    }),
                ));
            }
            Role::Passive | Role::Follower => {
                out.extend(self.append_entries(from, request, now));
            }
            Role::Candidate | Role::Leader => {
                // Same-term append from another leader cannot happen
                // under election safety; the transitions above already
                // put us in Follower for the interesting cases.
                out.extend(self.append_entries(from, request, now));
            }
        }
        out
    }

    fn append_entries(
        &mut self,
        from: MemberId,
        request: AppendRequest,
        now: Timestamp,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();
        let passive = self.role() == Role::Passive;

        // Previous-entry check.
        let last_index = self.log.last_index();
        if request.log_index > last_index {
            debug!(
                member = self.id,
                prev = request.log_index,
                last = last_index,
                "rejecting append: missing previous entry"
            );
            out.push(Outbound::new(
                from,
                RaftMessage::AppendReply(AppendResponse {
                    status: Status::Ok,
                    term: self.term,
                    succeeded: false,
                    log_index: last_index,
                }),
            ));
            return out;
        }
        if request.log_index > 0 {
            // A hole (skipped or compacted) cannot be verified and is
            // accepted; a term mismatch rolls the leader back one entry.
            if let Some(local_term) = self.log.term_at(request.log_index) {
                if local_term != request.log_term {
                    debug!(
                        member = self.id,
                        index = request.log_index,
                        local_term,
                        leader_term = request.log_term,
                        "rejecting append: previous term mismatch"
                    );
                    out.push(Outbound::new(
                        from,
                        RaftMessage::AppendReply(AppendResponse {
                            status: Status::Ok,
                            term: self.term,
                            succeeded: false,
                            log_index: request.log_index - 1,
                        }),
                    ));
                    return out;
                }
            }
        }

        for entry in request.entries {
            // Passive replicas never hold entries past the leader's
            // commit point.
            if passive && entry.index > request.commit_index {
                break;
            }

            let last = self.log.last_index();
            if entry.index <= last {
                match self.log.term_at(entry.index) {
                    Some(term) if term == entry.term => continue,
                    _ => {
                        // Conflict: truncate the suffix and append.
                        if let Err(error) = self.writer.truncate(entry.index - 1) {
                            warn!("truncation failed: {error}");
                            out.push(Outbound::new(
                                from,
                                RaftMessage::AppendReply(AppendResponse {
                                    status: Status::Error(ErrorKind::InternalError),
                                    term: self.term,
                                    succeeded: false,
                                    log_index: self.log.last_index(),
                                }),
                            ));
                            return out;
                        }
                    }
                }
            } else if entry.index > last + 1 {
                if let Err(error) = self.writer.skip(entry.index - last - 1) {
                    warn!("skip failed: {error}");
                }
            }

            let configuration = match &entry.entry {
                Entry::Configuration { timestamp, members } => Some(Configuration {
                    index: entry.index,
                    term: entry.term,
                    timestamp: *timestamp,
                    members: members.clone(),
                }),
                _ => None,
            };

            if let Err(error) = self.writer.append_indexed(entry) {
                warn!("append failed: {error}");
                out.push(Outbound::new(
                    from,
                    RaftMessage::AppendReply(AppendResponse {
                        status: Status::Error(ErrorKind::InternalError),
                        term: self.term,
                        succeeded: false,
                        log_index: self.log.last_index(),
                    }),
                ));
                return out;
            }

            // Configuration entries take effect on observation, not
            // commitment.
            if let Some(configuration) = configuration {
                out.extend(self.observe_configuration(configuration, now));
            }
        }

        let last = self.log.last_index();
        let commit = request.commit_index.min(last);
        if let Err(error) = self.log.commit(commit) {
            warn!("commit failed: {error}");
        }
        self.global_index = request.global_index;
        self.apply_all(now);

        // An active member catching up passively becomes a follower once
        // it holds everything the leader has committed.
        if self.role() == Role::Passive
            && self.cluster.local_type() == Some(MemberType::Active)
            && self.log.commit_index() >= request.commit_index
        {
            out.extend(self.transition(Role::Follower, now));
        }

        out.push(Outbound::new(
            from,
            RaftMessage::AppendReply(AppendResponse {
                status: Status::Ok,
                term: self.term,
                succeeded: true,
                log_index: last,
            }),
        ));
        out
    }

    /// Handles an advisory Poll (pre-vote) request.
    pub(crate) fn handle_poll(&mut self, from: MemberId, request: PollRequest) -> Outbound {
        let accepted = match self.role() {
            Role::Inactive | Role::Reserve | Role::Passive => false,
            _ => {
                request.term >= self.term
                    && self.log_up_to_date(request.log_index, request.log_term)
            }
        };
        Outbound::new(
            from,
            RaftMessage::PollReply(PollResponse {
                status: Status::Ok,
                term: self.term,
                accepted,
            }),
        )
    }

    /// Handles a Vote request.
    pub(crate) fn handle_vote(
        &mut self,
        from: MemberId,
        request: VoteRequest,
        now: Timestamp,
    ) -> Outbound {
        let voted = match self.role() {
            Role::Inactive | Role::Reserve | Role::Passive => false,
            _ => {
                let can_vote = request.term >= self.term
                    && self
                        .voted_for
                        .map(|candidate| candidate == request.candidate)
                        .unwrap_or(true);
                let log_ok = self.log_up_to_date(request.log_index, request.log_term);
                if can_vote && log_ok {
                    debug!(member = self.id, candidate = request.candidate, term = self.term, "voting");
                    self.record_vote(request.candidate);
                    self.reset_election_timer(now);
                    true
                } else {
                    false
                }
            }
        };
        Outbound::new(
            from,
            RaftMessage::VoteReply(VoteResponse {
                status: Status::Ok,
                term: self.term,
                voted,
            }),
        )
    }

    /// Returns true if a candidate's last entry is at least as up to date
    /// as the local log.
    pub(crate) fn log_up_to_date(&self, last_index: u64, last_term: u64) -> bool {
        let local_term = self.log.last_term();
        if last_term != local_term {
            last_term > local_term
        } else {
            last_index >= self.log.last_index()
        }
    }

    /// Handles an incoming snapshot chunk.
    pub(crate) fn handle_install(
        &mut self,
        from: MemberId,
        request: InstallRequest,
        now: Timestamp,
    ) -> Outbound {
        if request.term < self.term || self.role() == Role::Inactive {
            return Outbound::new(
                from,
                RaftMessage::InstallReply(InstallResponse {
                    status: Status::Error(ErrorKind::IllegalMemberState),
                    term: self.term,
                }),
            );
        }

        self.leader = Some(request.leader);
        if self.role() == Role::Follower {
            self.reset_election_timer(now);
        }

        let stored = self.receive_install_chunk(
            request.index,
            request.offset,
            &request.data,
            request.complete,
        );
        if stored {
            // Bring the executor up to the snapshot before more entries
            // arrive.
            self.executor.install_snapshot_if_newer(request.index);
            self.apply_all(now);
        }

        Outbound::new(
            from,
            RaftMessage::InstallReply(InstallResponse {
                status: Status::Ok,
                term: self.term,
            }),
        )
    }

    /// Handles configuration propagation from the leader.
    pub(crate) fn handle_configure(
        &mut self,
        from: MemberId,
        request: ConfigureRequest,
        now: Timestamp,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();
        if request.term >= self.term {
            self.leader = Some(request.leader);
            if self.role() == Role::Follower {
                self.reset_election_timer(now);
            }
            out.extend(self.observe_configuration(
                Configuration {
                    index: request.index,
                    term: request.term,
                    timestamp: request.timestamp,
                    members: request.members,
                },
                now,
            ));
        }
        out.push(Outbound::new(
            from,
            RaftMessage::ConfigureReply(ConfigureResponse {
                status: Status::Ok,
                term: self.term,
            }),
        ));
        out
    }

    /// Handles the response to a Join sent while this server was
    /// entering the cluster.
    pub(crate) fn handle_configuration_reply(
        &mut self,
        response: cohort_protocol::raft::ConfigurationResponse,
        now: Timestamp,
    ) -> Vec<Outbound> {
        if response.status != Status::Ok {
            return Vec::new();
        }
        self.observe_configuration(
            Configuration {
                index: response.index,
                term: response.term,
                timestamp: response.timestamp,
                members: response.members,
            },
            now,
        )
    }
}
