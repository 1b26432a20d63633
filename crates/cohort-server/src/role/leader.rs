//! Leader-side handling: leadership establishment, the append/commit
//! pipeline, membership changes, and linearizable-query release.

use tracing::{debug, info, warn};

use cohort_common::{MemberId, Timestamp};
use cohort_protocol::entry::Entry;
use cohort_protocol::member::{Configuration, Member, MemberType};
use cohort_protocol::raft::{
    AppendResponse, ConfigurationResponse, ConfigureRequest, InstallResponse, JoinRequest,
    LeaveRequest, Outbound, RaftMessage, ReconfigureRequest,
};
use cohort_protocol::Status;

use crate::context::{ClientEffect, Role, RoleState, ServerContext};
use crate::state_machine::StateMachine;

impl<S: StateMachine> ServerContext<S> {
    /// Establishes leadership: resets replication views, appends the
    /// Initialize and Configuration entries, and starts replicating.
    /// Client operations are accepted only once the Initialize entry
    /// commits.
    pub(crate) fn take_leadership(&mut self, now: Timestamp) -> Vec<Outbound> {
        self.leader = Some(self.id);
        self.cluster.reset_replication(self.log.last_index());

        let Some(init_index) = self.append_entry(Entry::Initialize { timestamp: now }) else {
            return self.transition(Role::Follower, now);
        };

        let members = self.cluster.configuration().members.clone();
        let Some(config_index) = self.append_entry(Entry::Configuration {
            timestamp: now,
            members: members.clone(),
        }) else {
            return self.transition(Role::Follower, now);
        };

        let term = self.term;
        let mut out = self.observe_configuration(
            Configuration {
                index: config_index,
                term,
                timestamp: now,
                members,
            },
            now,
        );

        if let RoleState::Leader(leader) = &mut self.role {
            leader.leader_index = init_index;
            leader.configuring = config_index;
        }
        info!(member = self.id, term = self.term, index = init_index, "taking leadership");

        out.extend(self.configure_reserves(now));
        out.extend(self.leader_cycle(now));
        out
    }

    /// Returns true while a configuration change is uncommitted.
    pub(crate) fn configuring(&self) -> bool {
        matches!(&self.role, RoleState::Leader(leader) if leader.configuring > 0)
    }

    /// Returns true until the leader's Initialize entry has committed.
    /// Configuration changes are refused during initialization.
    pub(crate) fn initializing(&self) -> bool {
        match &self.role {
            RoleState::Leader(leader) => {
                leader.leader_index == 0 || self.log.commit_index() < leader.leader_index
            }
            _ => true,
        }
    }

    /// One leader round: replicate to members, advance the commit index,
    /// and release any linearizable queries whose heartbeat round has
    /// completed.
    pub(crate) fn leader_cycle(&mut self, now: Timestamp) -> Vec<Outbound> {
        let term = self.term;
        let out = match &mut self.role {
            RoleState::Leader(leader) => leader.appender.append_cycle(
                now,
                term,
                &mut self.cluster,
                &self.log,
                &self.snapshots,
            ),
            _ => return Vec::new(),
        };
        self.advance_commit(now);
        self.release_linearizable(now);
        out
    }

    /// Advances the commit index to the quorum index when it lands on a
    /// current-term entry, then applies.
    pub(crate) fn advance_commit(&mut self, now: Timestamp) {
        let new_commit = match &self.role {
            RoleState::Leader(leader) => {
                let quorum = leader
                    .appender
                    .quorum_index(&self.cluster, self.log.last_index());
                (quorum > self.log.commit_index() && self.log.term_at(quorum) == Some(self.term))
                    .then_some(quorum)
            }
            _ => None,
        };

        let Some(commit) = new_commit else {
            return;
        };
        if let Err(error) = self.log.commit(commit) {
            warn!("commit failed: {error}");
            return;
        }
        if let RoleState::Leader(leader) = &mut self.role {
            if leader.configuring > 0 && leader.configuring <= commit {
                leader.configuring = 0;
            }
        }
        self.apply_all(now);
    }

    /// Completes linearizable queries once a quorum has acknowledged an
    /// append sent at or after their execution.
    pub(crate) fn release_linearizable(&mut self, now: Timestamp) {
        let released = match &mut self.role {
            RoleState::Leader(leader) => {
                let ack_time = leader.appender.quorum_ack_time(now, &self.cluster);
                let mut released = Vec::new();
                let mut waiting = Vec::new();
                for entry in leader.linearizable.drain(..) {
                    if entry.0 <= ack_time {
                        released.push(entry);
                    } else {
                        waiting.push(entry);
                    }
                }
                leader.linearizable = waiting;
                released
            }
            _ => return,
        };

        for (_, connection, request, response) in released {
            self.effects.push(ClientEffect::Respond {
                connection,
                request,
                response,
            });
        }
    }

    /// Returns true if the leader's lease is current: a quorum has been
    /// heard from within the last election timeout.
    pub(crate) fn lease_current(&self, now: Timestamp) -> bool {
        match &self.role {
            RoleState::Leader(leader) => {
                let ack = leader.appender.quorum_ack_time(now, &self.cluster);
                now.saturating_sub(ack) <= self.config.election_timeout_ms()
            }
            _ => false,
        }
    }

    /// Handles an Append response.
    pub(crate) fn handle_append_reply(
        &mut self,
        from: MemberId,
        response: AppendResponse,
        now: Timestamp,
    ) -> Vec<Outbound> {
        // A higher term already forced a step-down in the dispatch
        // preamble; replies from other terms are ignored.
        if self.role() != Role::Leader || response.term != self.term {
            return Vec::new();
        }

        let term = self.term;
        let commit = match &mut self.role {
            RoleState::Leader(leader) => leader.appender.handle_append_reply(
                from,
                &response,
                now,
                term,
                &mut self.cluster,
                &self.log,
            ),
            _ => return Vec::new(),
        };

        if let Some(commit) = commit {
            debug!(member = self.id, commit, "commit index advanced");
            if let Err(error) = self.log.commit(commit) {
                warn!("commit failed: {error}");
            } else {
                if let RoleState::Leader(leader) = &mut self.role {
                    if leader.configuring > 0 && leader.configuring <= commit {
                        leader.configuring = 0;
                    }
                }
                self.apply_all(now);
            }
        }
        self.release_linearizable(now);

        // Keep draining members that still have entries pending.
        self.leader_cycle(now)
    }

    /// Handles an Install response.
    pub(crate) fn handle_install_reply(
        &mut self,
        from: MemberId,
        response: InstallResponse,
        now: Timestamp,
    ) {
        if self.role() != Role::Leader {
            return;
        }
        if let RoleState::Leader(leader) = &mut self.role {
            leader
                .appender
                .handle_install_reply(from, &response, now, &mut self.cluster, &self.snapshots);
        }
    }

    /// Handles a Join request from a server entering the cluster.
    pub(crate) fn handle_join(
        &mut self,
        from: MemberId,
        request: JoinRequest,
        now: Timestamp,
    ) -> Vec<Outbound> {
        if self.role() != Role::Leader {
            return vec![Outbound::new(from, configuration_error(self.term))];
        }
        if self.configuring() || self.initializing() {
            return vec![Outbound::new(from, configuration_error(self.term))];
        }

        // Joining an existing member is idempotent.
        if self
            .cluster
            .configuration()
            .member(request.member.id)
            .is_some()
        {
            let configuration = self.cluster.configuration();
            return vec![Outbound::new(
                from,
                RaftMessage::ConfigurationReply(ConfigurationResponse {
                    status: Status::Ok,
                    index: configuration.index,
                    term: configuration.term,
                    timestamp: configuration.timestamp,
                    members: configuration.members.clone(),
                }),
            )];
        }

        let mut members = self.cluster.configuration().members.clone();
        let mut joining = request.member;
        joining.updated = now;
        members.push(joining);
        self.commit_configuration(from, members, now)
    }

    /// Handles a Leave request from a departing member.
    pub(crate) fn handle_leave(
        &mut self,
        from: MemberId,
        request: LeaveRequest,
        now: Timestamp,
    ) -> Vec<Outbound> {
        if self.role() != Role::Leader || self.configuring() || self.initializing() {
            return vec![Outbound::new(from, configuration_error(self.term))];
        }

        let mut members = self.cluster.configuration().members.clone();
        let before = members.len();
        members.retain(|m| m.id != request.member.id);
        if members.len() == before {
            // Unknown members are already gone.
            let configuration = self.cluster.configuration();
            return vec![Outbound::new(
                from,
                RaftMessage::ConfigurationReply(ConfigurationResponse {
                    status: Status::Ok,
                    index: configuration.index,
                    term: configuration.term,
                    timestamp: configuration.timestamp,
                    members: configuration.members.clone(),
                }),
            )];
        }
        self.commit_configuration(from, members, now)
    }

    /// Handles a Reconfigure request changing a member's type or
    /// addresses.
    pub(crate) fn handle_reconfigure(
        &mut self,
        from: MemberId,
        request: ReconfigureRequest,
        now: Timestamp,
    ) -> Vec<Outbound> {
        if self.role() != Role::Leader || self.configuring() || self.initializing() {
            return vec![Outbound::new(from, configuration_error(self.term))];
        }
        // Stale reconfigurations raced a newer change and lose.
        if request.index < self.cluster.configuration_index() {
            return vec![Outbound::new(from, configuration_error(self.term))];
        }

        let mut members = self.cluster.configuration().members.clone();
        let Some(position) = members.iter().position(|m| m.id == request.member.id) else {
            return vec![Outbound::new(from, configuration_error(self.term))];
        };
        let mut updated = request.member;
        updated.updated = now;
        members[position] = updated;
        self.commit_configuration(from, members, now)
    }

    /// Appends a Configuration entry, observes it, replies to the
    /// requester, and pushes the change out.
    fn commit_configuration(
        &mut self,
        from: MemberId,
        members: Vec<Member>,
        now: Timestamp,
    ) -> Vec<Outbound> {
        let Some(index) = self.append_entry(Entry::Configuration {
            timestamp: now,
            members: members.clone(),
        }) else {
            return vec![Outbound::new(from, configuration_error(self.term))];
        };
        let term = self.term;

        let mut out = self.observe_configuration(
            Configuration {
                index,
                term,
                timestamp: now,
                members: members.clone(),
            },
            now,
        );
        if let RoleState::Leader(leader) = &mut self.role {
            leader.configuring = index;
        }
        info!(member = self.id, index, "logged configuration change");

        out.push(Outbound::new(
            from,
            RaftMessage::ConfigurationReply(ConfigurationResponse {
                status: Status::Ok,
                index,
                term,
                timestamp: now,
                members,
            }),
        ));
        out.extend(self.configure_reserves(now));
        out.extend(self.leader_cycle(now));
        out
    }

    /// Propagates the active configuration to reserve members, which do
    /// not receive appends.
    pub(crate) fn configure_reserves(&mut self, now: Timestamp) -> Vec<Outbound> {
        let configuration = self.cluster.configuration();
        let request = ConfigureRequest {
            term: self.term,
            leader: self.id,
            index: configuration.index,
            timestamp: now,
            members: configuration.members.clone(),
        };
        configuration
            .members_of(MemberType::Reserve)
            .filter(|m| m.id != self.id)
            .map(|m| Outbound::new(m.id, RaftMessage::Configure(request.clone())))
            .collect()
    }
}

fn configuration_error(term: cohort_common::Term) -> RaftMessage {
    RaftMessage::ConfigurationReply(ConfigurationResponse {
        status: Status::Error(cohort_common::ErrorKind::ConfigurationError),
        index: 0,
        term,
        timestamp: 0,
        members: Vec::new(),
    })
}
