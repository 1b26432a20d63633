//! Cluster state.
//!
//! Tracks the active configuration and, for each remote member, the
//! leader-side replication view (next/match indices, failure accounting,
//! availability). Configuration entries take effect when *observed* in
//! the log, before commitment, so that a joining server can learn it
//! belongs to the cluster before quorum is reached; a superseded
//! configuration is itself an entry and is undone by log truncation.

use std::collections::HashMap;

use tracing::info;

use cohort_common::{LogIndex, MemberId, Timestamp};
use cohort_protocol::member::{Configuration, Member, MemberStatus, MemberType};

/// Progress of a snapshot transfer to one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallProgress {
    /// The index of the snapshot being sent.
    pub index: LogIndex,
    /// The next chunk offset.
    pub offset: u64,
}

/// The leader's replication view of one remote member.
#[derive(Debug)]
pub struct MemberState {
    /// The member record from the active configuration.
    pub member: Member,
    /// The next log index to send.
    pub next_index: LogIndex,
    /// The highest index known replicated on the member.
    pub match_index: LogIndex,
    /// When an append was last sent.
    pub last_attempt: Timestamp,
    /// When a successful response was last received.
    pub last_ack: Timestamp,
    /// When the member last confirmed the leader's commit index.
    pub last_commit: Timestamp,
    /// Consecutive append failures.
    pub failures: u32,
    /// Whether a request is outstanding.
    pub in_flight: bool,
    /// Snapshot transfer progress, when the member is too far behind.
    pub installing: Option<InstallProgress>,
}

impl MemberState {
    fn new(member: Member, last_index: LogIndex) -> Self {
        Self {
            member,
            next_index: last_index + 1,
            match_index: 0,
            last_attempt: 0,
            last_ack: 0,
            last_commit: 0,
            failures: 0,
            in_flight: false,
            installing: None,
        }
    }

    /// Resets replication progress, as on a new leader's election.
    pub fn reset(&mut self, last_index: LogIndex) {
        self.next_index = last_index + 1;
        self.match_index = 0;
        self.last_attempt = 0;
        self.failures = 0;
        self.in_flight = false;
        self.installing = None;
    }

    /// Records a successful append response.
    pub fn on_success(&mut self, match_index: LogIndex, now: Timestamp) {
        if match_index > self.match_index {
            self.match_index = match_index;
        }
        self.next_index = self.next_index.max(match_index + 1);
        self.failures = 0;
        self.in_flight = false;
        self.last_ack = now;
        self.member.status = MemberStatus::Available;
    }

    /// Records a failed append response with the responder's index hint.
    pub fn on_failure(&mut self, hint: LogIndex) {
        self.failures += 1;
        self.in_flight = false;
        self.next_index = (hint + 1).max(1);
    }
}

/// How a configuration change affected the local member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalTransition {
    /// The local member's type did not change.
    Unchanged,
    /// The local member changed type.
    Changed {
        /// The type before the change, if the member was present.
        from: Option<MemberType>,
        /// The type after the change, if the member remains.
        to: Option<MemberType>,
    },
}

/// The cluster state of one server.
#[derive(Debug)]
pub struct ClusterState {
    member_id: MemberId,
    configuration: Configuration,
    members: HashMap<MemberId, MemberState>,
}

impl ClusterState {
    /// Creates cluster state for the given local member and initial
    /// configuration.
    pub fn new(member_id: MemberId, configuration: Configuration) -> Self {
        let mut state = Self {
            member_id,
            configuration: Configuration::seed(Vec::new()),
            members: HashMap::new(),
        };
        state.configure(configuration, 0);
        state
    }

    /// Returns the local member id.
    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    /// Returns the active configuration.
    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Returns the index of the active configuration entry.
    pub fn configuration_index(&self) -> LogIndex {
        self.configuration.index
    }

    /// Returns the local member's record, if it is in the configuration.
    pub fn local_member(&self) -> Option<&Member> {
        self.configuration.member(self.member_id)
    }

    /// Returns the local member's type, if present.
    pub fn local_type(&self) -> Option<MemberType> {
        self.local_member().map(|m| m.member_type)
    }

    /// Returns the number of votes required for a quorum.
    pub fn quorum_size(&self) -> usize {
        self.configuration.quorum_size()
    }

    /// Returns true if the local member votes.
    pub fn is_voter(&self) -> bool {
        self.local_type() == Some(MemberType::Active)
    }

    /// Applies an observed configuration, reconciling the per-member
    /// replication views, and reports how the local member was affected.
    pub fn configure(&mut self, configuration: Configuration, last_index: LogIndex) -> LocalTransition {
        let previous = self.local_type();

        self.members.retain(|id, _| {
            configuration.member(*id).is_some()
        });
        for member in &configuration.members {
            if member.id == self.member_id {
                continue;
            }
            match self.members.get_mut(&member.id) {
                Some(state) => state.member = member.clone(),
                None => {
                    self.members
                        .insert(member.id, MemberState::new(member.clone(), last_index));
                }
            }
        }

        if configuration.index > 0 && configuration.index != self.configuration.index {
            info!(
                index = configuration.index,
                members = configuration.members.len(),
                "observed configuration"
            );
        }
        self.configuration = configuration;

        let current = self.local_type();
        if previous == current {
            LocalTransition::Unchanged
        } else {
            LocalTransition::Changed {
                from: previous,
                to: current,
            }
        }
    }

    /// Returns the replication view of a remote member.
    pub fn member_state(&self, id: MemberId) -> Option<&MemberState> {
        self.members.get(&id)
    }

    /// Returns the mutable replication view of a remote member.
    pub fn member_state_mut(&mut self, id: MemberId) -> Option<&mut MemberState> {
        self.members.get_mut(&id)
    }

    /// Iterates over remote members' replication views.
    pub fn remote_members(&self) -> impl Iterator<Item = &MemberState> {
        self.members.values()
    }

    /// Iterates mutably over remote members' replication views.
    pub fn remote_members_mut(&mut self) -> impl Iterator<Item = &mut MemberState> {
        self.members.values_mut()
    }

    /// Returns the match indices of remote *active* members.
    pub fn active_match_indices(&self) -> Vec<LogIndex> {
        self.members
            .values()
            .filter(|m| m.member.is_active())
            .map(|m| m.match_index)
            .collect()
    }

    /// Returns the ack times of remote active members.
    pub fn active_ack_times(&self) -> Vec<Timestamp> {
        self.members
            .values()
            .filter(|m| m.member.is_active())
            .map(|m| m.last_ack)
            .collect()
    }

    /// Resets all members' replication progress, as on taking leadership.
    pub fn reset_replication(&mut self, last_index: LogIndex) {
        for member in self.members.values_mut() {
            member.reset(last_index);
        }
    }

    /// Marks a member unavailable after repeated failures.
    pub fn mark_unavailable(&mut self, id: MemberId) {
        if let Some(state) = self.members.get_mut(&id) {
            if state.member.status != MemberStatus::Unavailable {
                info!(member = id, "marking member unavailable");
                state.member.status = MemberStatus::Unavailable;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: MemberId, member_type: MemberType) -> Member {
        Member::new(
            id,
            member_type,
            format!("127.0.0.1:{}", 5000 + id).parse().unwrap(),
            format!("127.0.0.1:{}", 6000 + id).parse().unwrap(),
        )
    }

    fn config(index: LogIndex, members: Vec<Member>) -> Configuration {
        Configuration {
            index,
            term: 1,
            timestamp: 0,
            members,
        }
    }

    #[test]
    fn test_new_cluster_tracks_remotes() {
        let state = ClusterState::new(
            1,
            config(
                0,
                vec![
                    member(1, MemberType::Active),
                    member(2, MemberType::Active),
                    member(3, MemberType::Passive),
                ],
            ),
        );

        assert_eq!(state.member_id(), 1);
        assert!(state.is_voter());
        assert_eq!(state.remote_members().count(), 2);
        assert!(state.member_state(1).is_none());
        assert_eq!(state.quorum_size(), 2);
    }

    #[test]
    fn test_configure_reports_local_transition() {
        let mut state = ClusterState::new(
            2,
            config(0, vec![member(1, MemberType::Active), member(2, MemberType::Reserve)]),
        );
        assert_eq!(state.local_type(), Some(MemberType::Reserve));

        let transition = state.configure(
            config(5, vec![member(1, MemberType::Active), member(2, MemberType::Passive)]),
            5,
        );
        assert_eq!(
            transition,
            LocalTransition::Changed {
                from: Some(MemberType::Reserve),
                to: Some(MemberType::Passive),
            }
        );

        let transition = state.configure(
            config(8, vec![member(1, MemberType::Active), member(2, MemberType::Passive)]),
            8,
        );
        assert_eq!(transition, LocalTransition::Unchanged);
    }

    #[test]
    fn test_configure_removes_departed_members() {
        let mut state = ClusterState::new(
            1,
            config(
                0,
                vec![
                    member(1, MemberType::Active),
                    member(2, MemberType::Active),
                    member(3, MemberType::Active),
                ],
            ),
        );
        assert_eq!(state.remote_members().count(), 2);

        state.configure(
            config(9, vec![member(1, MemberType::Active), member(3, MemberType::Active)]),
            9,
        );
        assert!(state.member_state(2).is_none());
        assert!(state.member_state(3).is_some());
    }

    #[test]
    fn test_member_progress_accounting() {
        let mut state = ClusterState::new(
            1,
            config(0, vec![member(1, MemberType::Active), member(2, MemberType::Active)]),
        );
        state.reset_replication(10);

        let progress = state.member_state_mut(2).unwrap();
        assert_eq!(progress.next_index, 11);
        assert_eq!(progress.match_index, 0);

        progress.on_success(10, 500);
        assert_eq!(progress.match_index, 10);
        assert_eq!(progress.next_index, 11);
        assert_eq!(progress.last_ack, 500);

        progress.on_failure(4);
        assert_eq!(progress.next_index, 5);
        assert_eq!(progress.failures, 1);
    }

    #[test]
    fn test_mark_unavailable() {
        let mut state = ClusterState::new(
            1,
            config(0, vec![member(1, MemberType::Active), member(2, MemberType::Active)]),
        );
        state.mark_unavailable(2);
        assert_eq!(
            state.member_state(2).unwrap().member.status,
            MemberStatus::Unavailable
        );

        // A success restores availability.
        state.member_state_mut(2).unwrap().on_success(3, 100);
        assert_eq!(
            state.member_state(2).unwrap().member.status,
            MemberStatus::Available
        );
    }

    #[test]
    fn test_removed_local_member() {
        let mut state = ClusterState::new(
            2,
            config(0, vec![member(1, MemberType::Active), member(2, MemberType::Active)]),
        );
        let transition = state.configure(config(4, vec![member(1, MemberType::Active)]), 4);
        assert_eq!(
            transition,
            LocalTransition::Changed {
                from: Some(MemberType::Active),
                to: None,
            }
        );
        assert!(!state.is_voter());
    }
}
