//! The leader's replication pipeline.
//!
//! One append cycle walks the remote members and sends each one that is
//! due (entries pending, or heartbeat interval elapsed) an Append request
//! carrying a bounded batch of entries from its `next_index`, the
//! leader's commit index, and the global (fully-replicated) index. A
//! member whose `next_index` has fallen below the log's first index is
//! sent the latest complete snapshot in chunks instead.
//!
//! Commit advancement: after each successful response the quorum index is
//! recomputed as the median match index of the active members (leader
//! included). The commit index only advances onto entries from the
//! leader's current term.

use tracing::{debug, trace};

use cohort_common::{LogIndex, MemberId, Term, Timestamp};
use cohort_protocol::member::MemberType;
use cohort_protocol::raft::{
    AppendRequest, AppendResponse, InstallRequest, InstallResponse, Outbound, RaftMessage,
};
use cohort_protocol::Status;
use cohort_storage::{Log, SnapshotStore};

use crate::cluster::{ClusterState, InstallProgress};
use crate::config::ServerConfig;
use crate::executor::STATE_MACHINE_ID;

/// Maximum entries per Append request.
pub const MAX_BATCH_ENTRIES: usize = 100;

/// Snapshot transfer chunk size.
pub const INSTALL_CHUNK_SIZE: usize = 32 * 1024;

/// Consecutive failures after which a member may be marked unavailable.
pub const MAX_APPEND_FAILURES: u32 = 3;

/// The leader's per-follower replication driver.
#[derive(Debug)]
pub struct LeaderAppender {
    leader: MemberId,
    heartbeat_interval: u64,
    election_timeout: u64,
    global_suspend_timeout: u64,
}

impl LeaderAppender {
    /// Creates an appender for the given leader.
    pub fn new(leader: MemberId, config: &ServerConfig) -> Self {
        Self {
            leader,
            heartbeat_interval: config.heartbeat_interval_ms(),
            election_timeout: config.election_timeout_ms(),
            global_suspend_timeout: config.global_suspend_timeout_ms(),
        }
    }

    /// Runs one append cycle, returning the requests to send.
    pub fn append_cycle(
        &self,
        now: Timestamp,
        term: Term,
        cluster: &mut ClusterState,
        log: &Log,
        snapshots: &SnapshotStore,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();
        let last_index = log.last_index();
        let first_index = log.first_index();
        let commit_index = log.commit_index();
        let global_index = self.global_index(cluster, last_index, now);
        let leader = self.leader;

        for member in cluster.remote_members_mut() {
            if member.member.member_type == MemberType::Reserve {
                continue;
            }
            if member.in_flight && now.saturating_sub(member.last_attempt) < self.election_timeout
            {
                continue;
            }

            let has_entries = member.next_index <= last_index;
            let heartbeat_due =
                now.saturating_sub(member.last_attempt) >= self.heartbeat_interval;
            if !has_entries && !heartbeat_due && member.installing.is_none() {
                continue;
            }

            // A member that has fallen behind the compacted prefix gets a
            // snapshot instead of entries.
            if member.installing.is_none() && member.next_index < first_index {
                if let Some(snapshot) = snapshots.snapshot_by_id(STATE_MACHINE_ID) {
                    member.installing = Some(InstallProgress {
                        index: snapshot.index(),
                        offset: 0,
                    });
                }
            }

            if let Some(progress) = member.installing {
                let Some(snapshot) = snapshots.snapshot_by_id(STATE_MACHINE_ID) else {
                    member.installing = None;
                    continue;
                };
                if snapshot.index() != progress.index {
                    // The snapshot was superseded; restart the transfer.
                    member.installing = Some(InstallProgress {
                        index: snapshot.index(),
                        offset: 0,
                    });
                }
                let progress = member.installing.expect("set above");
                let data = snapshot.data();
                let start = progress.offset as usize;
                let end = (start + INSTALL_CHUNK_SIZE).min(data.len());
                let chunk = data.slice(start..end);

                trace!(member = member.member.id, offset = start, "sending snapshot chunk");
                member.in_flight = true;
                member.last_attempt = now;
                out.push(Outbound::new(
                    member.member.id,
                    RaftMessage::Install(InstallRequest {
                        term,
                        leader,
                        id: STATE_MACHINE_ID,
                        index: snapshot.index(),
                        offset: progress.offset,
                        data: chunk,
                        complete: end >= data.len(),
                    }),
                ));
                continue;
            }

            let prev_index = member.next_index - 1;
            let prev_term = log.term_at(prev_index).unwrap_or(0);

            let mut entries = Vec::new();
            let mut index = member.next_index;
            while index <= last_index && entries.len() < MAX_BATCH_ENTRIES {
                if let Ok(Some(entry)) = log.get(index) {
                    entries.push(entry);
                }
                index += 1;
            }

            member.in_flight = true;
            member.last_attempt = now;
            out.push(Outbound::new(
                member.member.id,
                RaftMessage::Append(AppendRequest {
                    term,
                    leader,
                    log_index: prev_index,
                    log_term: prev_term,
                    entries,
                    commit_index,
                    global_index,
                }),
            ));
        }

        out
    }

    /// Handles an Append response from a member.
    ///
    /// Returns the new commit index when quorum advanced it. The caller
    /// is responsible for stepping down first when the response carries a
    /// higher term.
    pub fn handle_append_reply(
        &self,
        from: MemberId,
        response: &AppendResponse,
        now: Timestamp,
        term: Term,
        cluster: &mut ClusterState,
        log: &Log,
    ) -> Option<LogIndex> {
        let mark_unavailable = {
            let member = cluster.member_state_mut(from)?;
            if response.succeeded {
                member.on_success(response.log_index, now);
                member.last_commit = now;
                false
            } else {
                debug!(member = from, hint = response.log_index, "append rejected");
                member.on_failure(response.log_index);
                member.failures >= MAX_APPEND_FAILURES
                    && now.saturating_sub(member.last_ack) > self.election_timeout
            }
        };

        if mark_unavailable {
            cluster.mark_unavailable(from);
            return None;
        }
        if !response.succeeded {
            return None;
        }

        let quorum_index = self.quorum_index(cluster, log.last_index());
        if quorum_index > log.commit_index() && log.term_at(quorum_index) == Some(term) {
            Some(quorum_index)
        } else {
            None
        }
    }

    /// Handles an Install response, advancing or completing the member's
    /// snapshot transfer.
    pub fn handle_install_reply(
        &self,
        from: MemberId,
        response: &InstallResponse,
        now: Timestamp,
        cluster: &mut ClusterState,
        snapshots: &SnapshotStore,
    ) {
        let Some(member) = cluster.member_state_mut(from) else {
            return;
        };
        member.in_flight = false;

        let Some(progress) = member.installing else {
            return;
        };
        if response.status != Status::Ok {
            member.failures += 1;
            member.installing = None;
            return;
        }

        let Some(snapshot) = snapshots.snapshot_by_id(STATE_MACHINE_ID) else {
            member.installing = None;
            return;
        };
        if snapshot.index() != progress.index {
            member.installing = None;
            return;
        }

        let next_offset = progress.offset + INSTALL_CHUNK_SIZE as u64;
        if next_offset as usize >= snapshot.data().len() {
            debug!(member = from, index = snapshot.index(), "snapshot transfer complete");
            member.installing = None;
            member.on_success(snapshot.index(), now);
        } else {
            member.installing = Some(InstallProgress {
                index: progress.index,
                offset: next_offset,
            });
        }
    }

    /// Returns the highest index replicated on a quorum of active
    /// members, counting the leader at `leader_last`.
    pub fn quorum_index(&self, cluster: &ClusterState, leader_last: LogIndex) -> LogIndex {
        let mut matches = cluster.active_match_indices();
        matches.push(leader_last);
        matches.sort_unstable_by(|a, b| b.cmp(a));

        let quorum = cluster.quorum_size();
        if quorum == 0 || quorum > matches.len() {
            return 0;
        }
        matches[quorum - 1]
    }

    /// Returns the most recent time at which a quorum of active members
    /// (leader included, at `now`) had acknowledged the leader.
    pub fn quorum_ack_time(&self, now: Timestamp, cluster: &ClusterState) -> Timestamp {
        let mut times = cluster.active_ack_times();
        times.push(now);
        times.sort_unstable_by(|a, b| b.cmp(a));

        let quorum = cluster.quorum_size();
        if quorum == 0 || quorum > times.len() {
            return 0;
        }
        times[quorum - 1]
    }

    /// Returns the lowest index replicated on every log-holding member,
    /// bounding compaction of fully-replicated prefixes.
    ///
    /// A member that has been unavailable past the global suspend
    /// timeout no longer holds compaction back; once it heals, its stale
    /// log is replaced through a snapshot transfer.
    pub fn global_index(
        &self,
        cluster: &ClusterState,
        leader_last: LogIndex,
        now: Timestamp,
    ) -> LogIndex {
        cluster
            .remote_members()
            .filter(|m| m.member.member_type != MemberType::Reserve)
            .filter(|m| {
                m.member.status != cohort_protocol::member::MemberStatus::Unavailable
                    || now.saturating_sub(m.last_ack) <= self.global_suspend_timeout
            })
            .map(|m| m.match_index)
            .chain(std::iter::once(leader_last))
            .min()
            .unwrap_or(leader_last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use cohort_protocol::entry::Entry;
    use cohort_protocol::member::{Configuration, Member};
    use cohort_storage::StorageConfig;
    use std::sync::Arc;

    fn member(id: MemberId, member_type: MemberType) -> Member {
        Member::new(
            id,
            member_type,
            format!("127.0.0.1:{}", 5000 + id).parse().unwrap(),
            format!("127.0.0.1:{}", 6000 + id).parse().unwrap(),
        )
    }

    fn cluster(members: Vec<Member>) -> ClusterState {
        ClusterState::new(
            1,
            Configuration {
                index: 0,
                term: 1,
                timestamp: 0,
                members,
            },
        )
    }

    fn log_with_entries(n: u64, term: Term) -> Arc<Log> {
        let log = Log::open(StorageConfig::memory("test")).unwrap();
        let mut writer = log.writer();
        for i in 1..=n {
            writer
                .append(
                    term,
                    Entry::Command {
                        timestamp: i,
                        session: 1,
                        sequence: i,
                        payload: Bytes::from(format!("cmd{i}")),
                    },
                )
                .unwrap();
        }
        log
    }

    fn appender() -> LeaderAppender {
        LeaderAppender::new(1, &ServerConfig::default())
    }

    #[test]
    fn test_append_cycle_sends_entries() {
        let mut cluster = cluster(vec![
            member(1, MemberType::Active),
            member(2, MemberType::Active),
            member(3, MemberType::Active),
        ]);
        let log = log_with_entries(5, 1);
        let snapshots = SnapshotStore::open(StorageConfig::memory("test")).unwrap();

        // Followers start optimistic; force them behind.
        cluster.member_state_mut(2).unwrap().next_index = 1;
        cluster.member_state_mut(3).unwrap().next_index = 4;

        let out = appender().append_cycle(1000, 1, &mut cluster, &log, &snapshots);
        assert_eq!(out.len(), 2);

        for outbound in &out {
            let RaftMessage::Append(request) = &outbound.message else {
                panic!("expected Append");
            };
            assert_eq!(request.term, 1);
            assert_eq!(request.leader, 1);
            match outbound.to {
                2 => {
                    assert_eq!(request.log_index, 0);
                    assert_eq!(request.entries.len(), 5);
                }
                3 => {
                    assert_eq!(request.log_index, 3);
                    assert_eq!(request.log_term, 1);
                    assert_eq!(request.entries.len(), 2);
                }
                other => panic!("unexpected target {other}"),
            }
        }

        // Members are now in flight; an immediate second cycle sends
        // nothing.
        let out = appender().append_cycle(1001, 1, &mut cluster, &log, &snapshots);
        assert!(out.is_empty());
    }

    #[test]
    fn test_heartbeat_when_caught_up() {
        let mut cluster = cluster(vec![member(1, MemberType::Active), member(2, MemberType::Active)]);
        let log = log_with_entries(3, 1);
        let snapshots = SnapshotStore::open(StorageConfig::memory("test")).unwrap();
        cluster.reset_replication(3);

        // Nothing due immediately after a send.
        cluster.member_state_mut(2).unwrap().last_attempt = 1000;
        let out = appender().append_cycle(1100, 1, &mut cluster, &log, &snapshots);
        assert!(out.is_empty());

        // The heartbeat interval elapses.
        let out = appender().append_cycle(1300, 1, &mut cluster, &log, &snapshots);
        assert_eq!(out.len(), 1);
        let RaftMessage::Append(request) = &out[0].message else {
            panic!("expected Append");
        };
        assert!(request.entries.is_empty());
    }

    #[test]
    fn test_reserve_members_not_appended() {
        let mut cluster = cluster(vec![member(1, MemberType::Active), member(2, MemberType::Reserve)]);
        let log = log_with_entries(3, 1);
        let snapshots = SnapshotStore::open(StorageConfig::memory("test")).unwrap();

        let out = appender().append_cycle(1000, 1, &mut cluster, &log, &snapshots);
        assert!(out.is_empty());
    }

    #[test]
    fn test_commit_advances_on_quorum() {
        let mut cluster = cluster(vec![
            member(1, MemberType::Active),
            member(2, MemberType::Active),
            member(3, MemberType::Active),
        ]);
        let log = log_with_entries(5, 1);
        let appender = appender();

        // One follower at index 3: quorum of 3 = {leader@5, m2@3, m3@0},
        // median = 3.
        let commit = appender.handle_append_reply(
            2,
            &AppendResponse {
                status: Status::Ok,
                term: 1,
                succeeded: true,
                log_index: 3,
            },
            1000,
            1,
            &mut cluster,
            &log,
        );
        assert_eq!(commit, Some(3));
        log.commit(3).unwrap();

        let commit = appender.handle_append_reply(
            3,
            &AppendResponse {
                status: Status::Ok,
                term: 1,
                succeeded: true,
                log_index: 5,
            },
            1001,
            1,
            &mut cluster,
            &log,
        );
        assert_eq!(commit, Some(5));
    }

    #[test]
    fn test_no_commit_for_previous_term_entries() {
        let mut cluster = cluster(vec![
            member(1, MemberType::Active),
            member(2, MemberType::Active),
            member(3, MemberType::Active),
        ]);
        // All entries are from term 1, but the leader is now in term 2.
        let log = log_with_entries(3, 1);

        let commit = appender().handle_append_reply(
            2,
            &AppendResponse {
                status: Status::Ok,
                term: 2,
                succeeded: true,
                log_index: 3,
            },
            1000,
            2,
            &mut cluster,
            &log,
        );
        assert_eq!(commit, None);
    }

    #[test]
    fn test_failure_hint_rolls_back_next_index() {
        let mut cluster = cluster(vec![member(1, MemberType::Active), member(2, MemberType::Active)]);
        let log = log_with_entries(10, 1);
        cluster.reset_replication(10);

        appender().handle_append_reply(
            2,
            &AppendResponse {
                status: Status::Ok,
                term: 1,
                succeeded: false,
                log_index: 4,
            },
            1000,
            1,
            &mut cluster,
            &log,
        );

        let member = cluster.member_state(2).unwrap();
        assert_eq!(member.next_index, 5);
        assert_eq!(member.failures, 1);
    }

    #[test]
    fn test_repeated_failures_mark_unavailable() {
        let mut cluster = cluster(vec![member(1, MemberType::Active), member(2, MemberType::Active)]);
        let log = log_with_entries(3, 1);
        let appender = appender();

        for _ in 0..MAX_APPEND_FAILURES {
            appender.handle_append_reply(
                2,
                &AppendResponse {
                    status: Status::Ok,
                    term: 1,
                    succeeded: false,
                    log_index: 0,
                },
                10_000,
                1,
                &mut cluster,
                &log,
            );
        }

        assert_eq!(
            cluster.member_state(2).unwrap().member.status,
            cohort_protocol::member::MemberStatus::Unavailable
        );

        // A success restores availability.
        appender.handle_append_reply(
            2,
            &AppendResponse {
                status: Status::Ok,
                term: 1,
                succeeded: true,
                log_index: 3,
            },
            10_001,
            1,
            &mut cluster,
            &log,
        );
        assert_eq!(
            cluster.member_state(2).unwrap().member.status,
            cohort_protocol::member::MemberStatus::Available
        );
    }

    #[test]
    fn test_quorum_ack_time() {
        let mut cluster = cluster(vec![
            member(1, MemberType::Active),
            member(2, MemberType::Active),
            member(3, MemberType::Active),
        ]);
        let appender = appender();

        cluster.member_state_mut(2).unwrap().last_ack = 500;
        cluster.member_state_mut(3).unwrap().last_ack = 100;

        // Quorum of 3: leader@1000, m2@500, m3@100 -> median 500.
        assert_eq!(appender.quorum_ack_time(1000, &cluster), 500);
    }

    #[test]
    fn test_global_index_is_minimum() {
        let mut cluster = cluster(vec![
            member(1, MemberType::Active),
            member(2, MemberType::Active),
            member(3, MemberType::Passive),
        ]);
        cluster.member_state_mut(2).unwrap().match_index = 8;
        cluster.member_state_mut(3).unwrap().match_index = 2;

        assert_eq!(appender().global_index(&cluster, 10, 1000), 2);

        // A member suspended past the global timeout stops bounding
        // compaction.
        cluster.member_state_mut(3).unwrap().last_ack = 0;
        cluster.mark_unavailable(3);
        let hour = 60 * 60 * 1000;
        assert_eq!(appender().global_index(&cluster, 10, hour + 1), 8);
    }

    #[test]
    fn test_snapshot_transfer_cycle() {
        let mut cluster = cluster(vec![member(1, MemberType::Active), member(2, MemberType::Active)]);
        let log = log_with_entries(10, 1);
        log.commit(10).unwrap();
        log.compact(8).unwrap();

        let snapshots = SnapshotStore::open(StorageConfig::memory("test")).unwrap();
        let mut pending = snapshots.create_temporary(STATE_MACHINE_ID, 7);
        pending.writer().write_bytes(b"machine state");
        snapshots.complete(pending).unwrap();

        // The follower is behind the compacted prefix.
        cluster.member_state_mut(2).unwrap().next_index = 3;

        let appender = appender();
        let out = appender.append_cycle(1000, 1, &mut cluster, &log, &snapshots);
        assert_eq!(out.len(), 1);
        let RaftMessage::Install(request) = &out[0].message else {
            panic!("expected Install, got {:?}", out[0].message);
        };
        assert_eq!(request.index, 7);
        assert_eq!(request.offset, 0);
        assert!(request.complete);

        appender.handle_install_reply(
            2,
            &InstallResponse {
                status: Status::Ok,
                term: 1,
            },
            1001,
            &mut cluster,
            &snapshots,
        );

        let member = cluster.member_state(2).unwrap();
        assert!(member.installing.is_none());
        assert_eq!(member.match_index, 7);
        assert_eq!(member.next_index, 8);
    }
}
