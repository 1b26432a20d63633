//! Cluster membership types.
//!
//! A cluster is described by a [`Configuration`]: the set of members, each
//! with a type that determines how it participates in replication, and the
//! log position at which the configuration was written. Configurations are
//! themselves log entries and take effect when observed in the log, not
//! when committed.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use cohort_common::{LogIndex, MemberId, Term, Timestamp};

/// How a member participates in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemberType {
    /// Stateless standby; receives configuration updates only.
    Reserve,
    /// Asynchronous replica; receives committed entries but does not vote.
    Passive,
    /// Full voting member.
    Active,
}

/// Whether a member is currently reachable, as judged by the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    /// The member is responding to requests.
    Available,
    /// The member has failed several consecutive append rounds.
    Unavailable,
}

/// A single cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// The member's unique id.
    pub id: MemberId,
    /// The member's participation type.
    pub member_type: MemberType,
    /// The member's availability, as last judged by the leader.
    pub status: MemberStatus,
    /// Address for server-to-server traffic.
    pub server_address: SocketAddr,
    /// Address clients connect to.
    pub client_address: SocketAddr,
    /// When the member record was last updated.
    pub updated: Timestamp,
}

impl Member {
    /// Creates a new available member of the given type.
    pub fn new(
        id: MemberId,
        member_type: MemberType,
        server_address: SocketAddr,
        client_address: SocketAddr,
    ) -> Self {
        Self {
            id,
            member_type,
            status: MemberStatus::Available,
            server_address,
            client_address,
            updated: 0,
        }
    }

    /// Returns true if the member votes in elections and commit quorums.
    pub fn is_active(&self) -> bool {
        self.member_type == MemberType::Active
    }

    /// Returns a copy of this member with a different type.
    pub fn with_type(mut self, member_type: MemberType) -> Self {
        self.member_type = member_type;
        self
    }
}

/// A cluster configuration: the member set active at a given log index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// The index of the configuration entry, or 0 for a seed configuration
    /// that has not yet been logged.
    pub index: LogIndex,
    /// The term of the configuration entry.
    pub term: Term,
    /// When the configuration was created.
    pub timestamp: Timestamp,
    /// The member set.
    pub members: Vec<Member>,
}

impl Configuration {
    /// Creates a seed configuration that has not yet been logged.
    pub fn seed(members: Vec<Member>) -> Self {
        Self {
            index: 0,
            term: 0,
            timestamp: 0,
            members,
        }
    }

    /// Returns the member with the given id.
    pub fn member(&self, id: MemberId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    /// Returns all voting members.
    pub fn active_members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.is_active())
    }

    /// Returns all members of the given type.
    pub fn members_of(&self, member_type: MemberType) -> impl Iterator<Item = &Member> + '_ {
        self.members
            .iter()
            .filter(move |m| m.member_type == member_type)
    }

    /// Returns the number of votes required for a quorum of the active
    /// members.
    pub fn quorum_size(&self) -> usize {
        self.active_members().count() / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: MemberId, member_type: MemberType) -> Member {
        let addr: SocketAddr = format!("127.0.0.1:{}", 5000 + id).parse().unwrap();
        let client: SocketAddr = format!("127.0.0.1:{}", 6000 + id).parse().unwrap();
        Member::new(id, member_type, addr, client)
    }

    #[test]
    fn test_quorum_size_counts_active_only() {
        let config = Configuration::seed(vec![
            member(1, MemberType::Active),
            member(2, MemberType::Active),
            member(3, MemberType::Active),
            member(4, MemberType::Passive),
            member(5, MemberType::Reserve),
        ]);

        assert_eq!(config.active_members().count(), 3);
        assert_eq!(config.quorum_size(), 2);
    }

    #[test]
    fn test_quorum_size_single_member() {
        let config = Configuration::seed(vec![member(1, MemberType::Active)]);
        assert_eq!(config.quorum_size(), 1);
    }

    #[test]
    fn test_member_lookup() {
        let config = Configuration::seed(vec![
            member(1, MemberType::Active),
            member(2, MemberType::Passive),
        ]);

        assert!(config.member(1).unwrap().is_active());
        assert!(!config.member(2).unwrap().is_active());
        assert!(config.member(9).is_none());
    }

    #[test]
    fn test_members_of() {
        let config = Configuration::seed(vec![
            member(1, MemberType::Active),
            member(2, MemberType::Reserve),
            member(3, MemberType::Reserve),
        ]);

        assert_eq!(config.members_of(MemberType::Reserve).count(), 2);
        assert_eq!(config.members_of(MemberType::Passive).count(), 0);
    }
}
