//! Distribution policies and the modulo partition they share

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cluster::Member;
use crate::push::PushUser;

/// How a recomputed assignment is applied across the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReschedulePolicy {
    /// The first ranked capable member stops listeners cluster-wide and
    /// hands every member its share
    #[default]
    #[serde(alias = "master")]
    Master,
    /// Every member independently claims its own share
    #[serde(alias = "per_node")]
    PerNode,
}

impl ReschedulePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "MASTER",
            Self::PerNode => "PER_NODE",
        }
    }
}

impl fmt::Display for ReschedulePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sort members into the rank every node agrees on
pub fn rank_members(members: &mut [Member]) {
    members.sort_by(|a, b| a.cmp_rank(b));
}

/// Users at indices `i` with `i % member_count == position`.
///
/// `users` must be in the same order on every member (sorted).
pub fn partition(users: &[PushUser], member_count: usize, position: usize) -> Vec<PushUser> {
    if member_count == 0 {
        return Vec::new();
    }
    users
        .iter()
        .enumerate()
        .filter(|(i, _)| i % member_count == position)
        .map(|(_, u)| u.clone())
        .collect()
}

/// All shares, indexed by member position
pub fn partition_all(users: &[PushUser], member_count: usize) -> Vec<Vec<PushUser>> {
    (0..member_count)
        .map(|position| partition(users, member_count, position))
        .collect()
}
