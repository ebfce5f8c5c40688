//! Cluster-related types

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::push::PushUser;

/// A cluster node.
///
/// Identity is the uuid. The address (or the name when no address is known)
/// only serves as a deterministic sort key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: Uuid,
    #[serde(default)]
    pub address: Option<SocketAddr>,
    pub name: String,
}

impl Member {
    pub fn new(name: impl Into<String>, address: Option<SocketAddr>) -> Self {
        Self {
            id: Uuid::new_v4(),
            address,
            name: name.into(),
        }
    }

    /// `ip:port` if the member has an address, its name otherwise
    pub fn sort_key(&self) -> String {
        match self.address {
            Some(addr) => addr.to_string(),
            None => self.name.clone(),
        }
    }

    /// Total order used wherever members must be ranked identically on
    /// every node
    pub fn cmp_rank(&self, other: &Self) -> Ordering {
        self.sort_key()
            .cmp(&other.sort_key())
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Member {}

impl Hash for Member {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(addr) => write!(f, "{} ({})", self.name, addr),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Change of cluster membership
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    Added(Member),
    Removed(Member),
}

impl MembershipEvent {
    pub fn member(&self) -> &Member {
        match self {
            Self::Added(m) | Self::Removed(m) => m,
        }
    }
}

/// Requests exchanged between schedulers on different members
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterRequest {
    /// Ask for the member's capability and start-up state
    Probe,
    /// Stop every permanent listener running on the member
    StopAllPermanentListeners,
    /// Take over this share of push users
    StartPermanentListeners { users: Vec<PushUser> },
    /// These users are owned elsewhere now; stop them if running
    DropPermanentListeners { users: Vec<PushUser> },
    /// Plan a local reschedule
    PlanReschedule { reason: String },
}

impl ClusterRequest {
    /// Short name for logs and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Probe => "probe",
            Self::StopAllPermanentListeners => "stop_all",
            Self::StartPermanentListeners { .. } => "start",
            Self::DropPermanentListeners { .. } => "drop",
            Self::PlanReschedule { .. } => "plan",
        }
    }
}

/// Answer of a member to a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    /// The member runs an extended backend whose listeners need resources
    pub has_capable_backend: bool,
    /// The member has completed a full, authoritative start-up
    pub all_users_started: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterResponse {
    Probe(ProbeReport),
    Stopped { count: usize },
    Started { count: usize },
    Dropped { count: usize },
    Accepted,
}

/// Failure of a single remote call
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RemoteCallError {
    /// The target is no longer a cluster member
    #[error("Member left the cluster")]
    MemberLeft,

    #[error("Remote call timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    /// The target received the request but failed to handle it
    #[error("Remote handler failed: {0}")]
    Handler(String),
}

/// Cluster transport in use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterBackend {
    /// In-process network (standalone node or tests)
    InProcess,
    /// Redis heartbeats and Pub/Sub
    Redis,
}

impl ClusterBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProcess => "in_process",
            Self::Redis => "redis",
        }
    }
}
