//! Cluster membership and request transport
//!
//! The rescheduler only talks to [`ClusterService`]. Two transports exist:
//! an in-process network (a standalone node, or several nodes inside one
//! test) and a Redis-backed cluster for multi-instance deployments.

mod factory;
mod local;
mod redis_cluster;
mod traits;
mod types;

pub use factory::create_cluster;
pub use local::{CallRecord, InProcessCluster, InProcessNetwork, MemberFault};
pub use redis_cluster::RedisCluster;
pub use traits::{ClusterRequestHandler, ClusterService};
pub use types::{
    ClusterBackend, ClusterRequest, ClusterResponse, Member, MembershipEvent, ProbeReport,
    RemoteCallError,
};
