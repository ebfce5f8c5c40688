//! Cluster service trait definitions

use std::sync::Weak;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::types::{ClusterBackend, ClusterRequest, ClusterResponse, Member, MembershipEvent, RemoteCallError};

/// Membership view and request/reply transport between members
#[async_trait]
pub trait ClusterService: Send + Sync {
    fn local_member(&self) -> Member;

    /// Current membership snapshot, including the local member
    fn members(&self) -> Vec<Member>;

    /// Subscribe to membership changes
    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;

    /// Install the handler for requests arriving from other members
    fn set_request_handler(&self, handler: Weak<dyn ClusterRequestHandler>);

    /// Send one request to one member and wait for its reply.
    ///
    /// Implementations do not time out on their own; callers bound the call
    /// and drop the future to cancel it.
    async fn invoke(
        &self,
        target: &Member,
        request: ClusterRequest,
    ) -> Result<ClusterResponse, RemoteCallError>;

    fn backend_type(&self) -> ClusterBackend;

    /// Leave the cluster
    async fn leave(&self);
}

/// Handler of requests sent by other members
#[async_trait]
pub trait ClusterRequestHandler: Send + Sync {
    async fn handle_request(
        &self,
        from: &Member,
        request: ClusterRequest,
    ) -> Result<ClusterResponse, String>;
}
