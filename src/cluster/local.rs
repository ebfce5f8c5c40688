//! In-process cluster.
//!
//! Members joined to the same [`InProcessNetwork`] see each other and call
//! each other's request handlers directly. A network with a single member is
//! how a standalone node runs; networks with several members drive the
//! multi-node test suites, where [`MemberFault`] simulates unreachable or
//! departed members.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::metrics::ClusterMetrics;

use super::traits::{ClusterRequestHandler, ClusterService};
use super::types::{
    ClusterBackend, ClusterRequest, ClusterResponse, Member, MembershipEvent, RemoteCallError,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Simulated failure of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberFault {
    /// Requests to the member never complete
    Unresponsive,
    /// Requests fail as if the member had just left, while it still shows
    /// up in membership snapshots
    Departed,
}

/// A request observed on the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub to: Uuid,
    pub kind: &'static str,
}

struct Node {
    member: Member,
    events: broadcast::Sender<MembershipEvent>,
    handler: OnceLock<Weak<dyn ClusterRequestHandler>>,
}

/// Shared in-memory network of cluster members
#[derive(Default)]
pub struct InProcessNetwork {
    nodes: DashMap<Uuid, Arc<Node>>,
    faults: DashMap<Uuid, MemberFault>,
    /// sender id -> requests sent
    calls: DashMap<Uuid, Vec<CallRecord>>,
}

impl InProcessNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a member and announce it to the existing ones
    pub fn join(
        self: &Arc<Self>,
        name: impl Into<String>,
        address: Option<SocketAddr>,
    ) -> Arc<InProcessCluster> {
        let member = Member::new(name, address);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let node = Arc::new(Node {
            member: member.clone(),
            events,
            handler: OnceLock::new(),
        });

        self.announce(MembershipEvent::Added(member.clone()), member.id);
        self.nodes.insert(member.id, Arc::clone(&node));
        ClusterMetrics::record_member_added();

        tracing::debug!(member = %member, "Member joined in-process network");

        Arc::new(InProcessCluster {
            network: Arc::clone(self),
            node,
        })
    }

    /// Remove a member and announce its departure to the remaining ones
    pub fn remove(&self, member_id: Uuid) -> bool {
        let Some((_, node)) = self.nodes.remove(&member_id) else {
            return false;
        };
        self.faults.remove(&member_id);
        ClusterMetrics::record_member_removed();
        self.announce(MembershipEvent::Removed(node.member.clone()), member_id);
        tracing::debug!(member = %node.member, "Member left in-process network");
        true
    }

    pub fn set_fault(&self, member_id: Uuid, fault: MemberFault) {
        self.faults.insert(member_id, fault);
    }

    pub fn clear_fault(&self, member_id: Uuid) {
        self.faults.remove(&member_id);
    }

    /// Members sorted by rank
    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<_> = self.nodes.iter().map(|n| n.member.clone()).collect();
        members.sort_by(|a, b| a.cmp_rank(b));
        members
    }

    /// Requests sent by a member, in order
    pub fn calls_from(&self, member_id: Uuid) -> Vec<CallRecord> {
        self.calls
            .get(&member_id)
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn clear_calls(&self) {
        self.calls.clear();
    }

    fn announce(&self, event: MembershipEvent, except: Uuid) {
        for node in self.nodes.iter() {
            if *node.key() != except {
                let _ = node.events.send(event.clone());
            }
        }
    }
}

/// One member's view of an [`InProcessNetwork`]
pub struct InProcessCluster {
    network: Arc<InProcessNetwork>,
    node: Arc<Node>,
}

impl InProcessCluster {
    /// A single-member cluster for running without any peers
    pub fn standalone(name: impl Into<String>, address: Option<SocketAddr>) -> Arc<Self> {
        InProcessNetwork::new().join(name, address)
    }

    pub fn network(&self) -> &Arc<InProcessNetwork> {
        &self.network
    }
}

#[async_trait]
impl ClusterService for InProcessCluster {
    fn local_member(&self) -> Member {
        self.node.member.clone()
    }

    fn members(&self) -> Vec<Member> {
        self.network.members()
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.node.events.subscribe()
    }

    fn set_request_handler(&self, handler: Weak<dyn ClusterRequestHandler>) {
        if self.node.handler.set(handler).is_err() {
            tracing::warn!(member = %self.node.member, "Request handler already set");
        }
    }

    async fn invoke(
        &self,
        target: &Member,
        request: ClusterRequest,
    ) -> Result<ClusterResponse, RemoteCallError> {
        self.network
            .calls
            .entry(self.node.member.id)
            .or_default()
            .push(CallRecord {
                to: target.id,
                kind: request.kind(),
            });

        let fault = self.network.faults.get(&target.id).map(|f| *f);
        match fault {
            Some(MemberFault::Departed) => return Err(RemoteCallError::MemberLeft),
            Some(MemberFault::Unresponsive) => {
                std::future::pending::<()>().await;
            }
            None => {}
        }

        let node = self
            .network
            .nodes
            .get(&target.id)
            .map(|n| Arc::clone(n.value()))
            .ok_or(RemoteCallError::MemberLeft)?;

        let handler = node
            .handler
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| RemoteCallError::Transport(format!("{} has no request handler", target)))?;

        // Runs detached like a request served by a remote process: a caller
        // that times out must not cancel the handler halfway.
        let from = self.node.member.clone();
        tokio::spawn(async move { handler.handle_request(&from, request).await })
            .await
            .map_err(|e| RemoteCallError::Transport(format!("request handler failed: {}", e)))?
            .map_err(RemoteCallError::Handler)
    }

    fn backend_type(&self) -> ClusterBackend {
        ClusterBackend::InProcess
    }

    async fn leave(&self) {
        self.network.remove(self.node.member.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::types::ProbeReport;

    struct EchoHandler;

    #[async_trait]
    impl ClusterRequestHandler for EchoHandler {
        async fn handle_request(
            &self,
            _from: &Member,
            request: ClusterRequest,
        ) -> Result<ClusterResponse, String> {
            match request {
                ClusterRequest::Probe => Ok(ClusterResponse::Probe(ProbeReport {
                    has_capable_backend: true,
                    all_users_started: false,
                })),
                _ => Err("unsupported".to_string()),
            }
        }
    }

    #[tokio::test]
    async fn test_membership_events() {
        let network = InProcessNetwork::new();
        let a = network.join("a", None);
        let mut events = a.subscribe();

        let b = network.join("b", None);
        match events.recv().await.unwrap() {
            MembershipEvent::Added(m) => assert_eq!(m, b.local_member()),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(a.members().len(), 2);

        b.leave().await;
        assert!(matches!(events.recv().await.unwrap(), MembershipEvent::Removed(_)));
        assert_eq!(a.members(), vec![a.local_member()]);
    }

    #[tokio::test]
    async fn test_invoke_reaches_handler_and_records_call() {
        let network = InProcessNetwork::new();
        let a = network.join("a", None);
        let b = network.join("b", None);
        let handler: Arc<dyn ClusterRequestHandler> = Arc::new(EchoHandler);
        b.set_request_handler(Arc::downgrade(&handler));

        let response = a.invoke(&b.local_member(), ClusterRequest::Probe).await.unwrap();
        assert!(matches!(response, ClusterResponse::Probe(_)));

        let err = a
            .invoke(&b.local_member(), ClusterRequest::StopAllPermanentListeners)
            .await
            .unwrap_err();
        assert_eq!(err, RemoteCallError::Handler("unsupported".to_string()));

        let calls = network.calls_from(a.local_member().id);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].kind, "probe");
    }

    struct SlowHandler {
        completed: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ClusterRequestHandler for SlowHandler {
        async fn handle_request(
            &self,
            _from: &Member,
            _request: ClusterRequest,
        ) -> Result<ClusterResponse, String> {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            self.completed
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(ClusterResponse::Stopped { count: 0 })
        }
    }

    #[tokio::test]
    async fn test_caller_timeout_does_not_cancel_handler() {
        let network = InProcessNetwork::new();
        let a = network.join("a", None);
        let b = network.join("b", None);
        let slow = Arc::new(SlowHandler {
            completed: std::sync::atomic::AtomicUsize::new(0),
        });
        let handler: Arc<dyn ClusterRequestHandler> = slow.clone();
        b.set_request_handler(Arc::downgrade(&handler));

        let result = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            a.invoke(&b.local_member(), ClusterRequest::StopAllPermanentListeners),
        )
        .await;
        assert!(result.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(slow.completed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_departed_member_fails_fast() {
        let network = InProcessNetwork::new();
        let a = network.join("a", None);
        let b = network.join("b", None);
        network.set_fault(b.local_member().id, MemberFault::Departed);

        let err = a.invoke(&b.local_member(), ClusterRequest::Probe).await.unwrap_err();
        assert_eq!(err, RemoteCallError::MemberLeft);
    }
}
