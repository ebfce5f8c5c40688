//! Multi-node rescheduling tests
//!
//! Several members share one in-process network and one registration store,
//! the way real nodes share the cluster transport and the database. No Redis
//! or server startup is needed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use ara_permanent_push::cluster::{ClusterService, InProcessCluster, InProcessNetwork, MemberFault};
use ara_permanent_push::config::{PushConfig, RescheduleConfig, Settings};
use ara_permanent_push::push::store::MemoryRegistrationStore;
use ara_permanent_push::push::{
    LocalJobQueue, MemoryBackendOptions, MemoryPushBackend, PushManagerRegistry, PushUser,
    RegistrationStore,
};
use ara_permanent_push::reschedule::{
    DistributionOutcome, PermanentListenerRescheduler, ReschedulePlan, ReschedulePolicy,
    ReschedulerState,
};
use ara_permanent_push::shutdown::ShutdownSignal;
use ara_permanent_push::tasks::RescheduleEventListener;

struct TestNode {
    rescheduler: Arc<PermanentListenerRescheduler>,
    backend: Arc<MemoryPushBackend>,
    cluster: Arc<InProcessCluster>,
    signal: ShutdownSignal,
    _reload_tx: broadcast::Sender<Arc<Settings>>,
}

impl TestNode {
    fn id(&self) -> uuid::Uuid {
        self.cluster.local_member().id
    }

    fn active(&self) -> Vec<i32> {
        self.backend.active_users().iter().map(|u| u.user_id).collect()
    }

    async fn run(&self, remote: bool) -> DistributionOutcome {
        self.rescheduler
            .run_distribution(ReschedulePlan::new(remote))
            .await
            .unwrap()
    }

    /// Run the membership/reload event listener in the background
    fn listen(&self) {
        let listener = RescheduleEventListener::new(
            Arc::clone(&self.rescheduler),
            self._reload_tx.subscribe(),
            self.signal.subscribe(),
        );
        tokio::spawn(listener.run());
    }
}

fn reschedule_config(policy: ReschedulePolicy) -> RescheduleConfig {
    RescheduleConfig {
        policy,
        delay_ms: 30,
        frequency_ms: 10,
        remote_timeout_ms: 100,
        remote_attempts: 2,
        handoff_park_ms: 0,
        apply_park_ms: 0,
        ..Default::default()
    }
}

async fn shared_store(users: i32) -> Arc<MemoryRegistrationStore> {
    let store = Arc::new(MemoryRegistrationStore::new());
    for i in 0..users {
        store.insert(&PushUser::new(i, 1), "web").await.unwrap();
    }
    store
}

async fn node_with_options(
    network: &Arc<InProcessNetwork>,
    index: u8,
    store: Arc<MemoryRegistrationStore>,
    policy: ReschedulePolicy,
    options: MemoryBackendOptions,
) -> TestNode {
    let signal = ShutdownSignal::new();
    let registry = Arc::new(PushManagerRegistry::new(
        PushConfig::default(),
        Arc::new(LocalJobQueue::new()),
        store,
        signal.clone(),
    ));
    let backend = MemoryPushBackend::with_options(format!("memory-{index}"), options);
    registry.add_backend(backend.descriptor()).await;

    let address = format!("10.0.0.{index}:8085").parse().unwrap();
    let cluster = network.join(format!("node-{index}"), Some(address));
    let rescheduler = PermanentListenerRescheduler::new(
        registry,
        cluster.clone(),
        reschedule_config(policy),
        signal.clone(),
    );
    let (reload_tx, _) = broadcast::channel(4);

    TestNode {
        rescheduler,
        backend,
        cluster,
        signal,
        _reload_tx: reload_tx,
    }
}

async fn node(
    network: &Arc<InProcessNetwork>,
    index: u8,
    store: Arc<MemoryRegistrationStore>,
    policy: ReschedulePolicy,
) -> TestNode {
    node_with_options(network, index, store, policy, MemoryBackendOptions::default()).await
}

async fn cluster_of(
    count: u8,
    users: i32,
    policy: ReschedulePolicy,
) -> (Arc<InProcessNetwork>, Vec<TestNode>) {
    let network = InProcessNetwork::new();
    let store = shared_store(users).await;
    let mut nodes = Vec::new();
    for index in 1..=count {
        nodes.push(node(&network, index, store.clone(), policy).await);
    }
    (network, nodes)
}

/// Every user runs on exactly one node
fn assert_exclusive_cover(nodes: &[TestNode], users: i32) {
    let mut seen = HashSet::new();
    for node in nodes {
        for user in node.active() {
            assert!(seen.insert(user), "user {user} runs on more than one node");
        }
    }
    assert_eq!(seen.len(), users as usize);
}

fn kinds_sent(network: &InProcessNetwork, node: &TestNode) -> Vec<&'static str> {
    network.calls_from(node.id()).iter().map(|c| c.kind).collect()
}

// =============================================================================
// PER_NODE
// =============================================================================

mod per_node {
    use super::*;

    #[tokio::test]
    async fn test_three_members_partition_by_rank() {
        let (_network, nodes) = cluster_of(3, 9, ReschedulePolicy::PerNode).await;

        for node in &nodes {
            let outcome = node.run(false).await;
            assert!(matches!(
                outcome,
                DistributionOutcome::Distributed { members: 3, local_share: 3, .. }
            ));
        }

        assert_eq!(nodes[0].active(), vec![0, 3, 6]);
        assert_eq!(nodes[1].active(), vec![1, 4, 7]);
        assert_eq!(nodes[2].active(), vec![2, 5, 8]);
        assert_exclusive_cover(&nodes, 9);
    }

    #[tokio::test]
    async fn test_member_departed_mid_probe_is_excluded() {
        let (network, nodes) = cluster_of(3, 9, ReschedulePolicy::PerNode).await;
        network.set_fault(nodes[2].id(), MemberFault::Departed);

        let outcome = nodes[0].run(false).await;
        assert!(matches!(
            outcome,
            DistributionOutcome::Distributed { members: 2, local_share: 5, .. }
        ));
        assert_eq!(nodes[0].active(), vec![0, 2, 4, 6, 8]);

        // The departed member was asked exactly once
        let probes_to_departed = network
            .calls_from(nodes[0].id())
            .iter()
            .filter(|c| c.to == nodes[2].id())
            .count();
        assert_eq!(probes_to_departed, 1);
    }

    #[tokio::test]
    async fn test_remote_plan_makes_peers_recompute() {
        let (network, nodes) = cluster_of(3, 9, ReschedulePolicy::PerNode).await;

        nodes[0].run(true).await;
        let plans = kinds_sent(&network, &nodes[0])
            .into_iter()
            .filter(|k| *k == "plan")
            .count();
        assert_eq!(plans, 2);

        // Peers run their own plans once the quiet period has passed
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_exclusive_cover(&nodes, 9);
        assert_eq!(nodes[1].active(), vec![1, 4, 7]);
        for node in &nodes {
            assert_eq!(node.rescheduler.state().await, ReschedulerState::Idle);
        }
    }

    #[tokio::test]
    async fn test_join_rebalances_through_membership_events() {
        let network = InProcessNetwork::new();
        let store = shared_store(6).await;

        let first = node(&network, 1, store.clone(), ReschedulePolicy::PerNode).await;
        first.listen();
        first.rescheduler.plan_reschedule(false, "startup").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(first.active(), vec![0, 1, 2, 3, 4, 5]);

        let second = node(&network, 2, store, ReschedulePolicy::PerNode).await;
        second.listen();
        second.rescheduler.plan_reschedule(false, "startup").await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(first.active(), vec![0, 2, 4]);
        assert_eq!(second.active(), vec![1, 3, 5]);

        // Leaving hands everything back to the remaining member
        second.cluster.leave().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(first.active(), vec![0, 1, 2, 3, 4, 5]);
    }
}

// =============================================================================
// MASTER
// =============================================================================

mod master {
    use super::*;

    #[tokio::test]
    async fn test_non_master_only_probes() {
        let (network, nodes) = cluster_of(3, 9, ReschedulePolicy::Master).await;

        let outcome = nodes[1].run(false).await;
        match outcome {
            DistributionOutcome::NotMaster { master } => assert_eq!(master.id, nodes[0].id()),
            other => panic!("unexpected outcome {:?}", other),
        }

        let sent = kinds_sent(&network, &nodes[1]);
        assert_eq!(sent, vec!["probe", "probe"]);
        assert!(nodes[1].active().is_empty());
    }

    #[tokio::test]
    async fn test_master_hands_out_shares() {
        let (network, nodes) = cluster_of(3, 9, ReschedulePolicy::Master).await;

        // Stale listeners on a non-master are replaced by the handoff
        nodes[2]
            .rescheduler
            .registry()
            .apply_initial_listeners(vec![PushUser::new(0, 1)], false, Duration::ZERO)
            .await;

        let outcome = nodes[0].run(false).await;
        assert!(matches!(
            outcome,
            DistributionOutcome::Distributed { members: 3, local_share: 3, .. }
        ));

        let sent = kinds_sent(&network, &nodes[0]);
        assert_eq!(sent.iter().filter(|k| **k == "stop_all").count(), 2);
        assert_eq!(sent.iter().filter(|k| **k == "start").count(), 2);

        assert_eq!(nodes[0].active(), vec![0, 3, 6]);
        assert_eq!(nodes[1].active(), vec![1, 4, 7]);
        assert_eq!(nodes[2].active(), vec![2, 5, 8]);
        assert_eq!(
            nodes[1].rescheduler.registry().tracked_push_users().await.len(),
            3
        );
        assert!(!nodes[1].rescheduler.registry().all_users_started().await);

        // Drop notices from the receivers change nothing
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_exclusive_cover(&nodes, 9);
    }

    #[tokio::test]
    async fn test_unresponsive_member_left_out_of_round() {
        let (network, nodes) = cluster_of(3, 8, ReschedulePolicy::Master).await;
        network.set_fault(nodes[2].id(), MemberFault::Unresponsive);

        let outcome = nodes[0].run(false).await;
        assert!(matches!(
            outcome,
            DistributionOutcome::Distributed { members: 2, local_share: 4, .. }
        ));
        assert_eq!(nodes[0].active(), vec![0, 2, 4, 6]);
        assert_eq!(nodes[1].active(), vec![1, 3, 5, 7]);

        // One probe per attempt, nothing else
        let to_unresponsive: Vec<_> = network
            .calls_from(nodes[0].id())
            .into_iter()
            .filter(|c| c.to == nodes[2].id())
            .map(|c| c.kind)
            .collect();
        assert_eq!(to_unresponsive, vec!["probe", "probe"]);
    }

    #[tokio::test]
    async fn test_remote_plan_on_non_master_reaches_master() {
        let (network, nodes) = cluster_of(2, 4, ReschedulePolicy::Master).await;

        nodes[1].run(true).await;
        let sent = kinds_sent(&network, &nodes[1]);
        assert!(sent.contains(&"plan"));
        assert_eq!(
            nodes[0].rescheduler.status().await.pending_remote,
            Some(false)
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(nodes[0].active(), vec![0, 2]);
        assert_eq!(nodes[1].active(), vec![1, 3]);
    }
}

// =============================================================================
// Fallbacks and lifecycle
// =============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_single_member_takes_all_fifty_users() {
        let (network, nodes) = cluster_of(1, 50, ReschedulePolicy::Master).await;

        let outcome = nodes[0].run(false).await;
        assert_eq!(
            outcome,
            DistributionOutcome::AllLocal {
                users: 50,
                started: 50
            }
        );
        assert_eq!(nodes[0].active().len(), 50);
        assert!(nodes[0].rescheduler.registry().all_users_started().await);
        assert!(network.calls_from(nodes[0].id()).is_empty());
    }

    #[tokio::test]
    async fn test_without_capable_members_first_starter_keeps_everything() {
        let network = InProcessNetwork::new();
        let store = shared_store(4).await;
        let not_capable = MemoryBackendOptions {
            listeners_require_resources: false,
            ..Default::default()
        };
        let a = node_with_options(&network, 1, store.clone(), ReschedulePolicy::PerNode, not_capable.clone()).await;
        let b = node_with_options(&network, 2, store, ReschedulePolicy::PerNode, not_capable).await;

        let outcome = a.run(false).await;
        assert_eq!(outcome, DistributionOutcome::AllLocal { users: 4, started: 4 });

        let outcome = b.run(false).await;
        assert_eq!(outcome, DistributionOutcome::NoCapableMembers);
        assert!(b.active().is_empty());
        assert_eq!(a.active(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_stop_while_planned_runs_nothing() {
        let (_network, nodes) = cluster_of(1, 3, ReschedulePolicy::PerNode).await;
        let rescheduler = &nodes[0].rescheduler;

        rescheduler.plan_reschedule(false, "test").await;
        assert_eq!(rescheduler.state().await, ReschedulerState::Planned);
        rescheduler.stop().await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(rescheduler.state().await, ReschedulerState::Stopped);
        assert!(nodes[0].active().is_empty());
        assert!(rescheduler.status().await.last_run.is_none());
    }

    #[tokio::test]
    async fn test_triggers_collapse_into_one_run() {
        let (_network, nodes) = cluster_of(1, 3, ReschedulePolicy::PerNode).await;
        let rescheduler = &nodes[0].rescheduler;

        for _ in 0..5 {
            rescheduler.plan_reschedule(false, "burst").await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(nodes[0].backend.start_count(&PushUser::new(1, 1)), 1);
        assert_eq!(rescheduler.state().await, ReschedulerState::Idle);
    }

    #[tokio::test]
    async fn test_shutdown_signal_interrupts_pending_work() {
        let (_network, nodes) = cluster_of(1, 3, ReschedulePolicy::PerNode).await;

        nodes[0].rescheduler.plan_reschedule(false, "test").await;
        nodes[0].signal.trigger();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(nodes[0].active().is_empty());
        assert!(!nodes[0].rescheduler.plan_reschedule(false, "late").await);
    }
}
