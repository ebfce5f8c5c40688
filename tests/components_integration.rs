//! Cross-component integration tests
//!
//! Registry, stores, rescheduler and shutdown wired together the way
//! `main` wires them, on a standalone in-process cluster.

use std::sync::Arc;
use std::time::Duration;

use ara_permanent_push::cluster::{ClusterService, InProcessCluster, InProcessNetwork};
use ara_permanent_push::config::{PushConfig, RescheduleConfig};
use ara_permanent_push::push::store::{MemoryCredentialStore, MemoryRegistrationStore};
use ara_permanent_push::push::{
    AccessDenial, CredentialStore, LocalJobQueue, MemoryPushBackend, PushManagerRegistry,
    PushUser, RegistrationResult, RegistrationStore, Session, UnregistrationResult,
};
use ara_permanent_push::reschedule::{PermanentListenerRescheduler, ReschedulerState};
use ara_permanent_push::shutdown::{GracefulShutdown, ShutdownSignal};

struct TestEnvironment {
    registry: Arc<PushManagerRegistry>,
    rescheduler: Arc<PermanentListenerRescheduler>,
    backend: Arc<MemoryPushBackend>,
    store: Arc<MemoryRegistrationStore>,
    credentials: Arc<MemoryCredentialStore>,
    cluster: Arc<InProcessCluster>,
    signal: ShutdownSignal,
}

async fn environment(push: PushConfig) -> TestEnvironment {
    let signal = ShutdownSignal::new();
    let store = Arc::new(MemoryRegistrationStore::new());
    let credentials = Arc::new(MemoryCredentialStore::new());
    let registry = Arc::new(
        PushManagerRegistry::new(
            push,
            Arc::new(LocalJobQueue::new()),
            store.clone(),
            signal.clone(),
        )
        .with_credentials(credentials.clone()),
    );
    let backend = MemoryPushBackend::new("memory");
    registry.add_backend(backend.descriptor()).await;

    let cluster = InProcessCluster::standalone("solo", None);
    let rescheduler = PermanentListenerRescheduler::new(
        Arc::clone(&registry),
        cluster.clone(),
        RescheduleConfig {
            delay_ms: 30,
            frequency_ms: 10,
            handoff_park_ms: 0,
            apply_park_ms: 0,
            ..Default::default()
        },
        signal.clone(),
    );

    TestEnvironment {
        registry,
        rescheduler,
        backend,
        store,
        credentials,
        cluster,
        signal,
    }
}

#[tokio::test]
async fn test_register_starts_listener_immediately() {
    let env = environment(PushConfig::default()).await;
    let session = Session::new(7, 1).with_credentials("alice", "secret");

    let result = env
        .registry
        .register_permanent_listener(&session, "web")
        .await
        .unwrap();
    assert_eq!(result, RegistrationResult::Registered);
    assert!(env.backend.is_running(&PushUser::new(7, 1)));
    assert!(env.credentials.get(7, 1).await.unwrap().is_some());

    let again = env
        .registry
        .register_permanent_listener(&session, "web")
        .await
        .unwrap();
    assert_eq!(again, RegistrationResult::AlreadyRegistered);
    assert_eq!(env.backend.start_count(&PushUser::new(7, 1)), 1);
    assert_eq!(env.rescheduler.state().await, ReschedulerState::Idle);
}

#[tokio::test]
async fn test_register_with_rescheduling_defers_to_timer() {
    let env = environment(PushConfig {
        reschedule_on_registration: true,
        ..Default::default()
    })
    .await;
    let user = PushUser::new(3, 2);

    let result = env
        .registry
        .register_permanent_listener(&Session::new(3, 2), "web")
        .await
        .unwrap();
    assert_eq!(result, RegistrationResult::Registered);

    // Nothing runs until the quiet period is over
    assert!(!env.backend.is_running(&user));
    let status = env.rescheduler.status().await;
    assert_eq!(status.state, ReschedulerState::Planned);
    assert_eq!(status.pending_remote, Some(true));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(env.backend.is_running(&user));
    assert!(env.registry.all_users_started().await);

    let status = env.rescheduler.status().await;
    assert_eq!(status.state, ReschedulerState::Idle);
    assert_eq!(status.last_run.unwrap().outcome, "all_local");
}

#[tokio::test]
async fn test_register_with_rescheduling_disabled_starts_locally() {
    let env = environment(PushConfig {
        reschedule_on_registration: true,
        ..Default::default()
    })
    .await;
    env.rescheduler
        .update_config(RescheduleConfig {
            enabled: false,
            ..env.rescheduler.config().await
        })
        .await;
    let user = PushUser::new(1, 1);

    let result = env
        .registry
        .register_permanent_listener(&Session::new(1, 1), "web")
        .await
        .unwrap();

    assert_eq!(result, RegistrationResult::Registered);
    assert!(env.backend.is_running(&user));
    assert_eq!(env.registry.tracked_push_users().await, vec![user]);
    assert_eq!(env.rescheduler.state().await, ReschedulerState::Idle);
}

#[tokio::test]
async fn test_unregister_keeps_listener_until_last_registration() {
    let env = environment(PushConfig::default()).await;
    let session = Session::new(4, 1).with_credentials("bob", "pw");
    let user = PushUser::new(4, 1);

    env.registry
        .register_permanent_listener(&session, "web")
        .await
        .unwrap();
    env.registry
        .register_permanent_listener(&session, "mobile")
        .await
        .unwrap();

    let first = env
        .registry
        .unregister_permanent_listener(&session, "web")
        .await
        .unwrap();
    assert_eq!(first, UnregistrationResult::OtherRemaining);
    assert!(env.backend.is_running(&user));

    let last = env
        .registry
        .unregister_permanent_listener(&session, "mobile")
        .await
        .unwrap();
    assert_eq!(last, UnregistrationResult::LastRemoved);
    assert!(!env.backend.is_running(&user));
    assert!(env.credentials.get(4, 1).await.unwrap().is_none());
    assert!(env.registry.tracked_push_users().await.is_empty());

    let missing = env
        .registry
        .unregister_permanent_listener(&session, "mobile")
        .await
        .unwrap();
    assert_eq!(missing, UnregistrationResult::NotRegistered);
}

#[tokio::test]
async fn test_denied_registration_is_not_persisted() {
    let env = environment(PushConfig {
        permanent_push_allowed: false,
        ..Default::default()
    })
    .await;

    let result = env
        .registry
        .register_permanent_listener(&Session::new(1, 1), "web")
        .await
        .unwrap();
    assert_eq!(
        result,
        RegistrationResult::Denied(AccessDenial::PermanentPushDisabled)
    );
    assert!(env.store.list_push_users().await.unwrap().is_empty());
    assert!(env.backend.active_users().is_empty());
}

#[tokio::test]
async fn test_restart_picks_up_persisted_registrations() {
    let env = environment(PushConfig::default()).await;
    for user_id in 1..=5 {
        env.store
            .insert(&PushUser::new(user_id, 9), "web")
            .await
            .unwrap();
    }

    assert!(env.rescheduler.plan_reschedule(false, "startup").await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let running: Vec<i32> = env.backend.active_users().iter().map(|u| u.user_id).collect();
    assert_eq!(running, vec![1, 2, 3, 4, 5]);
    assert_eq!(env.registry.running_jobs().len(), 5);
}

#[tokio::test]
async fn test_graceful_shutdown_stops_everything() {
    let env = environment(PushConfig::default()).await;
    for user_id in 1..=3 {
        env.registry
            .register_permanent_listener(&Session::new(user_id, 1), "web")
            .await
            .unwrap();
    }
    env.rescheduler.plan_reschedule(false, "pending").await;

    let result = GracefulShutdown::new(
        Arc::clone(&env.rescheduler),
        Arc::clone(&env.registry),
        env.cluster.clone(),
        env.signal.clone(),
    )
    .execute("test")
    .await;

    assert!(result.success);
    assert_eq!(result.listeners_stopped, 3);
    assert!(result.listeners_drained);
    assert!(result.left_cluster);
    assert!(env.backend.active_users().is_empty());
    assert!(env.signal.is_shutting_down());
    assert_eq!(env.rescheduler.state().await, ReschedulerState::Stopped);

    let late = env
        .registry
        .register_permanent_listener(&Session::new(9, 1), "web")
        .await;
    assert!(late.is_err());
}

#[tokio::test]
async fn test_leaving_member_disappears_from_peers() {
    let network = InProcessNetwork::new();
    let a = network.join("a", None);
    let b = network.join("b", None);
    let mut events = a.subscribe();

    assert_eq!(a.members().len(), 2);
    b.leave().await;

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.member().id, b.local_member().id);
    assert_eq!(a.members().len(), 1);
}
