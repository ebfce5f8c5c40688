use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;

use ara_permanent_push::cluster::create_cluster;
use ara_permanent_push::config::Settings;
use ara_permanent_push::postgres::PostgresPool;
use ara_permanent_push::push::store::{create_credential_store, create_registration_store};
use ara_permanent_push::push::{
    LocalJobQueue, MemoryBackendOptions, MemoryPushBackend, PushManagerRegistry,
};
use ara_permanent_push::redis::RedisPool;
use ara_permanent_push::reschedule::PermanentListenerRescheduler;
use ara_permanent_push::server::{create_app, AppState};
use ara_permanent_push::shutdown::{GracefulShutdown, ShutdownSignal};
use ara_permanent_push::tasks::RescheduleEventListener;
use ara_permanent_push::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!("Configuration loaded");

    let shutdown = ShutdownSignal::new();

    // Storage
    let redis_pool = connect_redis(&settings).await;
    let postgres_pool = connect_postgres(&settings).await;
    let registrations = create_registration_store(postgres_pool.as_deref()).await;
    let credentials = create_credential_store(redis_pool.clone());

    // Registry and backends
    let registry = Arc::new(
        PushManagerRegistry::new(
            settings.push.clone(),
            Arc::new(LocalJobQueue::new()),
            registrations,
            shutdown.clone(),
        )
        .with_credentials(credentials),
    );

    let memory = &settings.push.memory_backend;
    if memory.enabled {
        let backend = MemoryPushBackend::with_options(
            memory.id.clone(),
            MemoryBackendOptions {
                listeners_require_resources: memory.listeners_require_resources,
                ..Default::default()
            },
        );
        registry.add_backend(backend.descriptor()).await;
    }

    // Cluster and rescheduler
    let cluster = create_cluster(&settings.cluster, redis_pool.clone(), shutdown.clone()).await;
    let rescheduler = PermanentListenerRescheduler::new(
        Arc::clone(&registry),
        Arc::clone(&cluster),
        settings.reschedule.clone(),
        shutdown.clone(),
    );
    tracing::info!(
        member = %cluster.local_member(),
        policy = %settings.reschedule.policy,
        "Rescheduler initialized"
    );

    let mut state = AppState::new(settings.clone(), Arc::clone(&rescheduler), shutdown.clone());
    if let Some(pool) = &redis_pool {
        state = state.with_redis(Arc::clone(pool));
    }
    if let Some(pool) = &postgres_pool {
        state = state.with_postgres(Arc::clone(pool));
    }

    // Start event listener in background
    let event_listener = RescheduleEventListener::new(
        Arc::clone(&rescheduler),
        state.reload_tx.subscribe(),
        shutdown.subscribe(),
    );
    let events_handle = tokio::spawn(event_listener.run());

    // Claim this node's share once the cluster has settled
    match rescheduler.schedule_startup().await {
        Ok(0) => {}
        Ok(started) => tracing::info!(started = started, "Permanent listeners started"),
        Err(e) => tracing::error!(error = %e, "Failed to start permanent listeners"),
    }

    // Create Axum app
    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_termination())
        .await?;

    let result = GracefulShutdown::new(rescheduler, registry, cluster, shutdown)
        .execute("process termination")
        .await;
    if !result.success {
        tracing::warn!(?result, "Graceful shutdown incomplete");
    }

    // Wait for background tasks to finish
    let _ = events_handle.await;
    if let Some(pool) = postgres_pool {
        pool.close().await;
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn connect_redis(settings: &Settings) -> Option<Arc<RedisPool>> {
    let pool = match RedisPool::new(settings.redis.clone()) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(error = %e, "Invalid Redis configuration, continuing without Redis");
            return None;
        }
    };

    match pool.ping().await {
        Ok(()) => {
            tracing::info!("Redis connection established");
            Some(Arc::new(pool))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Redis unreachable, continuing without Redis");
            None
        }
    }
}

async fn connect_postgres(settings: &Settings) -> Option<Arc<PostgresPool>> {
    settings.database.url.as_ref()?;

    match PostgresPool::connect(&settings.database).await {
        Ok(pool) => Some(Arc::new(pool)),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to connect to PostgreSQL, continuing without it");
            None
        }
    }
}

async fn wait_for_termination() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
