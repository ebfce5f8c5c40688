//! Graceful shutdown of a push node.
//!
//! Shutdown runs in phases:
//! 1. Stop the rescheduler so no new distribution round starts
//! 2. Stop every permanent listener running on this node
//! 3. Signal background tasks to stop
//! 4. Leave the cluster so the remaining members rebalance

mod signal;

pub use signal::ShutdownSignal;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::cluster::ClusterService;
use crate::push::PushManagerRegistry;
use crate::reschedule::PermanentListenerRescheduler;

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time allowed for stopping the local permanent listeners (default: 10 seconds)
    pub listener_stop_timeout: Duration,
    /// Time allowed for leaving the cluster (default: 5 seconds)
    pub leave_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            listener_stop_timeout: Duration::from_secs(10),
            leave_timeout: Duration::from_secs(5),
        }
    }
}

pub struct GracefulShutdown {
    rescheduler: Arc<PermanentListenerRescheduler>,
    registry: Arc<PushManagerRegistry>,
    cluster: Arc<dyn ClusterService>,
    signal: ShutdownSignal,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(
        rescheduler: Arc<PermanentListenerRescheduler>,
        registry: Arc<PushManagerRegistry>,
        cluster: Arc<dyn ClusterService>,
        signal: ShutdownSignal,
    ) -> Self {
        Self::with_config(rescheduler, registry, cluster, signal, ShutdownConfig::default())
    }

    pub fn with_config(
        rescheduler: Arc<PermanentListenerRescheduler>,
        registry: Arc<PushManagerRegistry>,
        cluster: Arc<dyn ClusterService>,
        signal: ShutdownSignal,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            rescheduler,
            registry,
            cluster,
            signal,
            config,
        }
    }

    /// Execute the shutdown sequence
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(running_listeners = self.registry.running_jobs().len())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Stopping rescheduler");
        self.rescheduler.stop().await;

        tracing::info!("Phase 2: Stopping permanent listeners");
        match timeout(
            self.config.listener_stop_timeout,
            self.registry.stop_all_permanent_listeners(),
        )
        .await
        {
            Ok(stopped) => {
                result.listeners_stopped = stopped;
                result.listeners_drained = true;
            }
            Err(_) => {
                tracing::warn!(
                    remaining = self.registry.running_jobs().len(),
                    "Timeout stopping permanent listeners"
                );
            }
        }

        tracing::info!("Phase 3: Signaling background tasks to stop");
        self.signal.trigger();

        tracing::info!("Phase 4: Leaving cluster");
        result.left_cluster = timeout(self.config.leave_timeout, self.cluster.leave())
            .await
            .is_ok();
        if !result.left_cluster {
            tracing::warn!("Timeout leaving cluster, members will expire this node");
        }

        result.duration = start.elapsed();
        result.success = result.listeners_drained && result.left_cluster;

        tracing::info!(
            listeners_stopped = result.listeners_stopped,
            left_cluster = result.left_cluster,
            duration_ms = result.duration.as_millis(),
            "Graceful shutdown completed"
        );

        result
    }
}

#[derive(Debug, Default)]
pub struct ShutdownResult {
    pub success: bool,
    /// Number of push users whose permanent listeners were stopped
    pub listeners_stopped: usize,
    /// Whether stopping the listeners finished in time
    pub listeners_drained: bool,
    pub left_cluster: bool,
    pub duration: Duration,
}
