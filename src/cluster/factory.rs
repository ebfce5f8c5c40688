//! Factory function for creating the cluster service

use std::sync::Arc;

use crate::config::ClusterConfig;
use crate::redis::RedisPool;
use crate::shutdown::ShutdownSignal;

use super::local::InProcessCluster;
use super::redis_cluster::RedisCluster;
use super::traits::ClusterService;

/// Create the cluster service based on configuration.
///
/// Cluster mode needs Redis; without it (or if joining fails) the node runs
/// as a single-member cluster.
pub async fn create_cluster(
    config: &ClusterConfig,
    redis_pool: Option<Arc<RedisPool>>,
    shutdown: ShutdownSignal,
) -> Arc<dyn ClusterService> {
    if !config.enabled {
        tracing::info!(node_name = %config.node_name, "Cluster mode disabled, running standalone");
        return standalone(config);
    }

    let Some(pool) = redis_pool else {
        tracing::warn!("Cluster mode enabled but Redis pool not available, running standalone");
        return standalone(config);
    };

    match RedisCluster::start(pool, config.clone(), shutdown).await {
        Ok(cluster) => {
            tracing::info!(
                node_name = %config.node_name,
                heartbeat_interval = config.heartbeat_interval_seconds,
                "Using Redis cluster"
            );
            cluster
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to join Redis cluster, running standalone");
            standalone(config)
        }
    }
}

fn standalone(config: &ClusterConfig) -> Arc<dyn ClusterService> {
    InProcessCluster::standalone(config.node_name.clone(), config.advertise_socket_addr())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterBackend;

    #[tokio::test]
    async fn test_create_standalone_cluster() {
        let config = ClusterConfig {
            enabled: false,
            node_name: "solo".to_string(),
            ..Default::default()
        };

        let cluster = create_cluster(&config, None, ShutdownSignal::new()).await;
        assert_eq!(cluster.backend_type(), ClusterBackend::InProcess);
        assert_eq!(cluster.members().len(), 1);
        assert_eq!(cluster.local_member().name, "solo");
    }

    #[tokio::test]
    async fn test_enabled_without_redis_falls_back() {
        let config = ClusterConfig {
            enabled: true,
            ..Default::default()
        };

        let cluster = create_cluster(&config, None, ShutdownSignal::new()).await;
        assert_eq!(cluster.backend_type(), ClusterBackend::InProcess);
    }
}
