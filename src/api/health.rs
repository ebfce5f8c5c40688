//! Health check endpoint.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<DependencyHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresHealthResponse>,
    pub cluster: ClusterHealthResponse,
    pub push: PushHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct DependencyHealth {
    pub status: String,
    pub connected: bool,
}

#[derive(Debug, Serialize)]
pub struct PostgresHealthResponse {
    pub status: String,
    pub connected: bool,
    pub pool_size: u32,
    pub idle_connections: u32,
}

#[derive(Debug, Serialize)]
pub struct ClusterHealthResponse {
    pub backend: String,
    pub member: String,
    pub members: usize,
}

#[derive(Debug, Serialize)]
pub struct PushHealthResponse {
    pub backends: Vec<String>,
    pub capable: bool,
    pub running_listeners: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let redis = match &state.redis_pool {
        Some(pool) => {
            let connected = pool.ping().await.is_ok();
            Some(DependencyHealth {
                status: if connected { "connected" } else { "disconnected" }.to_string(),
                connected,
            })
        }
        None => None,
    };

    let postgres = state.postgres_pool.as_ref().map(|pool| {
        let inner = pool.pool();
        let connected = !inner.is_closed();
        PostgresHealthResponse {
            status: if connected { "connected" } else { "closed" }.to_string(),
            connected,
            pool_size: inner.size(),
            idle_connections: inner.num_idle() as u32,
        }
    });

    let cluster = state.cluster();
    let degraded = redis.as_ref().is_some_and(|r| !r.connected)
        || postgres.as_ref().is_some_and(|p| !p.connected);
    let status = if state.shutdown.is_shutting_down() {
        "shutting_down"
    } else if degraded {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        redis,
        postgres,
        cluster: ClusterHealthResponse {
            backend: cluster.backend_type().as_str().to_string(),
            member: cluster.local_member().to_string(),
            members: cluster.members().len(),
        },
        push: PushHealthResponse {
            backends: state.registry.backend_ids(),
            capable: state.registry.has_capable_backend(),
            running_listeners: state.registry.running_jobs().len(),
        },
    })
}
