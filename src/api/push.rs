//! Push scheduling admin endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::error::{AppError, PushError, Result};
use crate::push::PushUser;
use crate::reschedule::RescheduleStatus;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct PushStatusResponse {
    pub rescheduler: RescheduleStatus,
    pub registry: RegistryStatus,
}

#[derive(Debug, Serialize)]
pub struct RegistryStatus {
    pub backends: Vec<String>,
    pub capable: bool,
    pub all_users_started: bool,
    pub tracked_push_users: usize,
    pub running_listeners: usize,
    /// Push users the backends report as running
    pub available_push_users: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct RescheduleRequest {
    /// Also ask the other members to reschedule
    #[serde(default)]
    pub remote: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RescheduleResponse {
    pub planned: bool,
    pub remote: bool,
}

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub reloaded: bool,
    pub policy: String,
}

#[derive(Debug, Serialize)]
pub struct UnregisterResponse {
    pub push_user: String,
    pub removed: u64,
}

/// GET /api/v1/push/status
pub async fn push_status(State(state): State<AppState>) -> Json<PushStatusResponse> {
    let registry = &state.registry;

    Json(PushStatusResponse {
        rescheduler: state.rescheduler.status().await,
        registry: RegistryStatus {
            backends: registry.backend_ids(),
            capable: registry.has_capable_backend(),
            all_users_started: registry.all_users_started().await,
            tracked_push_users: registry.tracked_push_users().await.len(),
            running_listeners: registry.running_jobs().len(),
            available_push_users: registry.available_push_users().await.len(),
        },
    })
}

/// POST /api/v1/push/reschedule
#[tracing::instrument(skip(state, request))]
pub async fn plan_reschedule(
    State(state): State<AppState>,
    request: Option<Json<RescheduleRequest>>,
) -> Result<(StatusCode, Json<RescheduleResponse>)> {
    if state.shutdown.is_shutting_down() {
        return Err(PushError::ShuttingDown.into());
    }

    let Json(request) = request.unwrap_or_default();
    let reason = request.reason.as_deref().unwrap_or("admin request");
    let planned = state
        .rescheduler
        .plan_reschedule(request.remote, reason)
        .await;

    let status = if planned {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(RescheduleResponse {
            planned,
            remote: request.remote,
        }),
    ))
}

/// POST /api/v1/push/reload
///
/// Re-reads the configuration and hands it to the event listener, or
/// applies it directly when no listener is running.
#[tracing::instrument(skip(state))]
pub async fn reload_config(State(state): State<AppState>) -> Result<Json<ReloadResponse>> {
    let settings = Arc::new(Settings::new()?);
    let policy = settings.reschedule.policy.to_string();

    if state.reload_tx.send(Arc::clone(&settings)).is_err() {
        state.registry.update_config(settings.push.clone()).await;
        state
            .rescheduler
            .update_config(settings.reschedule.clone())
            .await;
        state
            .rescheduler
            .plan_reschedule(false, "configuration reloaded")
            .await;
    }

    tracing::info!(policy = %policy, "Configuration reloaded");
    Ok(Json(ReloadResponse {
        reloaded: true,
        policy,
    }))
}

/// DELETE /api/v1/push/users/{context_id}/{user_id}
#[tracing::instrument(skip(state))]
pub async fn unregister_user(
    State(state): State<AppState>,
    Path(path): Path<(i32, i32)>,
) -> Result<Json<UnregisterResponse>> {
    let (context_id, user_id) = path;
    if user_id <= 0 || context_id <= 0 {
        return Err(AppError::Validation(
            "user_id and context_id must be positive".to_string(),
        ));
    }

    let push_user = PushUser::new(user_id, context_id);
    let removed = state.registry.unregister_all_for_user(&push_user).await?;

    Ok(Json(UnregisterResponse {
        push_user: push_user.to_string(),
        removed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InProcessCluster;
    use crate::config::{PushConfig, RescheduleConfig};
    use crate::push::store::MemoryRegistrationStore;
    use crate::push::{LocalJobQueue, MemoryPushBackend, PushManagerRegistry, RegistrationStore};
    use crate::reschedule::PermanentListenerRescheduler;
    use crate::server::create_app;
    use crate::shutdown::ShutdownSignal;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state(settings: Settings) -> (AppState, Arc<MemoryRegistrationStore>) {
        let signal = ShutdownSignal::new();
        let store = Arc::new(MemoryRegistrationStore::new());
        let registry = Arc::new(PushManagerRegistry::new(
            PushConfig::default(),
            Arc::new(LocalJobQueue::new()),
            store.clone(),
            signal.clone(),
        ));
        registry
            .add_backend(MemoryPushBackend::new("memory").descriptor())
            .await;
        let rescheduler = PermanentListenerRescheduler::new(
            registry,
            InProcessCluster::standalone("solo", None),
            RescheduleConfig::default(),
            signal.clone(),
        );
        (AppState::new(settings, rescheduler, signal), store)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let (state, _) = test_state(Settings::default()).await;
        let app = create_app(state);

        let response = app
            .oneshot(Request::get("/api/v1/push/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["rescheduler"]["state"], "idle");
        assert_eq!(body["rescheduler"]["policy"], "MASTER");
        assert_eq!(body["registry"]["backends"][0], "memory");
        assert_eq!(body["registry"]["capable"], true);
        assert_eq!(body["registry"]["available_push_users"], 0);
    }

    #[tokio::test]
    async fn test_status_reports_backend_listeners() {
        let (state, _) = test_state(Settings::default()).await;
        state
            .registry
            .apply_initial_listeners(
                vec![PushUser::new(1, 1), PushUser::new(2, 1)],
                false,
                std::time::Duration::ZERO,
            )
            .await;
        let app = create_app(state);

        let response = app
            .oneshot(Request::get("/api/v1/push/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["registry"]["available_push_users"], 2);
        assert_eq!(body["registry"]["running_listeners"], 2);
    }

    #[tokio::test]
    async fn test_reschedule_endpoint_plans() {
        let (state, _) = test_state(Settings::default()).await;
        let rescheduler = state.rescheduler.clone();
        let app = create_app(state);

        let request = Request::post("/api/v1/push/reschedule")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"remote":true,"reason":"manual"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let body = body_json(response).await;
        assert_eq!(body["planned"], true);
        assert_eq!(rescheduler.status().await.pending_remote, Some(true));
        rescheduler.stop().await;
    }

    #[tokio::test]
    async fn test_api_key_required_when_configured() {
        let mut settings = Settings::default();
        settings.api.key = Some("secret".to_string());
        let (state, _) = test_state(settings).await;
        let app = create_app(state);

        let response = app
            .clone()
            .oneshot(Request::get("/api/v1/push/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(
                Request::get("/api/v1/push/status")
                    .header("X-API-Key", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Health stays open
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unregister_user_endpoint() {
        let (state, store) = test_state(Settings::default()).await;
        store.insert(&PushUser::new(3, 1), "web").await.unwrap();
        store.insert(&PushUser::new(3, 1), "mobile").await.unwrap();
        let app = create_app(state);

        let response = app
            .clone()
            .oneshot(
                Request::delete("/api/v1/push/users/1/3")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["removed"], 2);

        let response = app
            .oneshot(
                Request::delete("/api/v1/push/users/1/0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let (state, _) = test_state(Settings::default()).await;
        let app = create_app(state);

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["cluster"]["backend"], "in_process");
        assert_eq!(body["cluster"]["members"], 1);

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("push_cluster_members"));
    }
}
