use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

use crate::server::{api_key_auth, AppState};

use super::health::health;
use super::metrics::prometheus_metrics;
use super::push::{plan_reschedule, push_status, reload_config, unregister_user};

pub fn api_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .nest(
            "/api/v1",
            Router::new()
                .route("/push/status", get(push_status))
                .route("/push/reschedule", post(plan_reschedule))
                .route("/push/reload", post(reload_config))
                .route(
                    "/push/users/{context_id}/{user_id}",
                    delete(unregister_user),
                )
                .route_layer(middleware::from_fn_with_state(state, api_key_auth)),
        )
}
