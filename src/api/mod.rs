//! Admin HTTP API

mod health;
mod metrics;
mod push;
mod routes;

pub use health::{health, HealthResponse};
pub use metrics::prometheus_metrics;
pub use push::{plan_reschedule, push_status, reload_config, unregister_user};
pub use routes::api_routes;
