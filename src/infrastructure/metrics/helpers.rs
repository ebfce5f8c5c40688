//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use super::{
    BACKEND_ERRORS_TOTAL, CLUSTER_MEMBERS, CLUSTER_MEMBERSHIP_EVENTS_TOTAL,
    LISTENER_OPERATIONS_TOTAL, PERMANENT_LISTENERS_RUNNING, REMOTE_CALLS_TOTAL,
    RESCHEDULE_DURATION, RESCHEDULE_PLANS_TOTAL, RESCHEDULE_RUNS_TOTAL, TRACKED_PUSH_USERS,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for listener metrics
pub struct ListenerMetrics;

impl ListenerMetrics {
    pub fn set_running(count: usize) {
        PERMANENT_LISTENERS_RUNNING.set(count as i64);
    }

    pub fn set_tracked(count: usize) {
        TRACKED_PUSH_USERS.set(count as i64);
    }

    pub fn record_started() {
        LISTENER_OPERATIONS_TOTAL
            .with_label_values(&["start", "ok"])
            .inc();
    }

    pub fn record_stopped() {
        LISTENER_OPERATIONS_TOTAL
            .with_label_values(&["stop", "ok"])
            .inc();
    }

    pub fn record_failed(operation: &str) {
        LISTENER_OPERATIONS_TOTAL
            .with_label_values(&[operation, "error"])
            .inc();
    }

    /// Record a backend error by kind (`failed`, `credentials`, `shutdown`)
    pub fn record_backend_error(kind: &str) {
        BACKEND_ERRORS_TOTAL.with_label_values(&[kind]).inc();
    }
}

/// Helper struct for reschedule metrics
pub struct RescheduleMetrics;

impl RescheduleMetrics {
    /// Record a plan offer (`queued`, `upgraded`, `refreshed`, `ignored`)
    pub fn record_plan(effect: &str) {
        RESCHEDULE_PLANS_TOTAL.with_label_values(&[effect]).inc();
    }

    pub fn record_run(outcome: &str, duration: Duration) {
        RESCHEDULE_RUNS_TOTAL.with_label_values(&[outcome]).inc();
        RESCHEDULE_DURATION.observe(duration.as_secs_f64());
    }

    pub fn record_remote_call(request: &str, outcome: &str) {
        REMOTE_CALLS_TOTAL
            .with_label_values(&[request, outcome])
            .inc();
    }
}

/// Helper struct for cluster metrics
pub struct ClusterMetrics;

impl ClusterMetrics {
    pub fn set_members(count: usize) {
        CLUSTER_MEMBERS.set(count as i64);
    }

    pub fn record_member_added() {
        CLUSTER_MEMBERSHIP_EVENTS_TOTAL
            .with_label_values(&["added"])
            .inc();
    }

    pub fn record_member_removed() {
        CLUSTER_MEMBERSHIP_EVENTS_TOTAL
            .with_label_values(&["removed"])
            .inc();
    }
}
