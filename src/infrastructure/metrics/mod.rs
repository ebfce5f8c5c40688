//! Prometheus metrics for the push scheduler.
//!
//! - Listener metrics (running permanent listeners, tracked push users)
//! - Backend failure metrics
//! - Reschedule metrics (plans, runs, remote call outcomes, run duration)
//! - Cluster membership metrics

mod helpers;

pub use helpers::{encode_metrics, ClusterMetrics, ListenerMetrics, RescheduleMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge, Histogram, IntCounterVec,
    IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "push";

lazy_static! {
    // ============================================================================
    // Listener Metrics
    // ============================================================================

    /// Permanent listener jobs running in this process
    pub static ref PERMANENT_LISTENERS_RUNNING: IntGauge = register_int_gauge!(
        format!("{}_permanent_listeners_running", METRIC_PREFIX),
        "Number of permanent listener jobs running on this node"
    ).unwrap();

    /// Push users this node is currently assigned
    pub static ref TRACKED_PUSH_USERS: IntGauge = register_int_gauge!(
        format!("{}_tracked_push_users", METRIC_PREFIX),
        "Number of push users assigned to this node"
    ).unwrap();

    /// Listener operations by kind and result
    pub static ref LISTENER_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_listener_operations_total", METRIC_PREFIX),
        "Permanent listener start/stop operations",
        &["operation", "result"]
    ).unwrap();

    /// Backend failures by error kind
    pub static ref BACKEND_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_backend_errors_total", METRIC_PREFIX),
        "Errors reported by push backends",
        &["kind"]
    ).unwrap();

    // ============================================================================
    // Reschedule Metrics
    // ============================================================================

    /// Reschedule plans offered, by effect on the mailbox
    pub static ref RESCHEDULE_PLANS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_reschedule_plans_total", METRIC_PREFIX),
        "Reschedule plans offered to the mailbox",
        &["effect"]
    ).unwrap();

    /// Distribution runs by outcome
    pub static ref RESCHEDULE_RUNS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_reschedule_runs_total", METRIC_PREFIX),
        "Distribution runs by outcome",
        &["outcome"]
    ).unwrap();

    /// Remote call outcomes by request kind
    pub static ref REMOTE_CALLS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_remote_calls_total", METRIC_PREFIX),
        "Remote cluster calls by request and outcome",
        &["request", "outcome"]
    ).unwrap();

    /// Duration of a distribution run
    pub static ref RESCHEDULE_DURATION: Histogram = register_histogram!(
        format!("{}_reschedule_duration_seconds", METRIC_PREFIX),
        "Duration of distribution runs in seconds",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    // ============================================================================
    // Cluster Metrics
    // ============================================================================

    /// Cluster members currently visible to this node
    pub static ref CLUSTER_MEMBERS: IntGauge = register_int_gauge!(
        format!("{}_cluster_members", METRIC_PREFIX),
        "Number of cluster members visible to this node"
    ).unwrap();

    /// Membership events by kind
    pub static ref CLUSTER_MEMBERSHIP_EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_cluster_membership_events_total", METRIC_PREFIX),
        "Membership events observed",
        &["kind"]
    ).unwrap();
}
