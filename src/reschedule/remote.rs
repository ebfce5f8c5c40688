//! Bounded remote calls with a retry budget

use std::time::Duration;

use crate::cluster::{ClusterRequest, ClusterResponse, ClusterService, Member, RemoteCallError};
use crate::config::RescheduleConfig;
use crate::metrics::RescheduleMetrics;

/// Outcome of a remote call
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome<T> {
    Success(T),
    /// The attempt timed out and may be repeated
    Retryable(RemoteCallError),
    /// Every attempt timed out
    Exhausted,
    /// The target left the cluster
    MemberGone,
    /// Any other failure; not retried
    Failed(RemoteCallError),
}

impl<T> CallOutcome<T> {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Retryable(_) => "retryable",
            Self::Exhausted => "exhausted",
            Self::MemberGone => "member_gone",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RescheduleConfig) -> Self {
        Self {
            attempts: config.remote_attempts.max(1),
            timeout: config.remote_timeout(),
        }
    }
}

/// Call a member, retrying timeouts until the budget is spent.
///
/// A timed-out attempt is cancelled by dropping its future. Member-left and
/// other errors end the call immediately.
pub async fn call_with_retry(
    cluster: &dyn ClusterService,
    target: &Member,
    request: &ClusterRequest,
    policy: RetryPolicy,
) -> CallOutcome<ClusterResponse> {
    let attempts = policy.attempts.max(1);

    for attempt in 1..=attempts {
        match attempt_once(cluster, target, request.clone(), policy.timeout).await {
            CallOutcome::Retryable(cause) => {
                tracing::debug!(
                    member = %target,
                    request = request.kind(),
                    attempt = attempt,
                    cause = %cause,
                    "Remote call attempt failed"
                );
            }
            outcome => {
                RescheduleMetrics::record_remote_call(request.kind(), outcome.label());
                return outcome;
            }
        }
    }

    tracing::warn!(
        member = %target,
        request = request.kind(),
        attempts = attempts,
        "Remote call retry budget exhausted"
    );
    RescheduleMetrics::record_remote_call(request.kind(), "exhausted");
    CallOutcome::Exhausted
}

async fn attempt_once(
    cluster: &dyn ClusterService,
    target: &Member,
    request: ClusterRequest,
    timeout: Duration,
) -> CallOutcome<ClusterResponse> {
    match tokio::time::timeout(timeout, cluster.invoke(target, request)).await {
        Ok(Ok(response)) => CallOutcome::Success(response),
        Ok(Err(RemoteCallError::MemberLeft)) => CallOutcome::MemberGone,
        Ok(Err(RemoteCallError::Timeout)) => CallOutcome::Retryable(RemoteCallError::Timeout),
        Ok(Err(e)) => CallOutcome::Failed(e),
        Err(_) => CallOutcome::Retryable(RemoteCallError::Timeout),
    }
}
