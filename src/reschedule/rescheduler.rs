//! Cluster-wide rescheduling of permanent listeners.
//!
//! Triggers (membership changes, registrations, config reloads, remote
//! requests) are collapsed into a single pending plan. Once the cluster has
//! been quiet for the configured delay the plan runs: members are probed, the
//! capable ones ranked, and the registered push users partitioned across them
//! according to the configured policy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::cluster::{
    ClusterRequest, ClusterRequestHandler, ClusterResponse, ClusterService, Member, ProbeReport,
};
use crate::config::RescheduleConfig;
use crate::error::PushError;
use crate::metrics::RescheduleMetrics;
use crate::push::{PushManagerRegistry, PushUser, RescheduleTrigger};
use crate::shutdown::ShutdownSignal;

use super::plan::{PlanMailbox, ReschedulePlan};
use super::policy::{partition, partition_all, rank_members, ReschedulePolicy};
use super::remote::{call_with_retry, CallOutcome, RetryPolicy};

#[derive(Error, Debug)]
pub enum RescheduleError {
    #[error("Failed to list registered push users: {0}")]
    Registry(#[from] PushError),

    #[error("Rescheduler is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReschedulerState {
    Idle,
    /// A plan is pending or the timer is still running
    Planned,
    Executing,
    /// Terminal; plans are ignored
    Stopped,
}

/// What a distribution run did on this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DistributionOutcome {
    /// This node took every registered push user
    AllLocal { users: usize, started: usize },
    /// Users were partitioned across the capable members
    Distributed {
        policy: ReschedulePolicy,
        members: usize,
        local_share: usize,
        started: usize,
    },
    /// Another member is master and hands this node its share
    NotMaster { master: Member },
    /// Nobody can take listeners while some member already runs them
    NoCapableMembers,
}

impl DistributionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AllLocal { .. } => "all_local",
            Self::Distributed { .. } => "distributed",
            Self::NotMaster { .. } => "not_master",
            Self::NoCapableMembers => "no_capable_members",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LastRun {
    pub outcome: String,
    pub remote: bool,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RescheduleStatus {
    pub state: ReschedulerState,
    pub enabled: bool,
    pub policy: ReschedulePolicy,
    /// Whether the pending plan is remote; absent without a pending plan
    pub pending_remote: Option<bool>,
    pub local_member: Member,
    pub members: usize,
    pub last_run: Option<LastRun>,
}

#[derive(Default)]
struct Scheduler {
    mailbox: PlanMailbox,
    timer: Option<JoinHandle<()>>,
    stopped: bool,
    last_run: Option<LastRun>,
}

pub struct PermanentListenerRescheduler {
    pub(super) registry: Arc<PushManagerRegistry>,
    pub(super) cluster: Arc<dyn ClusterService>,
    config: RwLock<RescheduleConfig>,
    scheduler: Mutex<Scheduler>,
    /// Dispatched runs not yet finished
    executing: AtomicUsize,
    /// Serializes distribution runs on this node
    run_lock: Mutex<()>,
    pub(super) shutdown: ShutdownSignal,
    pub(super) weak_self: Weak<Self>,
}

impl PermanentListenerRescheduler {
    /// Create the rescheduler and install it as the cluster request handler
    /// and as the registry's reschedule trigger.
    pub fn new(
        registry: Arc<PushManagerRegistry>,
        cluster: Arc<dyn ClusterService>,
        config: RescheduleConfig,
        shutdown: ShutdownSignal,
    ) -> Arc<Self> {
        let rescheduler = Arc::new_cyclic(|weak_self| Self {
            registry,
            cluster,
            config: RwLock::new(config),
            scheduler: Mutex::new(Scheduler::default()),
            executing: AtomicUsize::new(0),
            run_lock: Mutex::new(()),
            shutdown,
            weak_self: weak_self.clone(),
        });

        let handler: Weak<dyn ClusterRequestHandler> = rescheduler.weak_self.clone();
        rescheduler.cluster.set_request_handler(handler);
        let trigger: Weak<dyn RescheduleTrigger> = rescheduler.weak_self.clone();
        rescheduler.registry.set_reschedule_trigger(trigger);

        rescheduler
    }

    pub fn registry(&self) -> &Arc<PushManagerRegistry> {
        &self.registry
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterService> {
        &self.cluster
    }

    pub async fn config(&self) -> RescheduleConfig {
        self.config.read().await.clone()
    }

    pub async fn update_config(&self, config: RescheduleConfig) {
        tracing::info!(
            enabled = config.enabled,
            policy = %config.policy,
            delay_ms = config.delay_ms,
            "Reschedule configuration updated"
        );
        *self.config.write().await = config;
    }

    // ========================================================================
    // Planning
    // ========================================================================

    /// Offer a plan to the mailbox and make sure the timer runs.
    ///
    /// Returns false if the plan was ignored (disabled, stopped or shutting
    /// down).
    pub async fn plan_reschedule(&self, remote: bool, reason: &str) -> bool {
        let config = self.config().await;
        if !config.enabled {
            tracing::debug!(reason = %reason, "Rescheduling disabled, plan ignored");
            return false;
        }

        let mut scheduler = self.scheduler.lock().await;
        if scheduler.stopped || self.shutdown.is_shutting_down() {
            tracing::debug!(reason = %reason, "Rescheduler stopped, plan ignored");
            return false;
        }

        let effect = scheduler.mailbox.offer(remote, Instant::now());
        RescheduleMetrics::record_plan(effect.as_str());
        tracing::info!(
            remote = remote,
            reason = %reason,
            effect = effect.as_str(),
            "Reschedule planned"
        );

        let timer_running = scheduler
            .timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished());
        if !timer_running {
            let Some(this) = self.weak_self.upgrade() else {
                return false;
            };
            scheduler.timer = Some(tokio::spawn(this.run_timer(
                config.delay(),
                config.frequency(),
            )));
        }

        true
    }

    /// Plan the start-up pass. If rescheduling refuses the plan, every
    /// registered push user is started on this node right away.
    ///
    /// Returns the number of listeners started locally.
    pub async fn schedule_startup(&self) -> Result<usize, RescheduleError> {
        if self.plan_reschedule(false, "startup").await {
            return Ok(0);
        }

        let users = self.registry.users_with_permanent_listeners().await?;
        tracing::info!(
            users = users.len(),
            "Rescheduling unavailable, starting all permanent listeners locally"
        );
        let started = self
            .registry
            .apply_initial_listeners(users, true, Duration::ZERO)
            .await;
        Ok(started.len())
    }

    /// Stop the timer and discard the pending plan. Terminal.
    pub async fn stop(&self) {
        let mut scheduler = self.scheduler.lock().await;
        if scheduler.stopped {
            return;
        }
        scheduler.stopped = true;
        scheduler.mailbox.clear();
        if let Some(timer) = scheduler.timer.take() {
            timer.abort();
        }
        tracing::info!("Permanent listener rescheduler stopped");
    }

    pub async fn state(&self) -> ReschedulerState {
        let scheduler = self.scheduler.lock().await;
        if scheduler.stopped {
            ReschedulerState::Stopped
        } else if self.executing.load(Ordering::Acquire) > 0 {
            ReschedulerState::Executing
        } else if !scheduler.mailbox.is_empty()
            || scheduler.timer.as_ref().is_some_and(|t| !t.is_finished())
        {
            ReschedulerState::Planned
        } else {
            ReschedulerState::Idle
        }
    }

    pub async fn status(&self) -> RescheduleStatus {
        let state = self.state().await;
        let config = self.config().await;
        let (pending_remote, last_run) = {
            let scheduler = self.scheduler.lock().await;
            (
                scheduler.mailbox.peek().map(|plan| plan.remote),
                scheduler.last_run.clone(),
            )
        };

        RescheduleStatus {
            state,
            enabled: config.enabled,
            policy: config.policy,
            pending_remote,
            local_member: self.cluster.local_member(),
            members: self.cluster.members().len(),
            last_run,
        }
    }

    /// Timer loop: first tick once the delay has passed, then every
    /// `frequency` until the mailbox is drained.
    async fn run_timer(self: Arc<Self>, delay: Duration, frequency: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + delay, frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => {
                    tracing::debug!("Reschedule timer stopped by shutdown");
                    break;
                }
                _ = ticker.tick() => {
                    if !self.tick().await {
                        break;
                    }
                }
            }
        }
    }

    /// Dispatch the plan if eligible. Returns whether the timer keeps running.
    async fn tick(self: &Arc<Self>) -> bool {
        let delay = self.config.read().await.delay();

        let (plan, keep_running) = {
            let mut scheduler = self.scheduler.lock().await;
            if scheduler.stopped {
                return false;
            }
            let plan = scheduler.mailbox.poll_eligible(Instant::now(), delay);
            if plan.is_some() {
                self.executing.fetch_add(1, Ordering::AcqRel);
            }
            let keep_running = !scheduler.mailbox.is_empty();
            if !keep_running {
                scheduler.timer = None;
            }
            (plan, keep_running)
        };

        if let Some(plan) = plan {
            self.dispatch(plan);
        }
        keep_running
    }

    /// Run the plan on a worker task so the timer is never blocked
    fn dispatch(self: &Arc<Self>, plan: ReschedulePlan) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = this.shutdown.wait() => {
                    tracing::info!("Reschedule run interrupted by shutdown");
                }
                result = this.run_distribution(plan) => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Reschedule run failed");
                    }
                }
            }
            this.executing.fetch_sub(1, Ordering::AcqRel);
        });
    }

    // ========================================================================
    // Distribution
    // ========================================================================

    /// Compute and apply the assignment for one plan.
    ///
    /// Runs are serialized per node. Remote failures only exclude the
    /// affected member from this round.
    #[tracing::instrument(skip(self, plan), fields(remote = plan.remote))]
    pub async fn run_distribution(
        &self,
        plan: ReschedulePlan,
    ) -> Result<DistributionOutcome, RescheduleError> {
        let _serialized = self.run_lock.lock().await;
        if self.shutdown.is_shutting_down() {
            return Err(RescheduleError::ShuttingDown);
        }

        let config = self.config().await;
        let started_at = Instant::now();
        let result = self.distribute(plan.remote, &config).await;
        let elapsed = started_at.elapsed();

        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(_) => "error",
        };
        RescheduleMetrics::record_run(label, elapsed);
        self.scheduler.lock().await.last_run = Some(LastRun {
            outcome: label.to_string(),
            remote: plan.remote,
            duration_ms: elapsed.as_millis() as u64,
            finished_at: Utc::now(),
        });

        match &result {
            Ok(outcome) => tracing::info!(
                outcome = label,
                elapsed_ms = elapsed.as_millis() as u64,
                "Reschedule run finished"
            ),
            Err(e) => tracing::error!(error = %e, "Reschedule run aborted"),
        }
        result
    }

    async fn distribute(
        &self,
        remote: bool,
        config: &RescheduleConfig,
    ) -> Result<DistributionOutcome, RescheduleError> {
        let users = self.registry.users_with_permanent_listeners().await?;
        let local = self.cluster.local_member();
        let retry = RetryPolicy::from_config(config);

        let others: Vec<Member> = self
            .cluster
            .members()
            .into_iter()
            .filter(|m| *m != local)
            .collect();

        if others.is_empty() {
            tracing::debug!(users = users.len(), "Single member, taking all push users");
            return Ok(self.assign_all_locally(users).await);
        }

        let reports = self.probe_members(&others, retry).await;
        let any_started = reports.iter().any(|(_, report)| report.all_users_started);

        let mut capable: Vec<Member> = reports
            .into_iter()
            .filter(|(_, report)| report.has_capable_backend)
            .map(|(member, _)| member)
            .collect();
        if self.registry.has_capable_backend() {
            capable.push(local.clone());
        }

        if capable.is_empty() {
            if any_started {
                tracing::info!("No capable member but listeners already running elsewhere, skipping");
                return Ok(DistributionOutcome::NoCapableMembers);
            }
            tracing::info!("No capable member, taking all push users");
            return Ok(self.assign_all_locally(users).await);
        }
        rank_members(&mut capable);

        if remote {
            self.propagate_plan(&capable, &local, config.policy, retry)
                .await;
        }

        match config.policy {
            ReschedulePolicy::PerNode => Ok(self.apply_per_node(&users, &capable, &local, config).await),
            ReschedulePolicy::Master => Ok(self
                .apply_as_master(&users, &capable, &local, config, retry)
                .await),
        }
    }

    /// Take every push user, without a park between stop and start
    async fn assign_all_locally(&self, users: Vec<PushUser>) -> DistributionOutcome {
        let count = users.len();
        let started = self
            .registry
            .apply_initial_listeners(users, true, Duration::ZERO)
            .await;
        DistributionOutcome::AllLocal {
            users: count,
            started: started.len(),
        }
    }

    /// Probe the given members concurrently. Members that left, failed or
    /// ran out of retries are left out.
    async fn probe_members(
        &self,
        members: &[Member],
        retry: RetryPolicy,
    ) -> Vec<(Member, ProbeReport)> {
        let probes = members.iter().map(|member| async move {
            let outcome =
                call_with_retry(self.cluster.as_ref(), member, &ClusterRequest::Probe, retry).await;
            (member, outcome)
        });

        join_all(probes)
            .await
            .into_iter()
            .filter_map(|(member, outcome)| match outcome {
                CallOutcome::Success(ClusterResponse::Probe(report)) => {
                    tracing::debug!(
                        member = %member,
                        capable = report.has_capable_backend,
                        all_started = report.all_users_started,
                        "Member probed"
                    );
                    Some((member.clone(), report))
                }
                CallOutcome::MemberGone => {
                    tracing::info!(member = %member, "Member left during probe");
                    None
                }
                other => {
                    tracing::warn!(
                        member = %member,
                        outcome = other.label(),
                        "Member excluded from this round"
                    );
                    None
                }
            })
            .collect()
    }

    /// Ask other members to plan a reschedule of their own
    async fn propagate_plan(
        &self,
        capable: &[Member],
        local: &Member,
        policy: ReschedulePolicy,
        retry: RetryPolicy,
    ) {
        let targets: Vec<&Member> = match policy {
            ReschedulePolicy::PerNode => capable.iter().filter(|m| *m != local).collect(),
            ReschedulePolicy::Master => capable.first().filter(|m| *m != local).into_iter().collect(),
        };
        if targets.is_empty() {
            return;
        }

        let request = ClusterRequest::PlanReschedule {
            reason: format!("requested by {}", local),
        };
        let calls = targets.into_iter().map(|member| {
            let request = &request;
            async move {
                let outcome = call_with_retry(self.cluster.as_ref(), member, request, retry).await;
                if !matches!(outcome, CallOutcome::Success(_)) {
                    tracing::warn!(
                        member = %member,
                        outcome = outcome.label(),
                        "Failed to propagate reschedule plan"
                    );
                }
            }
        });
        join_all(calls).await;
    }

    async fn apply_per_node(
        &self,
        users: &[PushUser],
        capable: &[Member],
        local: &Member,
        config: &RescheduleConfig,
    ) -> DistributionOutcome {
        let share = match capable.iter().position(|m| m == local) {
            Some(position) => partition(users, capable.len(), position),
            None => Vec::new(),
        };
        let local_share = share.len();

        let started = self
            .registry
            .apply_initial_listeners(share, false, config.apply_park())
            .await;

        DistributionOutcome::Distributed {
            policy: ReschedulePolicy::PerNode,
            members: capable.len(),
            local_share,
            started: started.len(),
        }
    }

    async fn apply_as_master(
        &self,
        users: &[PushUser],
        capable: &[Member],
        local: &Member,
        config: &RescheduleConfig,
        retry: RetryPolicy,
    ) -> DistributionOutcome {
        let Some(master) = capable.first() else {
            return DistributionOutcome::NoCapableMembers;
        };
        if master != local {
            tracing::debug!(master = %master, "Not master, waiting for assignment");
            return DistributionOutcome::NotMaster {
                master: master.clone(),
            };
        }

        // Stop everything cluster-wide; only members that confirmed take part
        let stops = capable.iter().filter(|m| *m != local).map(|member| async move {
            let outcome = call_with_retry(
                self.cluster.as_ref(),
                member,
                &ClusterRequest::StopAllPermanentListeners,
                retry,
            )
            .await;
            (member, outcome)
        });

        let mut participants = vec![local.clone()];
        for (member, outcome) in join_all(stops).await {
            match outcome {
                CallOutcome::Success(ClusterResponse::Stopped { count }) => {
                    tracing::debug!(member = %member, stopped = count, "Member stopped its listeners");
                    participants.push(member.clone());
                }
                other => {
                    tracing::warn!(
                        member = %member,
                        outcome = other.label(),
                        "Member did not stop its listeners, excluded from this round"
                    );
                }
            }
        }

        self.registry.stop_all_permanent_listeners().await;

        let park = config.handoff_park();
        if !park.is_zero() {
            tokio::time::sleep(park).await;
        }

        rank_members(&mut participants);
        let shares = partition_all(users, participants.len());

        let deliveries = participants
            .iter()
            .zip(shares.iter())
            .filter(|(member, _)| *member != local)
            .map(|(member, share)| async move {
                let request = ClusterRequest::StartPermanentListeners {
                    users: share.clone(),
                };
                match call_with_retry(self.cluster.as_ref(), member, &request, retry).await {
                    CallOutcome::Success(ClusterResponse::Started { count }) => {
                        tracing::debug!(
                            member = %member,
                            assigned = share.len(),
                            started = count,
                            "Share delivered"
                        );
                    }
                    other => {
                        tracing::warn!(
                            member = %member,
                            assigned = share.len(),
                            outcome = other.label(),
                            "Failed to deliver share"
                        );
                    }
                }
            });
        join_all(deliveries).await;

        let own = participants
            .iter()
            .position(|m| m == local)
            .and_then(|position| shares.get(position).cloned())
            .unwrap_or_default();
        let local_share = own.len();

        let started = self
            .registry
            .apply_initial_listeners(own, false, config.apply_park())
            .await;

        DistributionOutcome::Distributed {
            policy: ReschedulePolicy::Master,
            members: participants.len(),
            local_share,
            started: started.len(),
        }
    }

    /// Tell every other member to drop the given users, without waiting
    pub(super) fn notify_drop(&self, users: Vec<PushUser>) {
        if users.is_empty() {
            return;
        }
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };

        tokio::spawn(async move {
            let retry = RetryPolicy::from_config(&this.config().await);
            let local = this.cluster.local_member();
            let request = ClusterRequest::DropPermanentListeners { users };

            let targets: Vec<Member> = this
                .cluster
                .members()
                .into_iter()
                .filter(|m| *m != local)
                .collect();
            let calls = targets.iter().map(|member| {
                let this = &this;
                let request = &request;
                async move {
                    let outcome =
                        call_with_retry(this.cluster.as_ref(), member, request, retry).await;
                    if let CallOutcome::Success(ClusterResponse::Dropped { count }) = outcome {
                        if count > 0 {
                            tracing::info!(member = %member, dropped = count, "Member dropped duplicate listeners");
                        }
                    }
                }
            });
            join_all(calls).await;
        });
    }
}

#[async_trait]
impl RescheduleTrigger for PermanentListenerRescheduler {
    async fn plan_reschedule(&self, remote: bool, reason: &str) -> bool {
        PermanentListenerRescheduler::plan_reschedule(self, remote, reason).await
    }
}
