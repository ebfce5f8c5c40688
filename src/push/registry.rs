//! Push manager registry.
//!
//! Owns the registered backends and reconciles the push users this node is
//! assigned ("initial push users") against the permanent listeners actually
//! running. Also gates registration and ephemeral listener requests and keeps
//! stored credentials in line with registrations.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};

use crate::config::PushConfig;
use crate::error::PushError;
use crate::metrics::ListenerMetrics;
use crate::shutdown::ShutdownSignal;

use super::access::{check_access, AccessDenial};
use super::backend::{BackendError, PushBackend};
use super::job_queue::JobQueue;
use super::store::{CredentialStore, DeleteOutcome, RegistrationStore, SessionLookup};
use super::types::{PermanentListenerJob, PushListener, PushUser, Session};
use super::RescheduleTrigger;

/// Outcome of a permanent listener registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationResult {
    Registered,
    AlreadyRegistered,
    Denied(AccessDenial),
}

/// Outcome of removing a permanent listener registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnregistrationResult {
    /// The user's last registration was removed and its listener stopped
    LastRemoved,
    /// Other registrations of the user remain
    OtherRemaining,
    NotRegistered,
    Denied(AccessDenial),
}

#[derive(Default)]
struct InitialPushUsers {
    users: HashSet<PushUser>,
    /// Set once an authoritative assignment has been applied
    all_started: bool,
}

/// Whether a bulk loop may go on with the next user
enum LoopControl {
    Continue,
    Abort,
}

pub struct PushManagerRegistry {
    backends: DashMap<String, Arc<PushBackend>>,
    initial: Mutex<InitialPushUsers>,
    job_queue: Arc<dyn JobQueue>,
    registrations: Arc<dyn RegistrationStore>,
    credentials: Option<Arc<dyn CredentialStore>>,
    sessions: Option<Arc<dyn SessionLookup>>,
    config: RwLock<PushConfig>,
    trigger: OnceLock<Weak<dyn RescheduleTrigger>>,
    shutdown: ShutdownSignal,
}

impl PushManagerRegistry {
    pub fn new(
        config: PushConfig,
        job_queue: Arc<dyn JobQueue>,
        registrations: Arc<dyn RegistrationStore>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            backends: DashMap::new(),
            initial: Mutex::new(InitialPushUsers::default()),
            job_queue,
            registrations,
            credentials: None,
            sessions: None,
            config: RwLock::new(config),
            trigger: OnceLock::new(),
            shutdown,
        }
    }

    pub fn with_credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<dyn SessionLookup>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Connect the rescheduler that deferred registrations are handed to.
    /// Only the first call has an effect.
    pub fn set_reschedule_trigger(&self, trigger: Weak<dyn RescheduleTrigger>) {
        if self.trigger.set(trigger).is_err() {
            tracing::warn!("Reschedule trigger already set, ignoring");
        }
    }

    pub async fn config(&self) -> PushConfig {
        self.config.read().await.clone()
    }

    pub async fn update_config(&self, config: PushConfig) {
        *self.config.write().await = config;
        tracing::info!("Push registry configuration updated");
    }

    // ========================================================================
    // Backends
    // ========================================================================

    /// Register a backend. Returns false if a backend with the same id exists.
    ///
    /// An extended backend immediately starts listeners for the push users
    /// already assigned to this node.
    pub async fn add_backend(&self, backend: PushBackend) -> bool {
        let backend = Arc::new(backend);
        match self.backends.entry(backend.id().to_string()) {
            Entry::Occupied(_) => {
                tracing::warn!(backend = %backend.id(), "Backend already registered");
                return false;
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&backend));
            }
        }

        tracing::info!(
            backend = %backend.id(),
            extended = backend.extended_capability().is_some(),
            capable = backend.is_capable(),
            "Push backend added"
        );

        if backend.permanent_capability().is_some() {
            let users = self.tracked_push_users().await;
            if !users.is_empty() {
                let started = self
                    .start_permanent_listeners(&users, std::slice::from_ref(&backend))
                    .await;
                tracing::info!(
                    backend = %backend.id(),
                    started = started.len(),
                    "Started permanent listeners on newly added backend"
                );
            }
        }

        true
    }

    /// Unregister a backend. Its permanent listeners are stopped and handed to
    /// the remaining permanent-capable backends.
    pub async fn remove_backend(&self, backend_id: &str) -> bool {
        let Some((_, backend)) = self.backends.remove(backend_id) else {
            return false;
        };
        tracing::info!(backend = %backend_id, "Push backend removed");

        let Some(capability) = backend.extended_capability() else {
            return true;
        };

        let owned: Vec<PushUser> = self
            .job_queue
            .jobs()
            .into_iter()
            .filter(|job| job.backend_id() == backend_id)
            .map(|job| job.push_user().clone())
            .collect();

        for push_user in &owned {
            if let Err(e) = capability
                .service
                .stop_permanent_listener(push_user, false)
                .await
            {
                tracing::warn!(
                    backend = %backend_id,
                    push_user = %push_user,
                    error = %e,
                    "Failed to stop permanent listener of removed backend"
                );
            }
            self.job_queue.cancel_job(push_user);
        }

        let remaining = self.permanent_backends();
        if !owned.is_empty() && !remaining.is_empty() {
            let tracked = self.initial.lock().await.users.clone();
            let takeover: Vec<_> = owned.into_iter().filter(|u| tracked.contains(u)).collect();
            self.start_permanent_listeners(&takeover, &remaining).await;
        }
        self.refresh_gauges();

        true
    }

    pub fn backend_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.backends.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Whether this node runs a backend whose permanent listeners need
    /// resources, i.e. whether it is a capable cluster member
    pub fn has_capable_backend(&self) -> bool {
        self.backends.iter().any(|e| e.value().is_capable())
    }

    fn backends_sorted(&self) -> Vec<Arc<PushBackend>> {
        let mut backends: Vec<_> = self.backends.iter().map(|e| Arc::clone(e.value())).collect();
        backends.sort_by(|a, b| a.id().cmp(b.id()));
        backends
    }

    fn extended_backends(&self) -> Vec<Arc<PushBackend>> {
        self.backends_sorted()
            .into_iter()
            .filter(|b| b.extended_capability().is_some())
            .collect()
    }

    fn permanent_backends(&self) -> Vec<Arc<PushBackend>> {
        self.backends_sorted()
            .into_iter()
            .filter(|b| b.permanent_capability().is_some())
            .collect()
    }

    // ========================================================================
    // Registrations
    // ========================================================================

    /// Register a permanent listener for the session's user and client.
    ///
    /// A new registration starts the listener right away on every extended
    /// backend, unless reschedule-on-registration applies to the user, in
    /// which case the cluster rescheduler decides where it runs.
    #[tracing::instrument(
        skip(self, session),
        fields(user_id = session.user_id, context_id = session.context_id)
    )]
    pub async fn register_permanent_listener(
        &self,
        session: &Session,
        client_id: &str,
    ) -> Result<RegistrationResult, PushError> {
        let config = self.config().await;
        if let Err(denial) = check_access(session, client_id, &config, true) {
            tracing::info!(client = %client_id, reason = %denial, "Permanent listener registration denied");
            return Ok(RegistrationResult::Denied(denial));
        }
        if self.shutdown.is_shutting_down() {
            return Err(PushError::ShuttingDown);
        }

        let push_user = PushUser::from_session(session);
        let inserted = self.registrations.insert(&push_user, client_id).await?;
        self.store_session_credentials(session).await;

        if !inserted {
            tracing::debug!(push_user = %push_user, client = %client_id, "Permanent listener already registered");
            return Ok(RegistrationResult::AlreadyRegistered);
        }

        tracing::info!(push_user = %push_user, client = %client_id, "Permanent listener registered");

        if config.reschedule_on_registration_for(&push_user)
            && self.request_reschedule("permanent listener registered").await
        {
            return Ok(RegistrationResult::Registered);
        }

        self.initial.lock().await.users.insert(push_user.clone());
        self.start_permanent_listeners(std::slice::from_ref(&push_user), &self.permanent_backends())
            .await;
        self.refresh_gauges();

        Ok(RegistrationResult::Registered)
    }

    /// Remove one permanent listener registration of the session's user.
    ///
    /// Removing the last registration stops the user's listener and deletes
    /// stored credentials.
    #[tracing::instrument(
        skip(self, session),
        fields(user_id = session.user_id, context_id = session.context_id)
    )]
    pub async fn unregister_permanent_listener(
        &self,
        session: &Session,
        client_id: &str,
    ) -> Result<UnregistrationResult, PushError> {
        let config = self.config().await;
        if let Err(denial) = check_access(session, client_id, &config, false) {
            tracing::info!(client = %client_id, reason = %denial, "Permanent listener unregistration denied");
            return Ok(UnregistrationResult::Denied(denial));
        }

        let push_user = PushUser::from_session(session);
        match self.registrations.delete(&push_user, client_id).await? {
            DeleteOutcome::NotFound => Ok(UnregistrationResult::NotRegistered),
            DeleteOutcome::OtherRemaining => {
                tracing::debug!(push_user = %push_user, client = %client_id, "Registration removed, others remain");
                Ok(UnregistrationResult::OtherRemaining)
            }
            DeleteOutcome::LastRemoved => {
                tracing::info!(push_user = %push_user, client = %client_id, "Last permanent listener registration removed");
                self.release_push_user(&push_user, &config).await;
                Ok(UnregistrationResult::LastRemoved)
            }
        }
    }

    /// Remove every registration of a user. Returns the number removed.
    pub async fn unregister_all_for_user(&self, push_user: &PushUser) -> Result<u64, PushError> {
        let removed = self.registrations.delete_all(push_user).await?;
        if removed > 0 {
            tracing::info!(push_user = %push_user, removed = removed, "All permanent listener registrations removed");
            let config = self.config().await;
            self.release_push_user(push_user, &config).await;
        }
        Ok(removed)
    }

    /// Push users having at least one persisted registration, sorted
    pub async fn users_with_permanent_listeners(&self) -> Result<Vec<PushUser>, PushError> {
        Ok(self.registrations.list_push_users().await?)
    }

    async fn release_push_user(&self, push_user: &PushUser, config: &PushConfig) {
        self.initial.lock().await.users.remove(push_user);
        self.stop_permanent_listeners(std::slice::from_ref(push_user), &self.extended_backends())
            .await;
        self.delete_credentials(push_user).await;
        self.refresh_gauges();

        if config.reschedule_on_registration_for(push_user) {
            self.request_reschedule("permanent listener unregistered").await;
        }
    }

    /// Hand a remote plan to the rescheduler. Returns false if none is wired
    /// or the plan was refused.
    async fn request_reschedule(&self, reason: &str) -> bool {
        match self.trigger.get().and_then(Weak::upgrade) {
            Some(trigger) => {
                let planned = trigger.plan_reschedule(true, reason).await;
                if !planned {
                    tracing::debug!(reason = %reason, "Reschedule refused, handling locally");
                }
                planned
            }
            None => {
                tracing::debug!(reason = %reason, "No rescheduler available, handling locally");
                false
            }
        }
    }

    // ========================================================================
    // Permanent listener reconciliation
    // ========================================================================

    /// Make the push users assigned to this node equal to `desired`.
    ///
    /// The delta against the currently tracked set is computed under the
    /// registry lock; backend calls run outside of it. Users no longer
    /// assigned are stopped on every extended backend, then after `park` the
    /// newly assigned users are started. `authoritative` marks that this node
    /// has completed a full start-up.
    ///
    /// Not cancel-safe: the tracked set is committed before any backend call,
    /// so dropping the future midway leaves users tracked but not running.
    ///
    /// Never fails: backend errors are logged per backend and user.
    #[tracing::instrument(skip(self, desired), fields(desired = desired.len()))]
    pub async fn apply_initial_listeners(
        &self,
        desired: Vec<PushUser>,
        authoritative: bool,
        park: Duration,
    ) -> Vec<PermanentListenerJob> {
        let desired: HashSet<PushUser> = desired.into_iter().collect();

        let (to_stop, to_start) = {
            let mut initial = self.initial.lock().await;
            let mut to_stop: Vec<_> = initial.users.difference(&desired).cloned().collect();
            let mut to_start: Vec<_> = desired.difference(&initial.users).cloned().collect();
            to_stop.sort();
            to_start.sort();

            initial.users = desired;
            if authoritative {
                initial.all_started = true;
            }
            ListenerMetrics::set_tracked(initial.users.len());
            (to_stop, to_start)
        };

        tracing::debug!(
            to_stop = to_stop.len(),
            to_start = to_start.len(),
            authoritative = authoritative,
            "Applying initial permanent listeners"
        );

        let stopped = if to_stop.is_empty() {
            Vec::new()
        } else {
            self.stop_permanent_listeners(&to_stop, &self.extended_backends())
                .await
        };

        if !stopped.is_empty() && !park.is_zero() && !to_start.is_empty() {
            tokio::time::sleep(park).await;
        }

        let started = if to_start.is_empty() {
            Vec::new()
        } else {
            self.start_permanent_listeners(&to_start, &self.permanent_backends())
                .await
        };
        self.refresh_gauges();

        if !stopped.is_empty() || !started.is_empty() {
            tracing::info!(
                stopped = stopped.len(),
                started = started.len(),
                "Permanent listeners reconciled"
            );
        }

        started
    }

    /// Stop every permanent listener running on this node and forget the
    /// assigned push users. Returns the number of users stopped.
    pub async fn stop_all_permanent_listeners(&self) -> usize {
        let tracked: Vec<PushUser> = self.initial.lock().await.users.drain().collect();
        let users: BTreeSet<PushUser> = tracked
            .into_iter()
            .chain(self.job_queue.jobs().into_iter().map(|j| j.push_user().clone()))
            .collect();
        let users: Vec<_> = users.into_iter().collect();

        let stopped = self
            .stop_permanent_listeners(&users, &self.extended_backends())
            .await;
        ListenerMetrics::set_tracked(0);
        self.refresh_gauges();

        tracing::info!(stopped = stopped.len(), "Stopped all permanent listeners");
        stopped.len()
    }

    /// Stop the listeners of the given users if they run here, and stop
    /// tracking them. Returns the number of users stopped.
    pub async fn drop_permanent_listeners(&self, users: &[PushUser]) -> usize {
        let affected: Vec<PushUser> = {
            let mut initial = self.initial.lock().await;
            let mut affected: Vec<_> = users
                .iter()
                .filter(|u| initial.users.remove(*u) || self.job_queue.job(u).is_some())
                .cloned()
                .collect();
            affected.sort();
            affected.dedup();
            ListenerMetrics::set_tracked(initial.users.len());
            affected
        };

        if affected.is_empty() {
            return 0;
        }

        let stopped = self
            .stop_permanent_listeners(&affected, &self.extended_backends())
            .await;
        self.refresh_gauges();

        tracing::info!(
            requested = users.len(),
            stopped = stopped.len(),
            "Dropped permanent listeners owned elsewhere"
        );
        stopped.len()
    }

    /// Start permanent listeners for `users` on each backend in turn.
    /// Returns the started jobs, sorted.
    async fn start_permanent_listeners(
        &self,
        users: &[PushUser],
        backends: &[Arc<PushBackend>],
    ) -> Vec<PermanentListenerJob> {
        let mut started = Vec::new();

        'users: for push_user in users {
            for backend in backends {
                if self.shutdown.is_shutting_down() {
                    tracing::info!("Shutdown in progress, aborting permanent listener start");
                    break 'users;
                }

                match self.job_queue.schedule_job(push_user, backend).await {
                    Ok(Some(job)) => {
                        ListenerMetrics::record_started();
                        started.push(job);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        if let LoopControl::Abort = self.on_backend_error(push_user, backend, "start", e).await {
                            break 'users;
                        }
                    }
                }
            }
        }

        started.sort();
        started
    }

    /// Stop permanent listeners for `users` on every given backend and cancel
    /// their jobs. Returns the users for which something was stopped.
    async fn stop_permanent_listeners(
        &self,
        users: &[PushUser],
        backends: &[Arc<PushBackend>],
    ) -> Vec<PushUser> {
        let mut stopped = Vec::new();

        'users: for push_user in users {
            let mut any = false;
            for backend in backends {
                if self.shutdown.is_shutting_down() {
                    tracing::info!("Shutdown in progress, aborting permanent listener stop");
                    break 'users;
                }
                let Some(capability) = backend.extended_capability() else {
                    continue;
                };

                match capability
                    .service
                    .stop_permanent_listener(push_user, false)
                    .await
                {
                    Ok(true) => {
                        ListenerMetrics::record_stopped();
                        any = true;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        if let LoopControl::Abort = self.on_backend_error(push_user, backend, "stop", e).await {
                            break 'users;
                        }
                    }
                }
            }

            if self.job_queue.cancel_job(push_user) || any {
                stopped.push(push_user.clone());
            }
        }

        stopped
    }

    async fn on_backend_error(
        &self,
        push_user: &PushUser,
        backend: &PushBackend,
        operation: &str,
        error: BackendError,
    ) -> LoopControl {
        match error {
            BackendError::ShuttingDown => {
                ListenerMetrics::record_backend_error("shutdown");
                tracing::info!(
                    backend = %backend.id(),
                    operation = %operation,
                    "Backend shutting down, aborting bulk operation"
                );
                LoopControl::Abort
            }
            BackendError::InvalidCredentials(cause) => {
                ListenerMetrics::record_backend_error("credentials");
                self.handle_invalid_credentials(push_user, true, &cause).await;
                LoopControl::Continue
            }
            BackendError::Failed(cause) => {
                ListenerMetrics::record_backend_error("failed");
                ListenerMetrics::record_failed(operation);
                tracing::warn!(
                    backend = %backend.id(),
                    push_user = %push_user,
                    operation = %operation,
                    error = %cause,
                    "Permanent listener operation failed"
                );
                LoopControl::Continue
            }
        }
    }

    /// Whether an authoritative assignment has been applied on this node
    pub async fn all_users_started(&self) -> bool {
        self.initial.lock().await.all_started
    }

    /// Push users currently assigned to this node, sorted
    pub async fn tracked_push_users(&self) -> Vec<PushUser> {
        let mut users: Vec<_> = self.initial.lock().await.users.iter().cloned().collect();
        users.sort();
        users
    }

    pub fn running_jobs(&self) -> Vec<PermanentListenerJob> {
        self.job_queue.jobs()
    }

    /// Push users the extended backends report as running, merged and
    /// sorted. A backend that fails to answer is logged and skipped.
    pub async fn available_push_users(&self) -> Vec<PushUser> {
        let mut users = BTreeSet::new();
        for backend in self.extended_backends() {
            let Some(capability) = backend.extended_capability() else {
                continue;
            };
            match capability.service.available_push_users().await {
                Ok(available) => users.extend(available),
                Err(e) => {
                    ListenerMetrics::record_backend_error("listing");
                    tracing::warn!(
                        backend = %backend.id(),
                        error = %e,
                        "Failed to list available push users"
                    );
                }
            }
        }
        users.into_iter().collect()
    }

    fn refresh_gauges(&self) {
        ListenerMetrics::set_running(self.job_queue.jobs().len());
    }

    // ========================================================================
    // Ephemeral listeners
    // ========================================================================

    /// Start an ephemeral listener for the session. The first backend that
    /// claims the session wins.
    pub async fn start_listener(&self, session: &Session) -> Option<PushListener> {
        if !self.ephemeral_allowed(session).await {
            return None;
        }

        for backend in self.backends_sorted() {
            match backend.service().start_listener(session).await {
                Ok(Some(listener)) => {
                    tracing::debug!(
                        backend = %backend.id(),
                        session_id = %session.session_id,
                        "Ephemeral listener started"
                    );
                    return Some(listener);
                }
                Ok(None) => {}
                Err(BackendError::ShuttingDown) => return None,
                Err(e) => {
                    tracing::warn!(
                        backend = %backend.id(),
                        session_id = %session.session_id,
                        error = %e,
                        "Failed to start ephemeral listener"
                    );
                }
            }
        }

        None
    }

    /// Stop the ephemeral listener of the session. Returns whether a backend
    /// stopped one.
    pub async fn stop_listener(&self, session: &Session) -> bool {
        if !self.ephemeral_allowed(session).await {
            return false;
        }

        for backend in self.backends_sorted() {
            match backend.service().stop_listener(session).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(BackendError::ShuttingDown) => return false,
                Err(e) => {
                    tracing::warn!(
                        backend = %backend.id(),
                        session_id = %session.session_id,
                        error = %e,
                        "Failed to stop ephemeral listener"
                    );
                }
            }
        }

        false
    }

    async fn ephemeral_allowed(&self, session: &Session) -> bool {
        let client = session.client.as_deref().unwrap_or_default();
        let config = self.config.read().await;
        match check_access(session, client, &config, false) {
            Ok(()) => true,
            Err(denial) => {
                tracing::info!(
                    user_id = session.user_id,
                    context_id = session.context_id,
                    reason = %denial,
                    "Ephemeral listener request denied"
                );
                false
            }
        }
    }

    // ========================================================================
    // Credentials
    // ========================================================================

    /// React to a backend rejecting a user's credentials.
    ///
    /// With `try_restore`, fresh credentials are taken from a live session of
    /// the user; without one (or without `try_restore`) the stored
    /// credentials are deleted. Best-effort: failures are only logged.
    pub async fn handle_invalid_credentials(
        &self,
        push_user: &PushUser,
        try_restore: bool,
        cause: &str,
    ) {
        tracing::info!(
            push_user = %push_user,
            try_restore = try_restore,
            cause = %cause,
            "Backend rejected credentials"
        );

        if try_restore {
            if let Some(sessions) = &self.sessions {
                let restored = sessions
                    .find_session(push_user)
                    .await
                    .and_then(|s| s.credentials());
                if let Some(credentials) = restored {
                    if let Some(store) = &self.credentials {
                        match store.store(&credentials).await {
                            Ok(()) => {
                                tracing::info!(push_user = %push_user, "Credentials restored from live session");
                            }
                            Err(e) => {
                                tracing::warn!(push_user = %push_user, error = %e, "Failed to restore credentials");
                            }
                        }
                    }
                    return;
                }
            }
        }

        self.delete_credentials(push_user).await;
    }

    async fn store_session_credentials(&self, session: &Session) {
        let (Some(store), Some(credentials)) = (&self.credentials, session.credentials()) else {
            return;
        };
        if let Err(e) = store.store(&credentials).await {
            tracing::warn!(
                user_id = session.user_id,
                context_id = session.context_id,
                error = %e,
                "Failed to store push credentials"
            );
        }
    }

    async fn delete_credentials(&self, push_user: &PushUser) {
        let Some(store) = &self.credentials else {
            return;
        };
        match store.delete(push_user.user_id, push_user.context_id).await {
            Ok(true) => tracing::debug!(push_user = %push_user, "Push credentials deleted"),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(push_user = %push_user, error = %e, "Failed to delete push credentials");
            }
        }
    }
}
