//! In-memory push backend.
//!
//! Keeps listener state in `DashMap`s without contacting any notification
//! source. Used for staging deployments (enable it with
//! `push.memory_backend.enabled`) and throughout the test suites, where its
//! call counters and failure switches make backend behaviour observable.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::Deserialize;

use super::backend::{
    BackendError, ExtendedCapability, PermanentListenerService, PushBackend, PushManagerService,
};
use super::types::{PushListener, PushUser, Session};

/// Capability switches of a memory backend
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryBackendOptions {
    #[serde(default = "default_true")]
    pub extended: bool,
    #[serde(default = "default_true")]
    pub supports_permanent_listeners: bool,
    #[serde(default = "default_true")]
    pub listeners_require_resources: bool,
}

fn default_true() -> bool {
    true
}

impl Default for MemoryBackendOptions {
    fn default() -> Self {
        Self {
            extended: true,
            supports_permanent_listeners: true,
            listeners_require_resources: true,
        }
    }
}

pub struct MemoryPushBackend {
    id: String,
    options: MemoryBackendOptions,
    /// Running permanent listeners
    permanent: DashMap<PushUser, DateTime<Utc>>,
    /// session id -> ephemeral listener
    ephemeral: DashMap<String, PushListener>,
    failing: DashSet<PushUser>,
    rejected_credentials: DashSet<PushUser>,
    start_calls: DashMap<PushUser, usize>,
    stop_calls: DashMap<PushUser, usize>,
}

impl MemoryPushBackend {
    /// Extended backend whose listeners require resources
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Self::with_options(id, MemoryBackendOptions::default())
    }

    /// Backend without the extended capability
    pub fn basic(id: impl Into<String>) -> Arc<Self> {
        Self::with_options(
            id,
            MemoryBackendOptions {
                extended: false,
                supports_permanent_listeners: false,
                listeners_require_resources: false,
            },
        )
    }

    pub fn with_options(id: impl Into<String>, options: MemoryBackendOptions) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            options,
            permanent: DashMap::new(),
            ephemeral: DashMap::new(),
            failing: DashSet::new(),
            rejected_credentials: DashSet::new(),
            start_calls: DashMap::new(),
            stop_calls: DashMap::new(),
        })
    }

    /// Descriptor to register with the registry
    pub fn descriptor(self: &Arc<Self>) -> PushBackend {
        let service: Arc<dyn PushManagerService> = self.clone();
        if !self.options.extended {
            return PushBackend::basic(self.id.clone(), service);
        }

        PushBackend::extended(
            self.id.clone(),
            service,
            ExtendedCapability {
                service: self.clone(),
                supports_permanent_listeners: self.options.supports_permanent_listeners,
                listeners_require_resources: self.options.listeners_require_resources,
            },
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Push users with a running permanent listener, sorted
    pub fn active_users(&self) -> Vec<PushUser> {
        let mut users: Vec<_> = self.permanent.iter().map(|e| e.key().clone()).collect();
        users.sort();
        users
    }

    pub fn is_running(&self, push_user: &PushUser) -> bool {
        self.permanent.contains_key(push_user)
    }

    pub fn ephemeral_count(&self) -> usize {
        self.ephemeral.len()
    }

    /// Make every start for the user fail with a backend error
    pub fn fail_starts_for(&self, push_user: PushUser) {
        self.failing.insert(push_user);
    }

    /// Make every start for the user fail with an authentication error
    pub fn reject_credentials_for(&self, push_user: PushUser) {
        self.rejected_credentials.insert(push_user);
    }

    /// Users a permanent start was requested for since the last reset, sorted
    pub fn started_users(&self) -> Vec<PushUser> {
        Self::keys_sorted(&self.start_calls)
    }

    /// Users a permanent stop was requested for since the last reset, sorted
    pub fn stopped_users(&self) -> Vec<PushUser> {
        Self::keys_sorted(&self.stop_calls)
    }

    pub fn start_count(&self, push_user: &PushUser) -> usize {
        self.start_calls.get(push_user).map(|c| *c).unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        self.start_calls.clear();
        self.stop_calls.clear();
    }

    fn keys_sorted(calls: &DashMap<PushUser, usize>) -> Vec<PushUser> {
        let mut users: Vec<_> = calls.iter().map(|e| e.key().clone()).collect();
        users.sort();
        users
    }
}

#[async_trait]
impl PushManagerService for MemoryPushBackend {
    async fn start_listener(&self, session: &Session) -> Result<Option<PushListener>, BackendError> {
        let push_user = PushUser::from_session(session);
        if self.rejected_credentials.contains(&push_user) {
            return Err(BackendError::InvalidCredentials(format!(
                "{} rejected credentials of {}",
                self.id, push_user
            )));
        }
        if self.ephemeral.contains_key(&session.session_id) {
            return Ok(None);
        }

        let listener = PushListener::new(push_user, self.id.clone());
        self.ephemeral
            .insert(session.session_id.clone(), listener.clone());

        tracing::debug!(
            backend = %self.id,
            session_id = %session.session_id,
            "Ephemeral listener started"
        );
        Ok(Some(listener))
    }

    async fn stop_listener(&self, session: &Session) -> Result<bool, BackendError> {
        Ok(self.ephemeral.remove(&session.session_id).is_some())
    }
}

#[async_trait]
impl PermanentListenerService for MemoryPushBackend {
    async fn start_permanent_listener(&self, push_user: &PushUser) -> Result<bool, BackendError> {
        *self.start_calls.entry(push_user.clone()).or_insert(0) += 1;

        if self.rejected_credentials.contains(push_user) {
            return Err(BackendError::InvalidCredentials(format!(
                "{} rejected credentials of {}",
                self.id, push_user
            )));
        }
        if self.failing.contains(push_user) {
            return Err(BackendError::Failed(format!(
                "{} cannot start listener for {}",
                self.id, push_user
            )));
        }

        let inserted = self.permanent.insert(push_user.clone(), Utc::now()).is_none();
        if inserted {
            tracing::debug!(backend = %self.id, push_user = %push_user, "Permanent listener started");
        }
        Ok(inserted)
    }

    async fn stop_permanent_listener(
        &self,
        push_user: &PushUser,
        _try_reconnect: bool,
    ) -> Result<bool, BackendError> {
        *self.stop_calls.entry(push_user.clone()).or_insert(0) += 1;
        Ok(self.permanent.remove(push_user).is_some())
    }

    async fn available_push_users(&self) -> Result<Vec<PushUser>, BackendError> {
        Ok(self.active_users())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_capabilities() {
        assert!(MemoryPushBackend::new("a").descriptor().is_capable());

        let basic = MemoryPushBackend::basic("b").descriptor();
        assert!(basic.extended_capability().is_none());
        assert!(!basic.is_capable());

        let unconstrained = MemoryPushBackend::with_options(
            "c",
            MemoryBackendOptions {
                listeners_require_resources: false,
                ..Default::default()
            },
        )
        .descriptor();
        assert!(unconstrained.permanent_capability().is_some());
        assert!(!unconstrained.is_capable());
    }

    #[tokio::test]
    async fn test_permanent_start_stop_tracks_calls() {
        let backend = MemoryPushBackend::new("mem");
        let user = PushUser::new(1, 1);

        assert!(backend.start_permanent_listener(&user).await.unwrap());
        assert!(!backend.start_permanent_listener(&user).await.unwrap());
        assert_eq!(backend.start_count(&user), 2);
        assert!(backend.is_running(&user));

        assert!(backend.stop_permanent_listener(&user, false).await.unwrap());
        assert_eq!(backend.stopped_users(), vec![user.clone()]);
        assert!(backend.active_users().is_empty());
    }

    #[tokio::test]
    async fn test_failure_switches() {
        let backend = MemoryPushBackend::new("mem");
        backend.fail_starts_for(PushUser::new(1, 1));
        backend.reject_credentials_for(PushUser::new(2, 1));

        assert!(matches!(
            backend.start_permanent_listener(&PushUser::new(1, 1)).await,
            Err(BackendError::Failed(_))
        ));
        assert!(matches!(
            backend.start_permanent_listener(&PushUser::new(2, 1)).await,
            Err(BackendError::InvalidCredentials(_))
        ));
    }
}
