//! Backend capability interface.
//!
//! A backend creates listeners against one notification source. Every backend
//! can serve ephemeral, session-bound listeners. Some backends additionally
//! carry an [`ExtendedCapability`] that allows long-lived permanent listeners
//! independent of any session. The registry filters on the presence of that
//! capability rather than inspecting concrete types.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::types::{PushListener, PushUser, Session};

/// Errors reported by a backend.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The backend rejected the stored or session credentials
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The backend (or the process) is shutting down
    #[error("Backend is shutting down")]
    ShuttingDown,

    /// Any other backend-specific failure
    #[error("Backend error: {0}")]
    Failed(String),
}

/// Operations every backend provides.
#[async_trait]
pub trait PushManagerService: Send + Sync {
    /// Start an ephemeral listener for the session, or `None` if this backend
    /// does not serve it.
    async fn start_listener(&self, session: &Session) -> Result<Option<PushListener>, BackendError>;

    /// Stop the ephemeral listener of the session. Returns whether one was stopped.
    async fn stop_listener(&self, session: &Session) -> Result<bool, BackendError>;
}

/// Operations of backends that support permanent listeners.
#[async_trait]
pub trait PermanentListenerService: Send + Sync {
    /// Start a permanent listener. Returns false if none was started.
    async fn start_permanent_listener(&self, push_user: &PushUser) -> Result<bool, BackendError>;

    /// Stop a permanent listener. `try_reconnect` asks the backend to hand the
    /// user over to a session-bound listener if one is possible.
    async fn stop_permanent_listener(
        &self,
        push_user: &PushUser,
        try_reconnect: bool,
    ) -> Result<bool, BackendError>;

    /// Push users this backend currently runs permanent listeners for
    async fn available_push_users(&self) -> Result<Vec<PushUser>, BackendError>;
}

/// Permanent-listener capability attached to a backend descriptor
#[derive(Clone)]
pub struct ExtendedCapability {
    pub service: Arc<dyn PermanentListenerService>,
    pub supports_permanent_listeners: bool,
    /// Whether each permanent listener holds a scarce external resource
    /// (e.g. a connection to a mail server)
    pub listeners_require_resources: bool,
}

/// A registered backend: identity, basic service and optional extended capability
#[derive(Clone)]
pub struct PushBackend {
    id: String,
    service: Arc<dyn PushManagerService>,
    extended: Option<ExtendedCapability>,
}

impl PushBackend {
    /// A backend that only serves ephemeral listeners
    pub fn basic(id: impl Into<String>, service: Arc<dyn PushManagerService>) -> Self {
        Self {
            id: id.into(),
            service,
            extended: None,
        }
    }

    /// A backend that also supports permanent listeners
    pub fn extended(
        id: impl Into<String>,
        service: Arc<dyn PushManagerService>,
        capability: ExtendedCapability,
    ) -> Self {
        Self {
            id: id.into(),
            service,
            extended: Some(capability),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn service(&self) -> &Arc<dyn PushManagerService> {
        &self.service
    }

    pub fn extended_capability(&self) -> Option<&ExtendedCapability> {
        self.extended.as_ref()
    }

    /// Extended capability, only if it can actually run permanent listeners
    pub fn permanent_capability(&self) -> Option<&ExtendedCapability> {
        self.extended
            .as_ref()
            .filter(|c| c.supports_permanent_listeners)
    }

    /// Whether this backend makes its node a capable cluster member
    pub fn is_capable(&self) -> bool {
        self.permanent_capability()
            .map(|c| c.listeners_require_resources)
            .unwrap_or(false)
    }
}

impl fmt::Debug for PushBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushBackend")
            .field("id", &self.id)
            .field("extended", &self.extended.is_some())
            .field(
                "supports_permanent_listeners",
                &self.permanent_capability().is_some(),
            )
            .field("capable", &self.is_capable())
            .finish()
    }
}
