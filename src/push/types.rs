//! Value types shared by the registry, the job queue and the rescheduler.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user that requires continuous delivery of change notifications.
///
/// Identity is `(context_id, user_id)`. The originating session id is carried
/// along for diagnostics and credential repair but never takes part in
/// equality, hashing or ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushUser {
    pub user_id: i32,
    pub context_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl PushUser {
    pub fn new(user_id: i32, context_id: i32) -> Self {
        Self {
            user_id,
            context_id,
            session_id: None,
        }
    }

    pub fn with_session(user_id: i32, context_id: i32, session_id: impl Into<String>) -> Self {
        Self {
            user_id,
            context_id,
            session_id: Some(session_id.into()),
        }
    }

    /// Build the push user a session belongs to
    pub fn from_session(session: &Session) -> Self {
        Self::with_session(session.user_id, session.context_id, session.session_id.clone())
    }
}

impl PartialEq for PushUser {
    fn eq(&self, other: &Self) -> bool {
        self.user_id == other.user_id && self.context_id == other.context_id
    }
}

impl Eq for PushUser {}

impl Hash for PushUser {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.context_id.hash(state);
        self.user_id.hash(state);
    }
}

impl PartialOrd for PushUser {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PushUser {
    fn cmp(&self, other: &Self) -> Ordering {
        self.context_id
            .cmp(&other.context_id)
            .then(self.user_id.cmp(&other.user_id))
    }
}

impl fmt::Display for PushUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.context_id)
    }
}

/// Caller identity for registration and ephemeral listener requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: i32,
    pub context_id: i32,
    /// Client identifier the session was opened with
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub guest: bool,
    /// Whether the account has the mail permission
    #[serde(default = "default_true")]
    pub mail_enabled: bool,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Session {
    pub fn new(user_id: i32, context_id: i32) -> Self {
        Self {
            session_id: Uuid::new_v4().simple().to_string(),
            user_id,
            context_id,
            client: None,
            guest: false,
            mail_enabled: true,
            login: None,
            password: None,
        }
    }

    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }

    pub fn with_credentials(mut self, login: impl Into<String>, password: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self.password = Some(password.into());
        self
    }

    /// Credentials carried by this session, if it has both login and password
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.login, &self.password) {
            (Some(login), Some(password)) => Some(Credentials {
                user_id: self.user_id,
                context_id: self.context_id,
                login: login.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

/// Stored credentials used by permanent listeners to authenticate on behalf
/// of a user that has no live session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user_id: i32,
    pub context_id: i32,
    pub login: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("context_id", &self.context_id)
            .field("login", &self.login)
            .field("password", &"***")
            .finish()
    }
}

/// An ephemeral, session-bound listener handed out by a backend
#[derive(Debug, Clone, Serialize)]
pub struct PushListener {
    pub id: Uuid,
    pub push_user: PushUser,
    pub backend_id: String,
    pub started_at: DateTime<Utc>,
}

impl PushListener {
    pub fn new(push_user: PushUser, backend_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            push_user,
            backend_id: backend_id.into(),
            started_at: Utc::now(),
        }
    }
}

/// A running permanent listener owned by this process.
///
/// Ordered by push user, then backend id, so batches can be logged in a
/// deterministic order.
#[derive(Debug, Clone)]
pub struct PermanentListenerJob {
    push_user: PushUser,
    backend_id: String,
    started_at: DateTime<Utc>,
    cancelled: Arc<AtomicBool>,
}

impl PermanentListenerJob {
    pub fn new(push_user: PushUser, backend_id: impl Into<String>) -> Self {
        Self {
            push_user,
            backend_id: backend_id.into(),
            started_at: Utc::now(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn push_user(&self) -> &PushUser {
        &self.push_user
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Mark the job cancelled. Returns false if it already was.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, AtomicOrdering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }
}

impl PartialEq for PermanentListenerJob {
    fn eq(&self, other: &Self) -> bool {
        self.push_user == other.push_user && self.backend_id == other.backend_id
    }
}

impl Eq for PermanentListenerJob {}

impl PartialOrd for PermanentListenerJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PermanentListenerJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.push_user
            .cmp(&other.push_user)
            .then_with(|| self.backend_id.cmp(&other.backend_id))
    }
}
