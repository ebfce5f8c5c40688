//! Store trait definitions

use async_trait::async_trait;
use thiserror::Error;

use crate::push::types::{Credentials, PushUser, Session};

/// Error type for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result of deleting one permanent-listener registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The last registration of the user was removed
    LastRemoved,
    /// One registration was removed; others of the same user remain
    OtherRemaining,
    /// Nothing matched
    NotFound,
}

/// Backend type of a store, for health reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres,
    Redis,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres => "postgres",
            Self::Redis => "redis",
        }
    }
}

/// Persistent permanent-listener registrations, the source of truth for
/// which push users need a permanent listener somewhere in the cluster.
#[async_trait]
pub trait RegistrationStore: Send + Sync {
    fn backend_type(&self) -> StoreBackend;

    /// Insert a registration. Returns false if it already existed.
    async fn insert(&self, push_user: &PushUser, client_id: &str) -> Result<bool, StoreError>;

    /// Delete one registration
    async fn delete(&self, push_user: &PushUser, client_id: &str)
        -> Result<DeleteOutcome, StoreError>;

    /// Delete all registrations of a user. Returns the number removed.
    async fn delete_all(&self, push_user: &PushUser) -> Result<u64, StoreError>;

    /// Distinct push users having at least one registration, sorted
    async fn list_push_users(&self) -> Result<Vec<PushUser>, StoreError>;

    /// Whether the user has at least one registration
    async fn exists(&self, push_user: &PushUser) -> Result<bool, StoreError>;
}

/// Credentials used by permanent listeners
#[async_trait]
pub trait CredentialStore: Send + Sync {
    fn backend_type(&self) -> StoreBackend;

    async fn get(&self, user_id: i32, context_id: i32) -> Result<Option<Credentials>, StoreError>;

    async fn store(&self, credentials: &Credentials) -> Result<(), StoreError>;

    /// Returns whether anything was deleted
    async fn delete(&self, user_id: i32, context_id: i32) -> Result<bool, StoreError>;
}

/// Lookup of live sessions, used to repair credentials
#[async_trait]
pub trait SessionLookup: Send + Sync {
    async fn find_session(&self, push_user: &PushUser) -> Option<Session>;
}
