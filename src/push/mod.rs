//! Push listener domain
//!
//! - `types`: push users, sessions, credentials, listeners and jobs
//! - `backend`: the backend capability interface
//! - `job_queue`: per-process bookkeeping of running permanent listeners
//! - `registry`: the push manager registry
//! - `store`: registration and credential stores

mod access;
mod backend;
mod job_queue;
mod memory_backend;
mod registry;
pub mod store;
mod types;

pub use access::{check_access, AccessDenial};
pub use backend::{
    BackendError, ExtendedCapability, PermanentListenerService, PushBackend, PushManagerService,
};
pub use job_queue::{JobQueue, LocalJobQueue};
pub use memory_backend::{MemoryBackendOptions, MemoryPushBackend};
pub use registry::{PushManagerRegistry, RegistrationResult, UnregistrationResult};
pub use store::{
    CredentialStore, DeleteOutcome, RegistrationStore, SessionLookup, StoreBackend, StoreError,
};
pub use types::{Credentials, PermanentListenerJob, PushListener, PushUser, Session};

use async_trait::async_trait;

/// Receiver of reschedule requests raised by the registry
#[async_trait]
pub trait RescheduleTrigger: Send + Sync {
    /// Returns false if the plan was refused and the caller must handle the
    /// change locally
    async fn plan_reschedule(&self, remote: bool, reason: &str) -> bool;
}
