//! Registration and credential stores
//!
//! Registrations are the source of truth for which push users need a
//! permanent listener somewhere in the cluster. They live in PostgreSQL when a
//! database is configured and in memory otherwise. Credentials live in Redis
//! in cluster mode so every member can start a listener for any user.

mod factory;
mod memory;
mod postgres;
mod redis;
mod traits;

pub use factory::{create_credential_store, create_registration_store};
pub use memory::{MemoryCredentialStore, MemoryRegistrationStore, MemorySessionDirectory};
pub use postgres::PostgresRegistrationStore;
pub use redis::RedisCredentialStore;
pub use traits::{
    CredentialStore, DeleteOutcome, RegistrationStore, SessionLookup, StoreBackend, StoreError,
};
