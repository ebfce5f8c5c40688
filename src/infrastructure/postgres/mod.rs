//! PostgreSQL persistence module.
//!
//! Provides connection pooling for the registration store.

pub mod pool;

pub use pool::{PostgresPool, PostgresPoolError};
