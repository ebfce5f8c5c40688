//! Factory functions for creating stores

use std::sync::Arc;

use crate::postgres::PostgresPool;
use crate::redis::RedisPool;

use super::memory::{MemoryCredentialStore, MemoryRegistrationStore};
use super::postgres::PostgresRegistrationStore;
use super::redis::RedisCredentialStore;
use super::traits::{CredentialStore, RegistrationStore};

/// Create the registration store: PostgreSQL if a pool is available,
/// otherwise in memory.
pub async fn create_registration_store(
    postgres_pool: Option<&PostgresPool>,
) -> Arc<dyn RegistrationStore> {
    let Some(pool) = postgres_pool else {
        tracing::info!("No database configured, keeping registrations in memory");
        return Arc::new(MemoryRegistrationStore::new());
    };

    let store = PostgresRegistrationStore::new(pool.pool().clone());
    match store.ensure_schema().await {
        Ok(()) => {
            tracing::info!(
                database = %pool.database_url_masked(),
                "Using PostgreSQL registration store"
            );
            Arc::new(store)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to prepare registration table, falling back to memory store"
            );
            Arc::new(MemoryRegistrationStore::new())
        }
    }
}

/// Create the credential store: Redis if a pool is available, otherwise in
/// memory.
pub fn create_credential_store(redis_pool: Option<Arc<RedisPool>>) -> Arc<dyn CredentialStore> {
    match redis_pool {
        Some(pool) => {
            tracing::info!(prefix = %pool.key_prefix(), "Using Redis credential store");
            Arc::new(RedisCredentialStore::new(pool))
        }
        None => {
            tracing::info!("Redis not available, keeping credentials in memory");
            Arc::new(MemoryCredentialStore::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::store::StoreBackend;

    #[tokio::test]
    async fn test_memory_fallbacks() {
        let registrations = create_registration_store(None).await;
        assert_eq!(registrations.backend_type(), StoreBackend::Memory);

        let credentials = create_credential_store(None);
        assert_eq!(credentials.backend_type(), StoreBackend::Memory);
    }
}
