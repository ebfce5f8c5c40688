//! Redis-backed credential store.
//!
//! Each user's credentials live in one hash at
//! `{prefix}:credentials:{context_id}:{user_id}` with the fields `login` and
//! `password`.

use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;

use super::traits::{CredentialStore, StoreBackend, StoreError};
use crate::push::types::Credentials;
use crate::redis::{PoolError, RedisPool};

pub struct RedisCredentialStore {
    pool: Arc<RedisPool>,
}

impl RedisCredentialStore {
    pub fn new(pool: Arc<RedisPool>) -> Self {
        Self { pool }
    }

    fn key(&self, user_id: i32, context_id: i32) -> String {
        format!(
            "{}:credentials:{}:{}",
            self.pool.key_prefix(),
            context_id,
            user_id
        )
    }
}

impl From<PoolError> for StoreError {
    fn from(e: PoolError) -> Self {
        StoreError::Redis(e.to_string())
    }
}

#[async_trait]
impl CredentialStore for RedisCredentialStore {
    fn backend_type(&self) -> StoreBackend {
        StoreBackend::Redis
    }

    async fn get(&self, user_id: i32, context_id: i32) -> Result<Option<Credentials>, StoreError> {
        let key = self.key(user_id, context_id);
        let fields: Vec<(String, String)> = self
            .pool
            .execute(|mut conn| async move { conn.hgetall(&key).await })
            .await?;

        let mut login = None;
        let mut password = None;
        for (field, value) in fields {
            match field.as_str() {
                "login" => login = Some(value),
                "password" => password = Some(value),
                _ => {}
            }
        }

        Ok(match (login, password) {
            (Some(login), Some(password)) => Some(Credentials {
                user_id,
                context_id,
                login,
                password,
            }),
            _ => None,
        })
    }

    async fn store(&self, credentials: &Credentials) -> Result<(), StoreError> {
        let key = self.key(credentials.user_id, credentials.context_id);
        let fields = [
            ("login", credentials.login.clone()),
            ("password", credentials.password.clone()),
        ];
        self.pool
            .execute(|mut conn| async move { conn.hset_multiple::<_, _, _, ()>(&key, &fields).await })
            .await?;
        Ok(())
    }

    async fn delete(&self, user_id: i32, context_id: i32) -> Result<bool, StoreError> {
        let key = self.key(user_id, context_id);
        let removed: i64 = self
            .pool
            .execute(|mut conn| async move { conn.del(&key).await })
            .await?;
        Ok(removed > 0)
    }
}
