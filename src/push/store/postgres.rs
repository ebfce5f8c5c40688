//! PostgreSQL-backed registration store.
//!
//! Table structure (created by [`PostgresRegistrationStore::ensure_schema`]):
//! - `push_registrations (cid, user_id, client, created_at)` with the primary
//!   key `(cid, user_id, client)`

use async_trait::async_trait;
use sqlx::PgPool;

use super::traits::{DeleteOutcome, RegistrationStore, StoreBackend, StoreError};
use crate::push::types::PushUser;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS push_registrations (
    cid INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    client VARCHAR(64) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (cid, user_id, client)
)
"#;

pub struct PostgresRegistrationStore {
    pool: PgPool,
}

impl PostgresRegistrationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the registration table if it does not exist yet
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        tracing::debug!("push_registrations table ensured");
        Ok(())
    }
}

#[async_trait]
impl RegistrationStore for PostgresRegistrationStore {
    fn backend_type(&self) -> StoreBackend {
        StoreBackend::Postgres
    }

    async fn insert(&self, push_user: &PushUser, client_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO push_registrations (cid, user_id, client)
            VALUES ($1, $2, $3)
            ON CONFLICT (cid, user_id, client) DO NOTHING
            "#,
        )
        .bind(push_user.context_id)
        .bind(push_user.user_id)
        .bind(client_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(
        &self,
        push_user: &PushUser,
        client_id: &str,
    ) -> Result<DeleteOutcome, StoreError> {
        // The outer SELECT sees the snapshot taken before the DELETE, so the
        // remaining count is `before - deleted`.
        let (deleted, before): (i64, i64) = sqlx::query_as(
            r#"
            WITH deleted AS (
                DELETE FROM push_registrations
                WHERE cid = $1 AND user_id = $2 AND client = $3
                RETURNING 1
            )
            SELECT
                (SELECT COUNT(*) FROM deleted) AS deleted,
                (SELECT COUNT(*) FROM push_registrations WHERE cid = $1 AND user_id = $2) AS before
            "#,
        )
        .bind(push_user.context_id)
        .bind(push_user.user_id)
        .bind(client_id)
        .fetch_one(&self.pool)
        .await?;

        let outcome = match (deleted, before - deleted) {
            (0, _) => DeleteOutcome::NotFound,
            (_, 0) => DeleteOutcome::LastRemoved,
            _ => DeleteOutcome::OtherRemaining,
        };

        tracing::trace!(
            push_user = %push_user,
            client = %client_id,
            outcome = ?outcome,
            "Registration deleted from PostgreSQL"
        );

        Ok(outcome)
    }

    async fn delete_all(&self, push_user: &PushUser) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM push_registrations WHERE cid = $1 AND user_id = $2")
            .bind(push_user.context_id)
            .bind(push_user.user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn list_push_users(&self) -> Result<Vec<PushUser>, StoreError> {
        let rows: Vec<(i32, i32)> = sqlx::query_as(
            "SELECT DISTINCT cid, user_id FROM push_registrations ORDER BY cid, user_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(cid, user_id)| PushUser::new(user_id, cid))
            .collect())
    }

    async fn exists(&self, push_user: &PushUser) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM push_registrations WHERE cid = $1 AND user_id = $2)",
        )
        .bind(push_user.context_id)
        .bind(push_user.user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }
}
