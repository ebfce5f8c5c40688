//! PostgreSQL connection pool.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::config::DatabaseConfig;

/// Errors that can occur with the PostgreSQL pool.
#[derive(Debug, Error)]
pub enum PostgresPoolError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Database URL not configured")]
    NotConfigured,
}

#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
    database_url: String,
}

impl PostgresPool {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, PostgresPoolError> {
        let url = config.url.clone().ok_or(PostgresPoolError::NotConfigured)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&url)
            .await?;

        let pool = Self {
            pool,
            database_url: url,
        };
        tracing::info!(
            url = %pool.database_url_masked(),
            pool_size = config.pool_size,
            "PostgreSQL connection pool created"
        );
        Ok(pool)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Database URL with the password replaced, safe for logs
    pub fn database_url_masked(&self) -> String {
        mask_password(&self.database_url)
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("PostgreSQL connection pool closed");
    }
}

fn mask_password(url: &str) -> String {
    let Some(at) = url.find('@') else {
        return url.to_string();
    };
    let scheme_end = url.find("://").map(|i| i + 3).unwrap_or(0);
    match url[scheme_end..at].find(':') {
        Some(colon) => {
            let colon = scheme_end + colon;
            format!("{}***{}", &url[..=colon], &url[at..])
        }
        None => url.to_string(),
    }
}
