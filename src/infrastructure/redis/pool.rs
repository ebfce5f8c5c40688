//! Redis connection pool for the credential store and the cluster transport.
//!
//! Commands share one multiplexed connection that is re-established lazily
//! after a dropped connection. Pub/Sub needs a dedicated connection, which
//! callers open through [`RedisPool::client`].

use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, RedisResult};
use tokio::sync::RwLock;

use crate::config::RedisConfig;

/// Error type for Redis pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Redis operation failed
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    /// Connection not available
    #[error("Connection not available: {0}")]
    ConnectionUnavailable(String),
}

pub struct RedisPool {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    config: RedisConfig,
}

impl RedisPool {
    pub fn new(config: RedisConfig) -> Result<Self, PoolError> {
        let client = Client::open(config.url.as_str())?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            config,
        })
    }

    /// Client for opening dedicated (Pub/Sub) connections
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Get the shared connection, connecting if necessary
    pub async fn get_connection(&self) -> Result<MultiplexedConnection, PoolError> {
        if let Some(conn) = self.connection.read().await.as_ref() {
            return Ok(conn.clone());
        }

        let mut guard = self.connection.write().await;
        // Another task may have connected while we waited for the write lock
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to Redis");
                PoolError::Redis(e)
            })?;

        *guard = Some(conn.clone());
        tracing::info!(url = %self.config.url, "Redis pool connection established");
        Ok(conn)
    }

    /// Run a command on the shared connection, dropping the connection on
    /// I/O errors so the next call reconnects.
    pub async fn execute<F, T, Fut>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = RedisResult<T>>,
    {
        let conn = self.get_connection().await?;

        match f(conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    self.connection.write().await.take();
                }
                Err(PoolError::Redis(e))
            }
        }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn key_prefix(&self) -> &str {
        &self.config.key_prefix
    }

    pub async fn ping(&self) -> Result<(), PoolError> {
        let _: String = self
            .execute(|mut conn| async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(())
    }
}
