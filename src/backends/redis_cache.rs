//! Redis Cache - Distributed Cache Backend
//!
//! Shared cache for query results. Every instance of the service reads and
//! invalidates the same keys.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tracing::{debug, info};

use crate::traits::CacheBackend;
use async_trait::async_trait;

/// Redis distributed cache with `ConnectionManager` for automatic reconnection
///
/// Unlike a best-effort tier, connection and command failures are returned to
/// the caller instead of being reported as misses.
#[derive(Clone)]
pub struct RedisCache {
    /// Redis connection manager - handles reconnection automatically
    conn_manager: ConnectionManager,
}

impl RedisCache {
    /// Connect to `redis_url` and verify the connection with `PING`
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis client cannot be created or connection fails.
    pub async fn with_url(redis_url: &str) -> Result<Self> {
        info!(redis_url = %redis_url, "Initializing Redis Cache with ConnectionManager");

        let client = Client::open(redis_url)
            .with_context(|| format!("Failed to create Redis client with URL: {redis_url}"))?;

        let conn_manager = ConnectionManager::new(client)
            .await
            .context("Failed to establish Redis connection manager")?;

        let mut conn = conn_manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis PING health check failed")?;

        info!(redis_url = %redis_url, "Redis Cache connected successfully");

        Ok(Self { conn_manager })
    }

    /// Wrap an existing connection
    ///
    /// Do not pass the connection of a [`RedisStreamBroker`](crate::RedisStreamBroker):
    /// its blocking reads would hold up every cache command queued behind them.
    pub fn from_connection(conn_manager: ConnectionManager) -> Self {
        Self { conn_manager }
    }

    /// Remaining TTL of `key`, `None` when the key is missing or never expires
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis command fails.
    pub async fn ttl_of(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn_manager.clone();
        let ttl_ms: i64 = conn.pttl(key).await.with_context(|| format!("PTTL {key} failed"))?;
        Ok((ttl_ms > 0).then(|| Duration::from_millis(ttl_ms.unsigned_abs())))
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn_manager.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.with_context(|| format!("GET {key} failed"))?;
        Ok(value.filter(|bytes| !bytes.is_empty()))
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let _: () = conn
            .pset_ex(key, value, ttl_ms)
            .await
            .with_context(|| format!("PSETEX {key} failed"))?;
        debug!(key = %key, ttl_ms = ttl_ms, "[Redis] Cached key with TTL");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let removed: usize = conn.del(key).await.with_context(|| format!("DEL {key} failed"))?;
        debug!(key = %key, removed = removed, "[Redis] Removed key");
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let mut conn = self.conn_manager.clone();
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}
