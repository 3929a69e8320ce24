//! Connection Service Builder
//!
//! Composes a [`ConnectionService`] from a cache backend, a TTL strategy and a
//! lock strategy.
//!
//! # Example: Redis from the environment
//!
//! ```rust,no_run
//! use ip_logs_cache::{ConnectionServiceBuilder, IpLogsConfig, MemoryStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IpLogsConfig::from_env()?;
//!     let service = ConnectionServiceBuilder::from_config(&config)
//!         .build(Arc::new(MemoryStore::new()))
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! # Example: In-process cache
//!
//! ```rust
//! use ip_logs_cache::{ConnectionServiceBuilder, DashMapCache, LockStrategy, MemoryStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let service = ConnectionServiceBuilder::new()
//!     .with_cache(Arc::new(DashMapCache::new()))
//!     .with_lock_strategy(LockStrategy::PerKey)
//!     .build(Arc::new(MemoryStore::new()))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::backends::RedisCache;
use crate::config::{DEFAULT_REDIS_URL, IpLogsConfig};
use crate::locks::{LockStrategy, OperationLocks};
use crate::service::{ConnectionService, ConnectionStore};
use crate::traits::CacheBackend;
use crate::typed_cache::{CacheStrategy, TypedCache};

/// Builder for [`ConnectionService`]
///
/// # Default Behavior
///
/// Without `.with_cache()`, `build` connects a [`RedisCache`] to the
/// configured URL. TTL defaults to [`CacheStrategy::RealTime`] (5 s) and
/// locking to [`LockStrategy::PerOperation`].
pub struct ConnectionServiceBuilder {
    cache: Option<Arc<dyn CacheBackend>>,
    redis_url: String,
    strategy: CacheStrategy,
    lock_strategy: LockStrategy,
}

impl ConnectionServiceBuilder {
    pub fn new() -> Self {
        Self {
            cache: None,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            strategy: CacheStrategy::default(),
            lock_strategy: LockStrategy::default(),
        }
    }

    /// Start from settings read by [`IpLogsConfig::from_env`]
    pub fn from_config(config: &IpLogsConfig) -> Self {
        Self::new()
            .with_redis_url(&config.redis_url)
            .with_ttl(config.cache_ttl)
            .with_lock_strategy(config.lock_strategy)
    }

    /// Use a specific cache backend instead of connecting to Redis
    pub fn with_cache(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(backend);
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_ttl(self, ttl: Duration) -> Self {
        self.with_strategy(CacheStrategy::Custom(ttl))
    }

    pub fn with_lock_strategy(mut self, lock_strategy: LockStrategy) -> Self {
        self.lock_strategy = lock_strategy;
        self
    }

    /// Build the service over `repository`
    ///
    /// # Errors
    ///
    /// Fails if no cache backend was given and Redis cannot be reached.
    pub async fn build<R: ConnectionStore>(self, repository: Arc<R>) -> Result<ConnectionService<R>> {
        let backend: Arc<dyn CacheBackend> = match self.cache {
            Some(backend) => {
                info!(backend = backend.name(), "Using provided cache backend");
                backend
            }
            None => {
                info!(url = %self.redis_url, "Using Redis cache backend");
                Arc::new(RedisCache::with_url(&self.redis_url).await?)
            }
        };

        let cache = Arc::new(TypedCache::new(backend, self.strategy));
        Ok(ConnectionService::new(cache, repository, OperationLocks::new(self.lock_strategy)))
    }
}

impl Default for ConnectionServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}
