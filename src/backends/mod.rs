//! Cache Backend Implementations
//!
//! # Available Backends
//!
//! - **Redis** - Shared distributed cache; the production backend
//! - **`DashMap`** - In-process concurrent map with TTL checks; demos and tests
//!
//! # Usage
//!
//! ```rust,no_run
//! use ip_logs_cache::backends::{DashMapCache, RedisCache};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let redis = RedisCache::with_url("redis://127.0.0.1:6379").await?;
//! let local = DashMapCache::new();
//! # Ok(())
//! # }
//! ```

pub mod dashmap_cache;
pub mod redis_cache;

pub use dashmap_cache::DashMapCache;
pub use redis_cache::RedisCache;
