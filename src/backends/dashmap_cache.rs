//! `DashMap` Cache - In-Process Cache Backend
//!
//! A concurrent map with per-entry expiry, for single-process deployments,
//! demos and tests. Entries are checked for expiry on read and can be swept
//! with [`DashMapCache::cleanup_expired`].

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::traits::CacheBackend;

/// Cache entry with expiration tracking
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(value: Vec<u8>, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Concurrent in-process cache using `DashMap`
///
/// **Limitations**:
/// - Not shared between processes
/// - No size limit; expired entries are dropped on read or by `cleanup_expired`
///
/// **Example**:
/// ```rust
/// use ip_logs_cache::backends::DashMapCache;
/// use ip_logs_cache::traits::CacheBackend;
/// use std::time::Duration;
///
/// # async fn example() -> anyhow::Result<()> {
/// let cache = DashMapCache::new();
/// cache.set_with_ttl("42_GetIpHistory", b"[]", Duration::from_secs(5)).await?;
/// assert_eq!(cache.get("42_GetIpHistory").await?, Some(b"[]".to_vec()));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct DashMapCache {
    map: Arc<DashMap<String, CacheEntry>>,
}

impl DashMapCache {
    pub fn new() -> Self {
        info!("Initializing DashMap Cache (in-process)");
        Self::default()
    }

    /// Remove expired entries, returning how many were dropped
    pub fn cleanup_expired(&self) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| !entry.is_expired());
        let removed = before.saturating_sub(self.map.len());
        if removed > 0 {
            debug!(count = removed, "[DashMap] Cleaned up expired entries");
        }
        removed
    }

    /// Whether `key` currently holds a live entry
    pub fn contains_key(&self, key: &str) -> bool {
        self.map.get(key).is_some_and(|entry| !entry.is_expired())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[async_trait]
impl CacheBackend for DashMapCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(entry) = self.map.get(key) else {
            return Ok(None);
        };
        if entry.is_expired() {
            drop(entry);
            self.map.remove_if(key, |_, e| e.is_expired());
            return Ok(None);
        }
        Ok(Some(entry.value.clone()))
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.map.insert(key.to_string(), CacheEntry::new(value.to_vec(), ttl));
        debug!(key = %key, ttl_ms = ttl.as_millis(), "[DashMap] Cached key with TTL");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.map.remove(key);
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "DashMap"
    }
}
