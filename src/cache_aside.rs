//! Cache-Aside Resolver and Streaming Materializer
//!
//! Both paths follow the same double-checked shape:
//!
//! 1. Try the cache (a cached empty/absent result counts as a hit)
//! 2. On miss, take the population lock for the operation
//! 3. Re-check the cache: another caller may have populated it while we waited
//! 4. Query the store, store the result, release the lock
//!
//! The materializer yields rows to the caller as the store produces them and
//! only writes the cache once the enumeration is exhausted. A stream that is
//! dropped early, cancelled or fails partway leaves the cache untouched.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_stream::try_stream;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{IpLogsError, IpLogsResult};
use crate::locks::PopulationLock;
use crate::specification::{Entity, Projection, Specification};
use crate::traits::Repository;
use crate::typed_cache::TypedCache;

/// Cache-aside statistics snapshot
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheAsideStats {
    /// Calls to `resolve` and `materialize`
    pub total_requests: u64,
    /// Served from cache on the first check
    pub hits: u64,
    /// Served from cache on the re-check, after waiting for the lock
    pub coalesced: u64,
    /// Store queries issued (point lookups and enumerations)
    pub store_queries: u64,
    /// Results written to the cache
    pub populations: u64,
}

impl CacheAsideStats {
    /// Share of requests answered without touching the store, in percent
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            ((self.hits + self.coalesced) as f64 / self.total_requests as f64) * 100.0
        }
    }
}

#[derive(Debug, Default)]
struct AtomicCacheAsideStats {
    total_requests: AtomicU64,
    hits: AtomicU64,
    coalesced: AtomicU64,
    store_queries: AtomicU64,
    populations: AtomicU64,
}

impl AtomicCacheAsideStats {
    fn snapshot(&self) -> CacheAsideStats {
        CacheAsideStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            store_queries: self.store_queries.load(Ordering::Relaxed),
            populations: self.populations.load(Ordering::Relaxed),
        }
    }
}

/// Run `fut` unless `cancel` fires first
pub(crate) async fn until_cancelled<T, F>(cancel: &CancellationToken, fut: F) -> IpLogsResult<T>
where
    F: Future<Output = IpLogsResult<T>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(IpLogsError::Cancelled),
        result = fut => result,
    }
}

/// Cache-aside coordinator over one cache and one repository
///
/// Holds no per-call state; the population locks are passed in by the caller.
pub struct CacheAside<R> {
    cache: Arc<TypedCache>,
    repository: Arc<R>,
    stats: Arc<AtomicCacheAsideStats>,
}

impl<R> Clone for CacheAside<R> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            repository: Arc::clone(&self.repository),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<R: Send + Sync + 'static> CacheAside<R> {
    pub fn new(cache: Arc<TypedCache>, repository: Arc<R>) -> Self {
        Self {
            cache,
            repository,
            stats: Arc::new(AtomicCacheAsideStats::default()),
        }
    }

    pub fn cache(&self) -> &Arc<TypedCache> {
        &self.cache
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    pub fn stats(&self) -> CacheAsideStats {
        self.stats.snapshot()
    }

    /// Resolve a point lookup through the cache
    ///
    /// `project` maps the (possibly absent) row to the cached shape, so a
    /// "not found" answer is cached like any other.
    ///
    /// # Errors
    ///
    /// Cache and store failures propagate unchanged; cancellation yields
    /// [`IpLogsError::Cancelled`]. The lock is released on every path.
    pub async fn resolve<E, T, F>(
        &self,
        key: &str,
        spec: &Specification<E>,
        lock: &PopulationLock,
        project: F,
        cancel: &CancellationToken,
    ) -> IpLogsResult<T>
    where
        E: Entity,
        R: Repository<E>,
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce(Option<E>) -> T + Send,
    {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        if let Some(hit) = until_cancelled(cancel, self.cache.try_get::<T>(key)).await? {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Cache hit");
            return Ok(hit);
        }

        let _guard = lock.acquire(key, cancel).await?;

        if let Some(hit) = until_cancelled(cancel, self.cache.try_get::<T>(key)).await? {
            self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Cache populated while waiting for lock");
            return Ok(hit);
        }

        self.stats.store_queries.fetch_add(1, Ordering::Relaxed);
        let row = until_cancelled(cancel, async {
            self.repository.first_or_default(spec).await.map_err(IpLogsError::store)
        })
        .await?;

        let found = row.is_some();
        let result = project(row);
        until_cancelled(cancel, self.cache.set(key, &result)).await?;
        self.stats.populations.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, found, table = E::TABLE, "Populated cache from store");

        Ok(result)
    }

    /// Stream a multi-row projection through the cache
    ///
    /// Rows are yielded as soon as the store produces them; the full list is
    /// cached once the store enumeration ends. Nothing is cached if the
    /// stream is dropped before the end, fails or is cancelled.
    pub fn materialize<E, T>(
        &self,
        key: String,
        projection: Projection<E, T>,
        lock: PopulationLock,
        cancel: CancellationToken,
    ) -> BoxStream<'static, IpLogsResult<T>>
    where
        E: Entity,
        R: Repository<E>,
        T: Serialize + DeserializeOwned + Clone + Eq + Hash + Send + Sync + 'static,
    {
        let cache = Arc::clone(&self.cache);
        let repository = Arc::clone(&self.repository);
        let stats = Arc::clone(&self.stats);

        let stream = try_stream! {
            stats.total_requests.fetch_add(1, Ordering::Relaxed);

            let cached: Option<Vec<T>> = until_cancelled(&cancel, cache.try_get(&key)).await?;
            if let Some(items) = cached {
                stats.hits.fetch_add(1, Ordering::Relaxed);
                trace!(key = %key, count = items.len(), "Cache hit");
                for item in items {
                    yield item;
                }
            } else {
                let _guard = lock.acquire(&key, &cancel).await?;

                let cached: Option<Vec<T>> = until_cancelled(&cancel, cache.try_get(&key)).await?;
                if let Some(items) = cached {
                    stats.coalesced.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, count = items.len(), "Cache populated while waiting for lock");
                    for item in items {
                        yield item;
                    }
                } else {
                    stats.store_queries.fetch_add(1, Ordering::Relaxed);
                    let mut rows = repository.stream(projection);
                    let mut buffer = Vec::new();

                    while let Some(row) = until_cancelled(&cancel, async {
                        rows.next().await.transpose().map_err(IpLogsError::store)
                    })
                    .await?
                    {
                        buffer.push(row.clone());
                        yield row;
                    }

                    until_cancelled(&cancel, cache.set(&key, &buffer)).await?;
                    stats.populations.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, count = buffer.len(), table = E::TABLE, "Populated cache from store enumeration");
                }
            }
        };

        stream.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::DashMapCache;
    use crate::models::{ConnectionHistoryEntry, LastConnection};
    use crate::repository::{ChangeSet, MemoryStore};
    use crate::specification::{HistorySpecification, ReadMode, UserSpecification};
    use crate::traits::UnitOfWork;
    use crate::typed_cache::CacheStrategy;
    use chrono::Utc;
    use futures_util::TryStreamExt;

    async fn setup() -> (CacheAside<MemoryStore>, Arc<DashMapCache>, MemoryStore) {
        let backend = Arc::new(DashMapCache::new());
        let cache = Arc::new(TypedCache::new(backend.clone(), CacheStrategy::ShortTerm));
        let store = MemoryStore::new();

        let mut changes = ChangeSet::new();
        for (user, ip) in [(1, "127.0.0.1"), (1, "127.0.0.2"), (2, "10.0.0.1")] {
            changes.append_history(ConnectionHistoryEntry::pending(user, ip, Utc::now()));
        }
        store.save_changes(changes).await.unwrap();

        (CacheAside::new(cache, Arc::new(store.clone())), backend, store)
    }

    #[tokio::test]
    async fn test_resolve_caches_absent_result() {
        let (aside, backend, _) = setup().await;
        let lock = PopulationLock::default();
        let cancel = CancellationToken::new();
        let spec = UserSpecification::by_id(9, ReadMode::Untracked);

        let first: LastConnection = aside
            .resolve("9_GetLastConnection", &spec, &lock, LastConnection::from, &cancel)
            .await
            .unwrap();
        assert!(!first.is_known());
        assert!(backend.contains_key("9_GetLastConnection"));

        let second: LastConnection = aside
            .resolve("9_GetLastConnection", &spec, &lock, LastConnection::from, &cancel)
            .await
            .unwrap();
        assert_eq!(first, second);

        let stats = aside.stats();
        assert_eq!(stats.store_queries, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_materialize_populates_at_end() {
        let (aside, backend, _) = setup().await;
        let lock = PopulationLock::default();

        let mut stream = aside.materialize(
            "1_GetIpHistory".to_string(),
            HistorySpecification::ip_addresses_of(1),
            lock.clone(),
            CancellationToken::new(),
        );
        let first = stream.try_next().await.unwrap();
        assert_eq!(first.as_deref(), Some("127.0.0.1"));
        assert!(!backend.contains_key("1_GetIpHistory"), "nothing cached mid-stream");

        let rest: Vec<String> = stream.try_collect().await.unwrap();
        assert_eq!(rest, vec!["127.0.0.2"]);
        assert!(backend.contains_key("1_GetIpHistory"));
    }

    #[tokio::test]
    async fn test_materialize_dropped_early_caches_nothing() {
        let (aside, backend, _) = setup().await;
        let lock = PopulationLock::default();

        {
            let mut stream = aside.materialize(
                "1_GetIpHistory".to_string(),
                HistorySpecification::ip_addresses_of(1),
                lock.clone(),
                CancellationToken::new(),
            );
            assert!(stream.try_next().await.unwrap().is_some());
        }

        assert!(!backend.contains_key("1_GetIpHistory"));
        assert_eq!(aside.stats().populations, 0);

        // Lock was released when the stream was dropped
        let all: Vec<String> = aside
            .materialize(
                "1_GetIpHistory".to_string(),
                HistorySpecification::ip_addresses_of(1),
                lock,
                CancellationToken::new(),
            )
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_materialize_caches_empty_list() {
        let (aside, backend, _) = setup().await;
        let lock = PopulationLock::default();

        let users: Vec<i64> = aside
            .materialize(
                "192.168._FindUsersByIpPrefix".to_string(),
                HistorySpecification::users_by_ip_prefix("192.168."),
                lock,
                CancellationToken::new(),
            )
            .try_collect()
            .await
            .unwrap();
        assert!(users.is_empty());
        assert!(backend.contains_key("192.168._FindUsersByIpPrefix"));
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_store() {
        let (aside, _, _) = setup().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = aside
            .resolve(
                "1_GetLastConnection",
                &UserSpecification::by_id(1, ReadMode::Untracked),
                &PopulationLock::default(),
                LastConnection::from,
                &cancel,
            )
            .await;
        assert!(matches!(result, Err(IpLogsError::Cancelled)));
        assert_eq!(aside.stats().store_queries, 0);
    }
}
