//! Common utilities for integration tests
//!
//! This module provides shared test infrastructure including:
//! - A counting store that measures queries and their concurrency
//! - A cache backend that always fails
//! - Service constructors and seed data

#![allow(dead_code)]

use anyhow::{Result, bail};
use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use ip_logs_cache::{
    CacheBackend, CacheStrategy, ChangeSet, ConnectionHistoryEntry, ConnectionService, DashMapCache, LockStrategy,
    MemoryStore, OperationLocks, Projection, Repository, Specification, TypedCache, UnitOfWork, UserConnectionState,
};
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Get Redis URL from environment or use default
pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Unique suffix so Redis-backed tests do not collide
pub fn unique_suffix() -> String {
    format!("{}", rand::random::<u32>())
}

/// Fixed timestamp helper
pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, 0)
        .single()
        .unwrap_or_else(|| panic!("invalid test timestamp"))
}

/// Query counters shared by a [`CountingStore`] and the stream it hands out
#[derive(Debug, Default)]
pub struct QueryCounters {
    pub point_queries: AtomicUsize,
    pub enumerations: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl QueryCounters {
    pub fn point_queries(&self) -> usize {
        self.point_queries.load(Ordering::SeqCst)
    }

    pub fn enumerations(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Marks one store query as running until dropped
struct InFlight(Arc<QueryCounters>);

impl InFlight {
    fn enter(counters: &Arc<QueryCounters>) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(Arc::clone(counters))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// `MemoryStore` wrapper that counts reads, optionally slows reads and
/// commits down and can be told to fail
#[derive(Default)]
pub struct CountingStore {
    pub inner: MemoryStore,
    pub counters: Arc<QueryCounters>,
    pub delay: Duration,
    pub fail_queries: AtomicBool,
    pub fail_mid_stream: AtomicBool,
}

impl CountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    async fn point_query<E>(&self, spec: &Specification<E>) -> Result<Option<E>>
    where
        E: ip_logs_cache::specification::Entity,
        MemoryStore: Repository<E>,
    {
        self.counters.point_queries.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.counters);
        tokio::time::sleep(self.delay).await;
        if self.fail_queries.load(Ordering::SeqCst) {
            bail!("store unavailable");
        }
        Repository::<E>::first_or_default(&self.inner, spec).await
    }

    fn enumerate<E, R>(&self, projection: Projection<E, R>) -> BoxStream<'static, Result<R>>
    where
        E: ip_logs_cache::specification::Entity,
        R: Clone + Eq + Hash + Send + Sync + 'static,
        MemoryStore: Repository<E>,
    {
        self.counters.enumerations.fetch_add(1, Ordering::SeqCst);
        let counters = Arc::clone(&self.counters);
        let delay = self.delay;
        let fail_all = self.fail_queries.load(Ordering::SeqCst);
        let fail_mid = self.fail_mid_stream.load(Ordering::SeqCst);
        let mut rows = Repository::<E>::stream(&self.inner, projection);

        stream! {
            let _in_flight = InFlight::enter(&counters);
            tokio::time::sleep(delay).await;
            if fail_all {
                yield Err(anyhow::anyhow!("store unavailable"));
            } else {
                let mut yielded = 0usize;
                while let Some(row) = rows.next().await {
                    if fail_mid && yielded == 1 {
                        yield Err(anyhow::anyhow!("connection reset mid-enumeration"));
                        break;
                    }
                    yielded += 1;
                    yield row;
                }
            }
        }
        .boxed()
    }
}

#[async_trait]
impl Repository<UserConnectionState> for CountingStore {
    async fn first_or_default(&self, spec: &Specification<UserConnectionState>) -> Result<Option<UserConnectionState>> {
        self.point_query(spec).await
    }

    fn stream<R>(&self, projection: Projection<UserConnectionState, R>) -> BoxStream<'static, Result<R>>
    where
        R: Clone + Eq + Hash + Send + Sync + 'static,
    {
        self.enumerate(projection)
    }
}

#[async_trait]
impl Repository<ConnectionHistoryEntry> for CountingStore {
    async fn first_or_default(
        &self,
        spec: &Specification<ConnectionHistoryEntry>,
    ) -> Result<Option<ConnectionHistoryEntry>> {
        self.point_query(spec).await
    }

    fn stream<R>(&self, projection: Projection<ConnectionHistoryEntry, R>) -> BoxStream<'static, Result<R>>
    where
        R: Clone + Eq + Hash + Send + Sync + 'static,
    {
        self.enumerate(projection)
    }
}

#[async_trait]
impl UnitOfWork for CountingStore {
    async fn save_changes(&self, changes: ChangeSet) -> Result<usize> {
        tokio::time::sleep(self.delay).await;
        if self.fail_queries.load(Ordering::SeqCst) {
            bail!("store unavailable");
        }
        self.inner.save_changes(changes).await
    }
}

/// Cache backend whose every call fails
pub struct FailingCache;

#[async_trait]
impl CacheBackend for FailingCache {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        bail!("cache unreachable")
    }

    async fn set_with_ttl(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<()> {
        bail!("cache unreachable")
    }

    async fn remove(&self, _key: &str) -> Result<()> {
        bail!("cache unreachable")
    }

    async fn health_check(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "Failing"
    }
}

/// Service over `store` with an in-process cache
pub fn service_with(
    store: Arc<CountingStore>,
    lock_strategy: LockStrategy,
) -> (ConnectionService<CountingStore>, Arc<DashMapCache>) {
    let backend = Arc::new(DashMapCache::new());
    let cache = Arc::new(TypedCache::new(backend.clone(), CacheStrategy::ShortTerm));
    let service = ConnectionService::new(cache, store, OperationLocks::new(lock_strategy));
    (service, backend)
}

/// Service over `store` with a cache that always fails
pub fn service_with_failing_cache(store: Arc<CountingStore>) -> ConnectionService<CountingStore> {
    let cache = Arc::new(TypedCache::new(Arc::new(FailingCache), CacheStrategy::ShortTerm));
    ConnectionService::new(cache, store, OperationLocks::default())
}

/// Append history rows directly to the store
pub async fn seed_history(store: &CountingStore, rows: &[(i64, &str)]) {
    let mut changes = ChangeSet::new();
    for (user_id, ip) in rows {
        changes.append_history(ConnectionHistoryEntry::pending(*user_id, *ip, Utc::now()));
    }
    store
        .inner
        .save_changes(changes)
        .await
        .unwrap_or_else(|e| panic!("seeding failed: {e}"));
}

/// Wait for a condition with timeout
pub async fn wait_for<F>(mut condition: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> bool,
{
    use tokio::time::{Duration, sleep};

    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }

    false
}
