//! Cache Population Locks
//!
//! Serialize cache population so that a miss storm issues one store query at a
//! time instead of one per caller.
//!
//! Two granularities:
//!
//! - [`LockStrategy::PerOperation`] (default): one mutex for a whole operation
//!   kind. Misses for *different* keys of the same operation also wait for each
//!   other, which bounds concurrent store queries per operation to one.
//! - [`LockStrategy::PerKey`]: a lazily created mutex per cache key, held in a
//!   `DashMap` and removed once nobody holds or waits on it.
//!
//! Locks are process-local values; each service instance owns its own.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{IpLogsError, IpLogsResult};

/// Granularity of cache population locking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockStrategy {
    /// One mutex per operation kind
    #[default]
    PerOperation,
    /// One mutex per cache key
    PerKey,
}

impl FromStr for LockStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-operation" | "per_operation" | "operation" => Ok(Self::PerOperation),
            "per-key" | "per_key" | "key" => Ok(Self::PerKey),
            other => Err(anyhow::anyhow!("unknown lock strategy {other:?} (expected per-operation or per-key)")),
        }
    }
}

impl fmt::Display for LockStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PerOperation => f.write_str("per-operation"),
            Self::PerKey => f.write_str("per-key"),
        }
    }
}

type KeyedLocks = Arc<DashMap<String, Arc<Mutex<()>>>>;

#[derive(Clone)]
enum LockInner {
    Shared(Arc<Mutex<()>>),
    Keyed(KeyedLocks),
}

/// Lock guarding cache population for one operation kind
#[derive(Clone)]
pub struct PopulationLock {
    inner: LockInner,
}

/// RAII cleanup for per-key locks
/// Removes the table entry once the last holder or waiter is gone, even on
/// early return, error or cancellation.
struct CleanupGuard {
    map: KeyedLocks,
    key: String,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        // Only the table's own reference left: nobody holds or waits.
        self.map.remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Held while a cache entry is being populated; releases on drop
pub struct PopulationGuard {
    _guard: OwnedMutexGuard<()>,
    _cleanup: Option<CleanupGuard>,
}

impl PopulationLock {
    pub fn new(strategy: LockStrategy) -> Self {
        let inner = match strategy {
            LockStrategy::PerOperation => LockInner::Shared(Arc::new(Mutex::new(()))),
            LockStrategy::PerKey => LockInner::Keyed(Arc::new(DashMap::new())),
        };
        Self { inner }
    }

    pub fn strategy(&self) -> LockStrategy {
        match self.inner {
            LockInner::Shared(_) => LockStrategy::PerOperation,
            LockInner::Keyed(_) => LockStrategy::PerKey,
        }
    }

    /// Wait for the lock covering `key`
    ///
    /// # Errors
    ///
    /// Returns [`IpLogsError::Cancelled`] if `cancel` fires first.
    pub async fn acquire(&self, key: &str, cancel: &CancellationToken) -> IpLogsResult<PopulationGuard> {
        let (mutex, cleanup) = match &self.inner {
            LockInner::Shared(mutex) => (Arc::clone(mutex), None),
            LockInner::Keyed(map) => {
                let cleanup = CleanupGuard {
                    map: Arc::clone(map),
                    key: key.to_string(),
                };
                let mutex = map
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone();
                (mutex, Some(cleanup))
            }
        };

        let guard = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                trace!(key = %key, "Cancelled while waiting for population lock");
                return Err(IpLogsError::Cancelled);
            }
            guard = mutex.lock_owned() => guard,
        };

        trace!(key = %key, strategy = %self.strategy(), "Acquired population lock");
        Ok(PopulationGuard {
            _guard: guard,
            _cleanup: cleanup,
        })
    }

    /// Number of keys with a live per-key lock (always 0 for per-operation)
    pub fn in_flight(&self) -> usize {
        match &self.inner {
            LockInner::Shared(_) => 0,
            LockInner::Keyed(map) => map.len(),
        }
    }
}

impl Default for PopulationLock {
    fn default() -> Self {
        Self::new(LockStrategy::default())
    }
}

/// The three population locks of the connection service
#[derive(Clone, Default)]
pub struct OperationLocks {
    pub last_connection: PopulationLock,
    pub ip_history: PopulationLock,
    pub ip_prefix_search: PopulationLock,
}

impl OperationLocks {
    pub fn new(strategy: LockStrategy) -> Self {
        Self {
            last_connection: PopulationLock::new(strategy),
            ip_history: PopulationLock::new(strategy),
            ip_prefix_search: PopulationLock::new(strategy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_per_operation_serializes_different_keys() {
        let lock = PopulationLock::new(LockStrategy::PerOperation);
        let cancel = CancellationToken::new();

        let held = lock.acquire("1_GetIpHistory", &cancel).await.unwrap();
        let other = tokio::time::timeout(Duration::from_millis(50), lock.acquire("2_GetIpHistory", &cancel)).await;
        assert!(other.is_err(), "different key must wait on the shared lock");

        drop(held);
        assert!(lock.acquire("2_GetIpHistory", &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_per_key_allows_different_keys_and_reclaims() {
        let lock = PopulationLock::new(LockStrategy::PerKey);
        let cancel = CancellationToken::new();

        let a = lock.acquire("a", &cancel).await.unwrap();
        let b = tokio::time::timeout(Duration::from_millis(50), lock.acquire("b", &cancel))
            .await
            .expect("independent key should not wait")
            .unwrap();
        assert_eq!(lock.in_flight(), 2);

        drop(a);
        drop(b);
        assert_eq!(lock.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_per_key_entry_survives_while_contended() {
        let lock = PopulationLock::new(LockStrategy::PerKey);
        let cancel = CancellationToken::new();

        let held = lock.acquire("k", &cancel).await.unwrap();
        let waiter = {
            let lock = lock.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { lock.acquire("k", &cancel).await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(held);
        assert_eq!(lock.in_flight(), 1, "waiter still references the entry");

        waiter.await.unwrap().unwrap();
        assert_eq!(lock.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let lock = PopulationLock::new(LockStrategy::PerKey);
        let cancel = CancellationToken::new();
        let held = lock.acquire("k", &cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let waiter = {
            let lock = lock.clone();
            let token = waiter_cancel.clone();
            tokio::spawn(async move { lock.acquire("k", &token).await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter_cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(IpLogsError::Cancelled)));

        drop(held);
        assert_eq!(lock.in_flight(), 0);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("per-key".parse::<LockStrategy>().unwrap(), LockStrategy::PerKey);
        assert_eq!("PER_OPERATION".parse::<LockStrategy>().unwrap(), LockStrategy::PerOperation);
        assert!("global".parse::<LockStrategy>().is_err());
    }
}
