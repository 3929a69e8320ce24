//! Connection Service
//!
//! The public read/write surface of the connection log. Reads go through the
//! cache-aside layer; the write commits to the store and then invalidates the
//! two cache entries the write makes stale.
//!
//! Cache keys have the form `"{argument}_{operation}"`, for example
//! `"42_GetLastConnection"` or `"127.0._FindUsersByIpPrefix"`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache_aside::{CacheAside, CacheAsideStats, until_cancelled};
use crate::error::{IpLogsError, IpLogsResult};
use crate::locks::OperationLocks;
use crate::models::{ConnectionHistoryEntry, LastConnection, UserConnectionState};
use crate::repository::{ChangeSet, DuplicateKey};
use crate::specification::{HistorySpecification, ReadMode, UserSpecification};
use crate::traits::{ConnectionRecorder, Repository, UnitOfWork};
use crate::typed_cache::TypedCache;

/// Read operations, named as they appear in cache keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetLastConnection,
    GetIpHistory,
    FindUsersByIpPrefix,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetLastConnection => "GetLastConnection",
            Self::GetIpHistory => "GetIpHistory",
            Self::FindUsersByIpPrefix => "FindUsersByIpPrefix",
        }
    }

    /// Cache key for this operation applied to `argument`
    ///
    /// ```rust
    /// use ip_logs_cache::service::Operation;
    ///
    /// assert_eq!(Operation::GetLastConnection.cache_key(42), "42_GetLastConnection");
    /// assert_eq!(Operation::FindUsersByIpPrefix.cache_key("127.0."), "127.0._FindUsersByIpPrefix");
    /// ```
    pub fn cache_key(self, argument: impl fmt::Display) -> String {
        format!("{argument}_{}", self.as_str())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store capabilities the service needs: both tables plus atomic commit
pub trait ConnectionStore:
    Repository<UserConnectionState> + Repository<ConnectionHistoryEntry> + UnitOfWork + 'static
{
}

impl<T> ConnectionStore for T where
    T: Repository<UserConnectionState> + Repository<ConnectionHistoryEntry> + UnitOfWork + 'static
{
}

/// Connection log façade
///
/// Cheap to clone; clones share the cache, the store, the statistics and
/// the population locks.
pub struct ConnectionService<R> {
    aside: CacheAside<R>,
    locks: OperationLocks,
}

impl<R> Clone for ConnectionService<R> {
    fn clone(&self) -> Self {
        Self {
            aside: self.aside.clone(),
            locks: self.locks.clone(),
        }
    }
}

impl<R: ConnectionStore> ConnectionService<R> {
    pub fn new(cache: Arc<TypedCache>, repository: Arc<R>, locks: OperationLocks) -> Self {
        info!(
            backend = cache.backend().name(),
            ttl_secs = cache.ttl().as_secs(),
            lock_strategy = %locks.last_connection.strategy(),
            "Initializing connection service"
        );
        Self {
            aside: CacheAside::new(cache, repository),
            locks,
        }
    }

    /// Record one connection of `user_id` from `ip_address`
    ///
    /// Upserts the user's current state and appends one history row in a
    /// single commit, then removes `"{user_id}_GetLastConnection"` and
    /// `"{user_id}_GetIpHistory"` from the cache.
    ///
    /// Events are applied in call order; an older `event_time` still replaces
    /// a newer current state. When two calls race to create the same new
    /// user, the loser's insert is retried once as an overwrite.
    ///
    /// # Errors
    ///
    /// [`IpLogsError::Store`] if the lookup or commit fails (the cache is not
    /// touched), [`IpLogsError::Cache`] if an invalidation fails after the
    /// commit, [`IpLogsError::Cancelled`] if cancelled before the commit.
    pub async fn record_connection<Tz>(
        &self,
        user_id: i64,
        ip_address: &str,
        event_time: DateTime<Tz>,
        cancel: &CancellationToken,
    ) -> IpLogsResult<()>
    where
        Tz: TimeZone,
        Tz::Offset: Send + Sync,
    {
        let event_time = event_time.with_timezone(&Utc);
        let current = UserConnectionState {
            id: user_id,
            current_ip_address: ip_address.to_string(),
            last_connection_time_utc: event_time,
        };

        let repository = self.aside.repository();
        let mut retried = false;
        let (written, inserted) = loop {
            let existing = until_cancelled(cancel, async {
                let spec = UserSpecification::by_id(user_id, ReadMode::Tracked);
                Repository::<UserConnectionState>::first_or_default(repository.as_ref(), &spec)
                    .await
                    .map_err(IpLogsError::store)
            })
            .await?;

            let mut changes = ChangeSet::new();
            match &existing {
                Some(row) => changes.set_values(row, current.clone()),
                None => changes.add(current.clone()),
            };
            changes.append_history(ConnectionHistoryEntry::pending(user_id, ip_address, event_time));

            let committed = until_cancelled(cancel, async {
                Ok::<_, IpLogsError>(repository.save_changes(changes).await)
            })
            .await?;
            match committed {
                Ok(written) => break (written, existing.is_none()),
                // Lost an insert race for a new user: the row exists now
                Err(e) if existing.is_none() && !retried && e.downcast_ref::<DuplicateKey>().is_some() => {
                    debug!(user_id, "Concurrent insert of user row; retrying as overwrite");
                    retried = true;
                }
                Err(e) => return Err(IpLogsError::store(e)),
            }
        };

        // Committed: invalidate regardless of cancellation
        self.invalidate_user(user_id).await?;

        debug!(
            user_id,
            ip = %ip_address,
            rows = written,
            inserted,
            "Recorded connection"
        );
        Ok(())
    }

    async fn invalidate_user(&self, user_id: i64) -> IpLogsResult<()> {
        let cache = self.aside.cache();
        let last = cache.remove(&Operation::GetLastConnection.cache_key(user_id)).await;
        let history = cache.remove(&Operation::GetIpHistory.cache_key(user_id)).await;
        if let Err(e) = &last {
            warn!(user_id, error = %e, "Failed to invalidate last connection after commit");
        }
        if let Err(e) = &history {
            warn!(user_id, error = %e, "Failed to invalidate IP history after commit");
        }
        last.and(history)
    }

    /// Most recent connection of `user_id`
    ///
    /// An unknown user yields a [`LastConnection`] with both fields `None`.
    ///
    /// # Errors
    ///
    /// Cache and store failures fail the call; no stale value is substituted.
    pub async fn get_last_connection(&self, user_id: i64, cancel: &CancellationToken) -> IpLogsResult<LastConnection> {
        let key = Operation::GetLastConnection.cache_key(user_id);
        let spec = UserSpecification::by_id(user_id, ReadMode::Untracked);
        self.aside
            .resolve(&key, &spec, &self.locks.last_connection, LastConnection::from, cancel)
            .await
    }

    /// Distinct IP addresses `user_id` has connected from, in store order
    pub fn get_ip_history(&self, user_id: i64, cancel: &CancellationToken) -> BoxStream<'static, IpLogsResult<String>> {
        self.aside.materialize(
            Operation::GetIpHistory.cache_key(user_id),
            HistorySpecification::ip_addresses_of(user_id),
            self.locks.ip_history.clone(),
            cancel.clone(),
        )
    }

    /// Distinct users that connected from an address starting with `prefix`
    ///
    /// Case-sensitive literal prefix; no wildcard characters.
    pub fn find_users_by_ip_prefix(&self, prefix: &str, cancel: &CancellationToken) -> BoxStream<'static, IpLogsResult<i64>> {
        self.aside.materialize(
            Operation::FindUsersByIpPrefix.cache_key(prefix),
            HistorySpecification::users_by_ip_prefix(prefix),
            self.locks.ip_prefix_search.clone(),
            cancel.clone(),
        )
    }

    /// Whether the cache backend answers
    pub async fn health_check(&self) -> bool {
        self.aside.cache().backend().health_check().await
    }

    pub fn stats(&self) -> CacheAsideStats {
        self.aside.stats()
    }

    pub fn locks(&self) -> &OperationLocks {
        &self.locks
    }
}

#[async_trait]
impl<R: ConnectionStore> ConnectionRecorder for ConnectionService<R> {
    async fn record_connection(
        &self,
        user_id: i64,
        ip_address: &str,
        event_time: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> IpLogsResult<()> {
        ConnectionService::record_connection(self, user_id, ip_address, event_time, cancel).await
    }
}
