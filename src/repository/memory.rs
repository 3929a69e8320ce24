//! Memory Store - In-Process Durable Store Adapter
//!
//! Keeps both tables behind one `RwLock` and evaluates specifications
//! directly against the rows. Streams snapshot the matching rows when they are
//! opened and project them lazily as the caller polls.

use anyhow::{Result, bail};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, info};

use super::{Change, ChangeSet, DuplicateKey};
use crate::models::{ConnectionHistoryEntry, UserConnectionState};
use crate::specification::{Entity, Projection, Specification};
use crate::traits::{Repository, UnitOfWork};

#[derive(Debug, Default)]
struct Tables {
    users: BTreeMap<i64, UserConnectionState>,
    history: Vec<ConnectionHistoryEntry>,
    next_history_id: i64,
}

/// In-process store for current user state and connection history
///
/// **Use Case**: demos, tests, single-process deployments without a database
///
/// **Features**:
/// - Atomic multi-row commits via [`ChangeSet`]
/// - History ids assigned on commit, starting at 1
/// - Snapshot-at-open streaming with distinct projections in store order
///
/// **Example**:
/// ```rust
/// use ip_logs_cache::repository::{ChangeSet, MemoryStore};
/// use ip_logs_cache::models::ConnectionHistoryEntry;
/// use ip_logs_cache::traits::UnitOfWork;
///
/// # async fn example() -> anyhow::Result<()> {
/// let store = MemoryStore::new();
/// let mut changes = ChangeSet::new();
/// changes.append_history(ConnectionHistoryEntry::pending(1, "127.0.0.1", chrono::Utc::now()));
/// assert_eq!(store.save_changes(changes).await?, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("Initializing in-memory connection store");
        Self::default()
    }

    /// Snapshot of the current-state table, ordered by user id
    pub fn users(&self) -> Vec<UserConnectionState> {
        self.tables.read().users.values().cloned().collect()
    }

    /// Snapshot of the history table, in insertion order
    pub fn history(&self) -> Vec<ConnectionHistoryEntry> {
        self.tables.read().history.clone()
    }

    fn first_matching<'a, E: Entity>(rows: impl IntoIterator<Item = &'a E>, spec: &Specification<E>) -> Option<E> {
        rows.into_iter().find(|row| spec.is_satisfied_by(row)).cloned()
    }

    fn project<E, R>(rows: Vec<E>, projection: Projection<E, R>) -> BoxStream<'static, Result<R>>
    where
        E: Entity,
        R: Clone + Eq + Hash + Send + Sync + 'static,
    {
        let mut seen = HashSet::new();
        let projected = rows.into_iter().filter_map(move |row| {
            let value = projection.select(&row);
            if projection.is_distinct() && !seen.insert(value.clone()) {
                return None;
            }
            Some(Ok(value))
        });
        stream::iter(projected).boxed()
    }

    fn validate(tables: &Tables, changes: &ChangeSet) -> Result<()> {
        let mut inserted = HashSet::new();
        for change in changes.iter() {
            match change {
                Change::Insert(user) => {
                    if tables.users.contains_key(&user.id) || !inserted.insert(user.id) {
                        return Err(DuplicateKey {
                            table: UserConnectionState::TABLE,
                            id: user.id,
                        }
                        .into());
                    }
                }
                Change::Overwrite { id, .. } => {
                    if !tables.users.contains_key(id) && !inserted.contains(id) {
                        bail!("cannot overwrite user {id}: row not found");
                    }
                }
                Change::AppendHistory(_) => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Repository<UserConnectionState> for MemoryStore {
    async fn first_or_default(&self, spec: &Specification<UserConnectionState>) -> Result<Option<UserConnectionState>> {
        debug!(table = UserConnectionState::TABLE, ?spec, "[Memory] first_or_default");
        let tables = self.tables.read();
        Ok(Self::first_matching(tables.users.values(), spec))
    }

    fn stream<R>(&self, projection: Projection<UserConnectionState, R>) -> BoxStream<'static, Result<R>>
    where
        R: Clone + Eq + Hash + Send + Sync + 'static,
    {
        debug!(table = UserConnectionState::TABLE, ?projection, "[Memory] stream");
        let rows: Vec<_> = {
            let tables = self.tables.read();
            tables
                .users
                .values()
                .filter(|u| projection.filter().is_satisfied_by(u))
                .cloned()
                .collect()
        };
        Self::project(rows, projection)
    }
}

#[async_trait]
impl Repository<ConnectionHistoryEntry> for MemoryStore {
    async fn first_or_default(&self, spec: &Specification<ConnectionHistoryEntry>) -> Result<Option<ConnectionHistoryEntry>> {
        debug!(table = ConnectionHistoryEntry::TABLE, ?spec, "[Memory] first_or_default");
        let tables = self.tables.read();
        Ok(Self::first_matching(tables.history.iter(), spec))
    }

    fn stream<R>(&self, projection: Projection<ConnectionHistoryEntry, R>) -> BoxStream<'static, Result<R>>
    where
        R: Clone + Eq + Hash + Send + Sync + 'static,
    {
        debug!(table = ConnectionHistoryEntry::TABLE, ?projection, "[Memory] stream");
        let rows: Vec<_> = {
            let tables = self.tables.read();
            tables
                .history
                .iter()
                .filter(|e| projection.filter().is_satisfied_by(e))
                .cloned()
                .collect()
        };
        Self::project(rows, projection)
    }
}

#[async_trait]
impl UnitOfWork for MemoryStore {
    async fn save_changes(&self, changes: ChangeSet) -> Result<usize> {
        let mut tables = self.tables.write();
        Self::validate(&tables, &changes)?;

        let written = changes.len();
        for change in changes {
            match change {
                Change::Insert(user) | Change::Overwrite { values: user, .. } => {
                    tables.users.insert(user.id, user);
                }
                Change::AppendHistory(mut entry) => {
                    tables.next_history_id += 1;
                    entry.id = tables.next_history_id;
                    tables.history.push(entry);
                }
            }
        }

        debug!(rows = written, "[Memory] Committed changes");
        Ok(written)
    }
}
