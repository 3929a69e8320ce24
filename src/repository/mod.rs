//! Durable Store Adapters
//!
//! A [`ChangeSet`] collects the writes of one logical operation (insert or
//! overwrite of the current-state row plus the history append) so that a
//! [`UnitOfWork`](crate::traits::UnitOfWork) can commit them atomically.
//!
//! # Available Stores
//!
//! - **`MemoryStore`** - In-process tables evaluated with the specification
//!   objects; used by the demo and the test-suite

pub mod memory;

pub use memory::MemoryStore;

use crate::models::{ConnectionHistoryEntry, UserConnectionState};

/// Commit rejected because an inserted row's key already exists
///
/// Stores return it inside their `anyhow::Error` so callers can downcast and
/// retry the write as an overwrite.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("duplicate key: {table} row {id} already exists")]
pub struct DuplicateKey {
    pub table: &'static str,
    pub id: i64,
}

/// One staged write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Insert a current-state row that must not exist yet
    Insert(UserConnectionState),
    /// Overwrite every field of an existing row, keeping its key
    Overwrite { id: i64, values: UserConnectionState },
    /// Append a history row (id assigned by the store)
    AppendHistory(ConnectionHistoryEntry),
}

/// Writes staged for one commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a new current-state row
    pub fn add(&mut self, user: UserConnectionState) -> &mut Self {
        self.changes.push(Change::Insert(user));
        self
    }

    /// Stage an in-place overwrite of `existing` with the fields of `current`
    pub fn set_values(&mut self, existing: &UserConnectionState, current: UserConnectionState) -> &mut Self {
        self.changes.push(Change::Overwrite {
            id: existing.id,
            values: UserConnectionState { id: existing.id, ..current },
        });
        self
    }

    /// Stage a history append
    pub fn append_history(&mut self, entry: ConnectionHistoryEntry) -> &mut Self {
        self.changes.push(Change::AppendHistory(entry));
        self
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Change> {
        self.changes.iter()
    }
}

impl IntoIterator for ChangeSet {
    type Item = Change;
    type IntoIter = std::vec::IntoIter<Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}
