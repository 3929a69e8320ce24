//! Query Specifications
//!
//! Declarative descriptions of the queries the service issues: a list of
//! predicates (ANDed), a read mode, and for projections a selector plus a
//! distinct flag. A repository evaluates them; the specifications themselves
//! carry no behavior beyond describing the query.
//!
//! # Example
//!
//! ```rust
//! use ip_logs_cache::specification::{HistorySpecification, UserSpecification, ReadMode};
//!
//! let by_id = UserSpecification::by_id(42, ReadMode::Untracked);
//! assert_eq!(by_id.criteria().len(), 1);
//!
//! let ips = HistorySpecification::ip_addresses_of(42);
//! assert!(ips.is_distinct());
//! ```

use std::fmt;
use std::sync::Arc;

use crate::models::{ConnectionHistoryEntry, UserConnectionState};

/// Row type that can be the subject of a specification
pub trait Entity: Clone + Send + Sync + 'static {
    /// Logical table name, for logging
    const TABLE: &'static str;
}

impl Entity for UserConnectionState {
    const TABLE: &'static str = "users";
}

impl Entity for ConnectionHistoryEntry {
    const TABLE: &'static str = "user_ips";
}

/// Whether the caller intends to mutate what it reads
///
/// Only meaningful to store adapters that track loaded rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    Tracked,
    #[default]
    Untracked,
}

/// One filter predicate with a human-readable description
#[derive(Clone)]
pub struct Criterion<E> {
    description: String,
    predicate: Arc<dyn Fn(&E) -> bool + Send + Sync>,
}

impl<E> Criterion<E> {
    pub fn new(description: impl Into<String>, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        Self {
            description: description.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn matches(&self, row: &E) -> bool {
        (self.predicate)(row)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl<E> fmt::Debug for Criterion<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

/// Filter over rows of `E`
#[derive(Clone)]
pub struct Specification<E> {
    criteria: Vec<Criterion<E>>,
    read_mode: ReadMode,
}

impl<E> Specification<E> {
    #[must_use]
    pub fn new(read_mode: ReadMode) -> Self {
        Self {
            criteria: Vec::new(),
            read_mode,
        }
    }

    #[must_use]
    pub fn with_criterion(mut self, criterion: Criterion<E>) -> Self {
        self.criteria.push(criterion);
        self
    }

    pub fn criteria(&self) -> &[Criterion<E>] {
        &self.criteria
    }

    pub fn read_mode(&self) -> ReadMode {
        self.read_mode
    }

    /// All criteria hold for `row` (vacuously true when there are none)
    pub fn is_satisfied_by(&self, row: &E) -> bool {
        self.criteria.iter().all(|c| c.matches(row))
    }
}

impl<E> fmt::Debug for Specification<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Specification")
            .field("criteria", &self.criteria)
            .field("read_mode", &self.read_mode)
            .finish()
    }
}

/// Filter plus selector: yields one `R` per matching row of `E`
#[derive(Clone)]
pub struct Projection<E, R> {
    filter: Specification<E>,
    selector: Arc<dyn Fn(&E) -> R + Send + Sync>,
    distinct: bool,
}

impl<E, R> Projection<E, R> {
    pub fn new(filter: Specification<E>, selector: impl Fn(&E) -> R + Send + Sync + 'static) -> Self {
        Self {
            filter,
            selector: Arc::new(selector),
            distinct: false,
        }
    }

    #[must_use]
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn filter(&self) -> &Specification<E> {
        &self.filter
    }

    pub fn criteria(&self) -> &[Criterion<E>] {
        self.filter.criteria()
    }

    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    pub fn select(&self, row: &E) -> R {
        (self.selector)(row)
    }
}

impl<E, R> fmt::Debug for Projection<E, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Projection")
            .field("filter", &self.filter)
            .field("distinct", &self.distinct)
            .finish_non_exhaustive()
    }
}

/// Queries over current user state
pub struct UserSpecification;

impl UserSpecification {
    pub fn by_id(id: i64, read_mode: ReadMode) -> Specification<UserConnectionState> {
        Specification::new(read_mode)
            .with_criterion(Criterion::new(format!("id == {id}"), move |u: &UserConnectionState| u.id == id))
    }
}

/// Queries over connection history
pub struct HistorySpecification;

impl HistorySpecification {
    /// Distinct IP addresses a user has connected from, in store order
    pub fn ip_addresses_of(user_id: i64) -> Projection<ConnectionHistoryEntry, String> {
        let filter = Specification::new(ReadMode::Untracked).with_criterion(Criterion::new(
            format!("user_id == {user_id}"),
            move |e: &ConnectionHistoryEntry| e.user_id == user_id,
        ));
        Projection::new(filter, |e: &ConnectionHistoryEntry| e.ip_address.clone()).distinct()
    }

    /// Distinct users that connected from an address starting with `prefix`
    ///
    /// Plain case-sensitive prefix match; `%`, `*` and `_` have no special meaning.
    pub fn users_by_ip_prefix(prefix: impl Into<String>) -> Projection<ConnectionHistoryEntry, i64> {
        let prefix = prefix.into();
        let filter = Specification::new(ReadMode::Untracked).with_criterion(Criterion::new(
            format!("ip_address starts_with {prefix:?}"),
            move |e: &ConnectionHistoryEntry| e.ip_address.starts_with(prefix.as_str()),
        ));
        Projection::new(filter, |e: &ConnectionHistoryEntry| e.user_id).distinct()
    }
}
