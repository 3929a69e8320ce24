//! Collaborator Traits
//!
//! This module defines the seams between the cache-aside core and the systems
//! it coordinates: the cache backend, the durable store, the message broker,
//! and the write side consumed by the ingestion pipeline.
//!
//! # Architecture
//!
//! - `CacheCodec`: pluggable serialization of cached values
//! - `CacheBackend`: key/value store with per-value TTL (Redis, `DashMap`)
//! - `Repository`: specification-driven queries against the durable store
//! - `UnitOfWork`: atomic commit of staged writes
//! - `MessageBroker` / `EventPublisher`: consume and produce connection events
//! - `ConnectionRecorder`: the write operation the ingestion pipeline forwards to
//!
//! # Example: Custom Cache Backend
//!
//! ```rust,ignore
//! use ip_logs_cache::{CacheBackend, async_trait};
//! use std::time::Duration;
//! use anyhow::Result;
//!
//! struct MyCache {
//!     // Your implementation
//! }
//!
//! #[async_trait]
//! impl CacheBackend for MyCache {
//!     async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
//!         // Your implementation
//!     }
//!
//!     async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
//!         // Your implementation
//!     }
//!
//!     async fn remove(&self, key: &str) -> Result<()> {
//!         // Your implementation
//!     }
//!
//!     async fn health_check(&self) -> bool {
//!         // Your implementation
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::IpLogsResult;
use crate::models::ConnectionEvent;
use crate::repository::ChangeSet;
use crate::specification::{Entity, Projection, Specification};

/// Trait for cache value serialization/deserialization
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync + Debug` to support concurrent access
/// across async tasks.
pub trait CacheCodec: Send + Sync + Debug {
    /// Serialize a value to bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented by this codec.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize bytes to a value
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes do not decode to `T`.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Codec name, for logging
    fn name(&self) -> &'static str;
}

/// Key/value cache with per-value TTL
///
/// Unlike a best-effort cache, every operation reports its failures: the
/// cache-aside layer must be able to tell "absent" from "unreachable".
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one instance is shared by every
/// read-path task.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get value from cache by key
    ///
    /// # Returns
    ///
    /// * `Ok(Some(bytes))` - Value present
    /// * `Ok(None)` - Key not found or expired
    /// * `Err(e)` - Cache unavailable
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set value in cache with time-to-live
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Remove value from cache (absent keys are not an error)
    async fn remove(&self, key: &str) -> Result<()>;

    /// Check if cache backend is healthy
    async fn health_check(&self) -> bool;

    /// Backend name, for logging
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Specification-driven read access to one entity set of the durable store
///
/// Implementations must be safe for concurrent use by many read-path tasks.
#[async_trait]
pub trait Repository<E: Entity>: Send + Sync {
    /// First row matching `spec`, if any
    async fn first_or_default(&self, spec: &Specification<E>) -> Result<Option<E>>;

    /// Lazily enumerate the projection of every row matching `projection`
    ///
    /// The row set is fixed when the enumeration is opened; rows committed
    /// afterwards are not merged into it.
    fn stream<R>(&self, projection: Projection<E, R>) -> BoxStream<'static, Result<R>>
    where
        R: Clone + Eq + std::hash::Hash + Send + Sync + 'static;
}

/// Atomic commit of staged writes
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Apply every staged change or none of them
    ///
    /// # Returns
    ///
    /// Number of rows written.
    async fn save_changes(&self, changes: ChangeSet) -> Result<usize>;
}

/// Message pulled from a broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Broker-assigned identifier (stream entry id, channel sequence)
    pub id: String,
    /// UTF-8 payload
    pub body: String,
}

/// Consumer side of the event broker
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Wait for the next message
    ///
    /// # Returns
    ///
    /// * `Ok(Some(message))` - A message is available
    /// * `Ok(None)` - Nothing arrived before the poll window closed, or `cancel` fired
    /// * `Err(IpLogsError::Transport)` - Broker unreachable
    async fn pull(&self, cancel: &CancellationToken) -> IpLogsResult<Option<BrokerMessage>>;

    /// Mark a message as handled
    async fn ack(&self, message: &BrokerMessage) -> IpLogsResult<()>;

    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Producer side of the event broker
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event, returning the broker-assigned id
    async fn publish(&self, event: &ConnectionEvent) -> IpLogsResult<String>;
}

/// Write operation the ingestion pipeline forwards decoded events to
#[async_trait]
pub trait ConnectionRecorder: Send + Sync {
    async fn record_connection(
        &self,
        user_id: i64,
        ip_address: &str,
        event_time: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> IpLogsResult<()>;
}
