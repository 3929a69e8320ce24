//! IP Logs Cache
//!
//! A user connection log with a concurrency-safe cache-aside read layer:
//! - **Cache-Aside Resolver**: double-checked point lookups that cache "not found" too
//! - **Streaming Materializer**: multi-row results streamed to the caller and
//!   cached whole once the store enumeration completes
//! - **Population Locks**: one mutex per operation kind (or per key) bounds
//!   concurrent store queries during a miss storm
//! - **Event Ingestion**: Redis Streams consumer feeding the write path, with
//!   per-message failure isolation
//! - **Pluggable Backends**: Redis or in-process cache, memory store, channel broker
//!
//! # Quick Start
//!
//! ```rust
//! use ip_logs_cache::{ConnectionServiceBuilder, DashMapCache, MemoryStore};
//! use futures_util::TryStreamExt;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = ConnectionServiceBuilder::new()
//!         .with_cache(Arc::new(DashMapCache::new()))
//!         .build(Arc::new(MemoryStore::new()))
//!         .await?;
//!     let cancel = CancellationToken::new();
//!
//!     service.record_connection(42, "127.0.0.1", chrono::Utc::now(), &cancel).await?;
//!
//!     let last = service.get_last_connection(42, &cancel).await?;
//!     assert_eq!(last.ip_address.as_deref(), Some("127.0.0.1"));
//!
//!     let ips: Vec<String> = service.get_ip_history(42, &cancel).try_collect().await?;
//!     let users: Vec<i64> = service.find_users_by_ip_prefix("127.0.", &cancel).try_collect().await?;
//!     assert_eq!((ips.len(), users), (1, vec![42]));
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! Broker → IngestionPipeline → ConnectionService::record_connection → Store commit → Cache invalidate
//!
//! Caller → ConnectionService::get_* → Cache hit ─────────────────────────────→ Return
//!                                     ↓ miss
//!                                     Population lock → Cache re-check → Store → Cache set
//! ```

pub mod backends;
pub mod brokers;
pub mod builder;
pub mod cache_aside;
pub mod codecs;
pub mod config;
pub mod error;
pub mod ingestion;
pub mod locks;
pub mod models;
pub mod repository;
pub mod service;
pub mod specification;
pub mod traits;
pub mod typed_cache;

pub use backends::{DashMapCache, RedisCache};
pub use brokers::{ChannelBroker, ChannelPublisher, RedisStreamBroker};
pub use builder::ConnectionServiceBuilder;
pub use cache_aside::{CacheAside, CacheAsideStats};
pub use codecs::JsonCodec;
pub use config::{BrokerConfig, IpLogsConfig, init_tracing};
pub use error::{ErrorKind, IpLogsError, IpLogsResult};
pub use ingestion::{ConsumeOutcome, IngestionPipeline, IngestionStats};
pub use locks::{LockStrategy, OperationLocks, PopulationLock};
pub use models::{ConnectionEvent, ConnectionHistoryEntry, LastConnection, UserConnectionState};
pub use repository::{ChangeSet, DuplicateKey, MemoryStore};
pub use service::{ConnectionService, ConnectionStore, Operation};
pub use specification::{HistorySpecification, Projection, ReadMode, Specification, UserSpecification};
pub use traits::{
    BrokerMessage, CacheBackend, CacheCodec, ConnectionRecorder, EventPublisher, MessageBroker, Repository, UnitOfWork,
};
pub use typed_cache::{CacheStrategy, TypedCache};

// Re-export async_trait for custom backend implementations
pub use async_trait::async_trait;
