//! Typed Cache Client
//!
//! Wraps a byte-level [`CacheBackend`] with a [`CacheCodec`] and a uniform TTL.
//! Every failure (backend or codec) is reported as [`IpLogsError::Cache`];
//! nothing here turns an error into a miss.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error};

use crate::codecs::JsonCodec;
use crate::error::{IpLogsError, IpLogsResult};
use crate::traits::{CacheBackend, CacheCodec};

/// TTL presets for cached query results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheStrategy {
    /// Real-time data - 5 seconds TTL
    #[default]
    RealTime,
    /// Short-term data - 1 minute TTL
    ShortTerm,
    /// Medium-term data - 10 minutes TTL
    MediumTerm,
    /// Custom TTL
    Custom(Duration),
}

impl CacheStrategy {
    /// Convert strategy to duration
    pub fn to_duration(self) -> Duration {
        match self {
            Self::RealTime => Duration::from_secs(5),
            Self::ShortTerm => Duration::from_secs(60),
            Self::MediumTerm => Duration::from_secs(600),
            Self::Custom(duration) => duration,
        }
    }
}

/// Distributed cache contract used by the cache-aside layer
///
/// `try_get` distinguishes "absent" (`Ok(None)`) from "present" and from
/// "unavailable" (`Err`).
pub struct TypedCache<C: CacheCodec = JsonCodec> {
    backend: Arc<dyn CacheBackend>,
    codec: C,
    ttl: Duration,
}

impl TypedCache<JsonCodec> {
    pub fn new(backend: Arc<dyn CacheBackend>, strategy: CacheStrategy) -> Self {
        Self::with_codec(backend, JsonCodec, strategy)
    }
}

impl<C: CacheCodec> TypedCache<C> {
    pub fn with_codec(backend: Arc<dyn CacheBackend>, codec: C, strategy: CacheStrategy) -> Self {
        Self {
            backend,
            codec,
            ttl: strategy.to_duration(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Look up and decode `key`
    ///
    /// # Errors
    ///
    /// Returns [`IpLogsError::Cache`] if the backend fails or the stored bytes
    /// do not decode to `T`.
    pub async fn try_get<T: DeserializeOwned>(&self, key: &str) -> IpLogsResult<Option<T>> {
        let bytes = match self.backend.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(e) => {
                error!(key = %key, backend = self.backend.name(), error = %e, "Error getting cache entry");
                return Err(IpLogsError::cache(e));
            }
        };

        match self.codec.deserialize::<T>(&bytes) {
            Ok(value) => {
                debug!(key = %key, codec = self.codec.name(), "Got value from cache");
                Ok(Some(value))
            }
            Err(e) => {
                error!(key = %key, codec = self.codec.name(), error = %e, "Cached value does not decode");
                Err(IpLogsError::cache(e))
            }
        }
    }

    /// Encode `value` and store it under `key` with the configured TTL
    ///
    /// # Errors
    ///
    /// Returns [`IpLogsError::Cache`] on encode or backend failure.
    pub async fn set<T: Serialize + Sync + ?Sized>(&self, key: &str, value: &T) -> IpLogsResult<()> {
        let bytes = self.codec.serialize(value).map_err(IpLogsError::cache)?;
        self.backend.set_with_ttl(key, &bytes, self.ttl).await.map_err(|e| {
            error!(key = %key, backend = self.backend.name(), error = %e, "Error setting cache entry");
            IpLogsError::cache(e)
        })?;
        debug!(key = %key, ttl_secs = self.ttl.as_secs(), "Set cache entry");
        Ok(())
    }

    /// Remove `key`
    ///
    /// # Errors
    ///
    /// Returns [`IpLogsError::Cache`] on backend failure.
    pub async fn remove(&self, key: &str) -> IpLogsResult<()> {
        self.backend.remove(key).await.map_err(|e| {
            error!(key = %key, backend = self.backend.name(), error = %e, "Error removing cache entry");
            IpLogsError::cache(e)
        })?;
        debug!(key = %key, "Removed cache entry");
        Ok(())
    }
}
