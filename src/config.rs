//! Configuration
//!
//! Settings come from environment variables with defaults that work against a
//! local Redis. Only binaries call [`init_tracing`]; the library never installs
//! a subscriber.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::locks::LockStrategy;

/// Default Redis endpoint
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Event broker settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Redis stream carrying connection events
    pub stream: String,
    /// Consumer group shared by all ingestion instances
    pub group: String,
    /// This instance's consumer name within the group
    pub consumer: String,
    /// How long one pull blocks waiting for a message (zero blocks forever)
    pub block: Duration,
    /// Approximate upper bound on stream length when publishing
    pub max_len: usize,
    /// Pending entries of other consumers idle this long are claimed
    pub claim_idle: Duration,
}

/// Headroom between the `BLOCK` window and the client response timeout
const RESPONSE_GRACE: Duration = Duration::from_secs(1);

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            stream: "ip-logs:events".to_string(),
            group: "ip-logs".to_string(),
            consumer: format!("consumer-{}", uuid::Uuid::new_v4()),
            block: Duration::from_millis(1000),
            max_len: 100_000,
            claim_idle: Duration::from_secs(30),
        }
    }
}

impl BrokerConfig {
    /// Client response timeout for the broker connection
    ///
    /// Always longer than `block`, so a reply the server sends at the end of
    /// the window is still read. `None` when `block` is zero.
    pub fn response_timeout(&self) -> Option<Duration> {
        (!self.block.is_zero()).then(|| self.block + RESPONSE_GRACE)
    }
}

/// Connection log settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpLogsConfig {
    pub redis_url: String,
    /// TTL applied to every cached query result
    pub cache_ttl: Duration,
    pub lock_strategy: LockStrategy,
    /// Delay between ingestion iterations
    pub poll_delay: Duration,
    pub broker: BrokerConfig,
}

impl Default for IpLogsConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            cache_ttl: Duration::from_secs(5),
            lock_strategy: LockStrategy::default(),
            poll_delay: Duration::from_millis(1000),
            broker: BrokerConfig::default(),
        }
    }
}

impl IpLogsConfig {
    /// Read settings from the environment
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `REDIS_URL` | `redis://127.0.0.1:6379` |
    /// | `IPLOGS_CACHE_TTL_SECS` | `5` |
    /// | `IPLOGS_LOCK_STRATEGY` | `per-operation` |
    /// | `IPLOGS_POLL_DELAY_MS` | `1000` |
    /// | `IPLOGS_STREAM` | `ip-logs:events` |
    /// | `IPLOGS_CONSUMER_GROUP` | `ip-logs` |
    /// | `IPLOGS_CONSUMER_NAME` | `consumer-<uuid>` |
    /// | `IPLOGS_BLOCK_MS` | `1000` |
    /// | `IPLOGS_STREAM_MAXLEN` | `100000` |
    /// | `IPLOGS_CLAIM_IDLE_MS` | `30000` |
    ///
    /// # Errors
    ///
    /// Returns an error naming the variable if a value does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source
    ///
    /// # Errors
    ///
    /// Returns an error naming the variable if a value does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let broker = BrokerConfig {
            stream: lookup("IPLOGS_STREAM").unwrap_or(defaults.broker.stream),
            group: lookup("IPLOGS_CONSUMER_GROUP").unwrap_or(defaults.broker.group),
            consumer: lookup("IPLOGS_CONSUMER_NAME").unwrap_or(defaults.broker.consumer),
            block: parse_var(&lookup, "IPLOGS_BLOCK_MS")?.map_or(defaults.broker.block, Duration::from_millis),
            max_len: parse_var(&lookup, "IPLOGS_STREAM_MAXLEN")?.unwrap_or(defaults.broker.max_len),
            claim_idle: parse_var(&lookup, "IPLOGS_CLAIM_IDLE_MS")?
                .map_or(defaults.broker.claim_idle, Duration::from_millis),
        };

        Ok(Self {
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            cache_ttl: parse_var(&lookup, "IPLOGS_CACHE_TTL_SECS")?.map_or(defaults.cache_ttl, Duration::from_secs),
            lock_strategy: parse_var(&lookup, "IPLOGS_LOCK_STRATEGY")?.unwrap_or(defaults.lock_strategy),
            poll_delay: parse_var(&lookup, "IPLOGS_POLL_DELAY_MS")?.map_or(defaults.poll_delay, Duration::from_millis),
            broker,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("{e}"))
                .with_context(|| format!("invalid value {raw:?} for {name}"))
        })
        .transpose()
}

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `info`)
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
