//! Error taxonomy
//!
//! Backends and adapters report failures through `anyhow` with context. The
//! service façade and the ingestion pipeline classify those failures into
//! [`IpLogsError`] so callers (and the ingestion loop) can decide what to do
//! with them.

use thiserror::Error;

/// Result alias used by the service façade
pub type IpLogsResult<T> = std::result::Result<T, IpLogsError>;

/// Error kinds surfaced by the connection log
#[derive(Debug, Error)]
pub enum IpLogsError {
    /// Durable store unavailable or query failure. Never retried here.
    #[error("store error: {0:#}")]
    Store(#[source] anyhow::Error),

    /// Cache unavailable or (de)serialization failure. Never treated as a miss.
    #[error("cache error: {0:#}")]
    Cache(#[source] anyhow::Error),

    /// Message body could not be decoded into a connection event
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Broker-level consume failure (connectivity, protocol)
    #[error("transport error: {0:#}")]
    Transport(#[source] anyhow::Error),

    /// The operation observed its cancellation signal
    #[error("operation cancelled")]
    Cancelled,

    /// Anything not covered above
    #[error("unexpected error: {0:#}")]
    Unexpected(#[source] anyhow::Error),
}

/// Coarse classification used for logging and loop policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Store,
    Cache,
    Decode,
    Transport,
    Cancelled,
    Unexpected,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Cache => "cache",
            Self::Decode => "decode",
            Self::Transport => "transport",
            Self::Cancelled => "cancelled",
            Self::Unexpected => "unexpected",
        }
    }
}

impl IpLogsError {
    pub fn store(err: impl Into<anyhow::Error>) -> Self {
        Self::Store(err.into())
    }

    pub fn cache(err: impl Into<anyhow::Error>) -> Self {
        Self::Cache(err.into())
    }

    pub fn transport(err: impl Into<anyhow::Error>) -> Self {
        Self::Transport(err.into())
    }

    pub fn unexpected(err: impl Into<anyhow::Error>) -> Self {
        Self::Unexpected(err.into())
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(_) => ErrorKind::Store,
            Self::Cache(_) => ErrorKind::Cache,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    /// Whether a decode failure points at a broken wire protocol (the body is
    /// not JSON at all) rather than one event with a bad shape.
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        use serde_json::error::Category;

        match self {
            Self::Decode(e) => matches!(e.classify(), Category::Syntax | Category::Eof | Category::Io),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
