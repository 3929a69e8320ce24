//! Cache Codec Implementations
//!
//! Built-in implementations of [`CacheCodec`](crate::traits::CacheCodec).
//! Cached values are opaque to the cache backend; the codec only has to
//! round-trip the value types the service stores.

mod json;
pub use json::JsonCodec;
