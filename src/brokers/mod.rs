//! Event Broker Implementations
//!
//! # Available Brokers
//!
//! - **Redis Streams** - Consumer-group delivery with `XREADGROUP`/`XACK`; the
//!   production broker
//! - **Channel** - In-process tokio channel; demos and tests
//!
//! Both carry the event as a UTF-8 JSON body and implement the consumer
//! ([`MessageBroker`](crate::traits::MessageBroker)) and producer
//! ([`EventPublisher`](crate::traits::EventPublisher)) sides.

pub mod channel;
pub mod redis_streams;

pub use channel::{ChannelBroker, ChannelPublisher};
pub use redis_streams::RedisStreamBroker;
