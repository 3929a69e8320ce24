//! Redis Streams Broker
//!
//! Events are stream entries with a single `payload` field holding the JSON
//! body. Consumers share a consumer group, so each entry is delivered to one
//! ingestion instance and acknowledged with `XACK` once handled.
//!
//! A pull serves, in order:
//!
//! 1. This consumer's own pending entries (delivered before, never acked),
//!    until the pending list has been drained once
//! 2. Entries of other consumers left pending longer than `claim_idle`
//!    (`XAUTOCLAIM`, Redis 6.2+)
//! 3. New entries, blocking up to `block`
//!
//! The broker connection's response timeout is derived from `block`; a
//! connection handed to [`RedisStreamBroker::from_connection`] must allow at
//! least as long, or replies arriving late in the window are lost.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::streams::{StreamAutoClaimReply, StreamId, StreamReadReply};
use redis::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::{IpLogsError, IpLogsResult};
use crate::models::ConnectionEvent;
use crate::traits::{BrokerMessage, EventPublisher, MessageBroker};

/// Stream entry field carrying the event body
pub const PAYLOAD_FIELD: &str = "payload";

/// Redis Streams consumer/producer
#[derive(Clone)]
pub struct RedisStreamBroker {
    conn: ConnectionManager,
    config: BrokerConfig,
    pending_drained: Arc<AtomicBool>,
}

impl RedisStreamBroker {
    /// Connect and make sure the consumer group exists
    ///
    /// The connection is dedicated to the broker: a blocking read holds up
    /// every other command multiplexed on it.
    ///
    /// # Errors
    ///
    /// Returns an error if Redis is unreachable or the group cannot be created.
    pub async fn connect(redis_url: &str, config: BrokerConfig) -> Result<Self> {
        let client = Client::open(redis_url)
            .with_context(|| format!("Failed to create Redis client with URL: {redis_url}"))?;
        let manager_config = ConnectionManagerConfig::new().set_response_timeout(config.response_timeout());
        let conn = ConnectionManager::new_with_config(client, manager_config)
            .await
            .context("Failed to establish Redis connection manager")?;
        Self::from_connection(conn, config).await
    }

    /// Use an existing connection and make sure the consumer group exists
    ///
    /// The connection's response timeout must exceed `config.block`
    /// (see [`BrokerConfig::response_timeout`]).
    ///
    /// # Errors
    ///
    /// Returns an error if the group cannot be created.
    pub async fn from_connection(conn: ConnectionManager, config: BrokerConfig) -> Result<Self> {
        let broker = Self {
            conn,
            config,
            pending_drained: Arc::new(AtomicBool::new(false)),
        };
        broker.ensure_group().await?;
        info!(
            stream = %broker.config.stream,
            group = %broker.config.group,
            consumer = %broker.config.consumer,
            "Redis stream broker ready"
        );
        Ok(broker)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// `XGROUP CREATE ... 0 MKSTREAM`; an existing group is fine
    async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => {
                info!(stream = %self.config.stream, group = %self.config.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(group = %self.config.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| {
                format!("Failed to create consumer group {} on {}", self.config.group, self.config.stream)
            }),
        }
    }

    /// Publish a raw body (used to inject arbitrary payloads)
    ///
    /// # Errors
    ///
    /// Returns [`IpLogsError::Transport`] if `XADD` fails.
    pub async fn publish_raw(&self, body: &str) -> IpLogsResult<String> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.config.stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.max_len)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(body);

        let id: String = cmd
            .query_async(&mut conn)
            .await
            .with_context(|| format!("XADD to {} failed", self.config.stream))
            .map_err(IpLogsError::transport)?;
        debug!(stream = %self.config.stream, id = %id, "Published event");
        Ok(id)
    }

    fn read_group(&self, start: &str) -> redis::Cmd {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(&self.config.group).arg(&self.config.consumer).arg("COUNT").arg(1);
        if start == ">" {
            let block_ms = u64::try_from(self.config.block.as_millis()).unwrap_or(u64::MAX);
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("STREAMS").arg(&self.config.stream).arg(start);
        cmd
    }

    /// Next entry already delivered to this consumer but never acked
    ///
    /// Once the pending list reads empty it is not consulted again; entries
    /// left pending later are picked up through [`Self::claim_idle`].
    async fn next_pending(&self) -> Option<BrokerMessage> {
        if self.pending_drained.load(Ordering::Acquire) {
            return None;
        }

        let mut conn = self.conn.clone();
        let reply: redis::RedisResult<Option<StreamReadReply>> = self.read_group("0").query_async(&mut conn).await;
        match reply {
            Ok(reply) => {
                let message = reply.and_then(Self::first_entry);
                if message.is_none() {
                    self.pending_drained.store(true, Ordering::Release);
                    debug!(consumer = %self.config.consumer, "Pending entries drained");
                }
                message
            }
            Err(e) => {
                self.pending_drained.store(true, Ordering::Release);
                warn!(consumer = %self.config.consumer, error = %e, "Failed to read pending entries; relying on idle claims");
                None
            }
        }
    }

    /// `XAUTOCLAIM` one entry that has been pending longer than `claim_idle`
    async fn claim_idle(&self) -> IpLogsResult<Option<BrokerMessage>> {
        let mut conn = self.conn.clone();
        let min_idle_ms = u64::try_from(self.config.claim_idle.as_millis()).unwrap_or(u64::MAX);
        let reply: StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg(min_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("XAUTOCLAIM on {} failed", self.config.stream))
            .map_err(IpLogsError::transport)?;

        let message = reply.claimed.into_iter().next().map(Self::to_message);
        if let Some(message) = &message {
            info!(id = %message.id, consumer = %self.config.consumer, "Claimed idle stream entry");
        }
        Ok(message)
    }

    fn first_entry(reply: StreamReadReply) -> Option<BrokerMessage> {
        reply.keys.into_iter().flat_map(|key| key.ids).next().map(Self::to_message)
    }

    fn to_message(entry: StreamId) -> BrokerMessage {
        let body = entry.get::<String>(PAYLOAD_FIELD).unwrap_or_else(|| {
            warn!(id = %entry.id, field = PAYLOAD_FIELD, "Stream entry has no payload field");
            String::new()
        });
        BrokerMessage { id: entry.id, body }
    }
}

#[async_trait]
impl MessageBroker for RedisStreamBroker {
    async fn pull(&self, cancel: &CancellationToken) -> IpLogsResult<Option<BrokerMessage>> {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        if let Some(message) = self.next_pending().await {
            debug!(id = %message.id, "Redelivering pending stream entry");
            return Ok(Some(message));
        }
        if let Some(message) = self.claim_idle().await? {
            return Ok(Some(message));
        }

        let mut conn = self.conn.clone();
        let cmd = self.read_group(">");
        let read = async {
            let reply: Option<StreamReadReply> = cmd.query_async(&mut conn).await?;
            Ok::<_, redis::RedisError>(reply)
        };

        let reply = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(None),
            reply = read => reply
                .with_context(|| format!("XREADGROUP on {} failed", self.config.stream))
                .map_err(IpLogsError::transport)?,
        };

        Ok(reply.and_then(Self::first_entry))
    }

    async fn ack(&self, message: &BrokerMessage) -> IpLogsResult<()> {
        let mut conn = self.conn.clone();
        let acked: i64 = redis::cmd("XACK")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg(&message.id)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("XACK {} failed", message.id))
            .map_err(IpLogsError::transport)?;
        debug!(id = %message.id, acked, "Acknowledged stream entry");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "RedisStreams"
    }
}

#[async_trait]
impl EventPublisher for RedisStreamBroker {
    async fn publish(&self, event: &ConnectionEvent) -> IpLogsResult<String> {
        let body = event.to_json()?;
        self.publish_raw(&body).await
    }
}
