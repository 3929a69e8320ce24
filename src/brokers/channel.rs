//! Channel Broker - In-Process Event Broker
//!
//! A bounded tokio channel standing in for the message broker. Messages get
//! sequential ids; acknowledgements are only counted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{IpLogsError, IpLogsResult};
use crate::models::ConnectionEvent;
use crate::traits::{BrokerMessage, EventPublisher, MessageBroker};

const DEFAULT_CAPACITY: usize = 1024;

/// Producer handle for a [`ChannelBroker`]
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<BrokerMessage>,
    next_id: Arc<AtomicU64>,
}

impl ChannelPublisher {
    /// Send an arbitrary body, well-formed or not
    ///
    /// # Errors
    ///
    /// Returns [`IpLogsError::Transport`] if the broker was dropped.
    pub async fn publish_raw(&self, body: impl Into<String>) -> IpLogsResult<String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        self.tx
            .send(BrokerMessage {
                id: id.clone(),
                body: body.into(),
            })
            .await
            .map_err(|_| IpLogsError::transport(anyhow::anyhow!("channel broker closed")))?;
        debug!(id = %id, "Queued message");
        Ok(id)
    }
}

#[async_trait]
impl EventPublisher for ChannelPublisher {
    async fn publish(&self, event: &ConnectionEvent) -> IpLogsResult<String> {
        let body = event.to_json()?;
        self.publish_raw(body).await
    }
}

/// In-process broker over a bounded mpsc channel
///
/// **Example**:
/// ```rust
/// use ip_logs_cache::brokers::ChannelBroker;
/// use ip_logs_cache::models::ConnectionEvent;
/// use ip_logs_cache::traits::{EventPublisher, MessageBroker};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> ip_logs_cache::IpLogsResult<()> {
/// let broker = ChannelBroker::new();
/// broker.publisher().publish(&ConnectionEvent::new(1, "127.0.0.1", chrono::Utc::now())).await?;
///
/// let message = broker.pull(&CancellationToken::new()).await?;
/// assert!(message.is_some());
/// # Ok(())
/// # }
/// ```
pub struct ChannelBroker {
    rx: Mutex<mpsc::Receiver<BrokerMessage>>,
    publisher: ChannelPublisher,
    acked: AtomicU64,
}

impl ChannelBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            rx: Mutex::new(rx),
            publisher: ChannelPublisher {
                tx,
                next_id: Arc::new(AtomicU64::new(1)),
            },
            acked: AtomicU64::new(0),
        }
    }

    pub fn publisher(&self) -> ChannelPublisher {
        self.publisher.clone()
    }

    /// Number of acknowledged messages
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for ChannelBroker {
    async fn pull(&self, cancel: &CancellationToken) -> IpLogsResult<Option<BrokerMessage>> {
        let mut rx = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(None),
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => Ok(None),
            message = rx.recv() => Ok(message),
        }
    }

    async fn ack(&self, message: &BrokerMessage) -> IpLogsResult<()> {
        self.acked.fetch_add(1, Ordering::Relaxed);
        debug!(id = %message.id, "Acknowledged message");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Channel"
    }
}
