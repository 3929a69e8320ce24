//! Event Ingestion Pipeline
//!
//! Pulls connection events from a [`MessageBroker`] one at a time, decodes
//! them and forwards them to a [`ConnectionRecorder`]. A failure only affects
//! the message at hand; the loop keeps going until it is cancelled.
//!
//! Every handled message is acknowledged, including ones that failed to
//! decode or to record. There is no dead-letter handling.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, IpLogsError, IpLogsResult};
use crate::models::ConnectionEvent;
use crate::traits::{BrokerMessage, ConnectionRecorder, MessageBroker};

/// Result of one iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Nothing was pulled (poll window elapsed or cancelled)
    Idle,
    /// The event was recorded
    Processed(ConnectionEvent),
}

/// Statistics for the ingestion loop
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestionStats {
    /// Iterations that pulled nothing
    pub idle_polls: u64,
    /// Events recorded
    pub processed: u64,
    /// Messages dropped because the body did not decode
    pub decode_errors: u64,
    /// Broker pull or ack failures
    pub transport_errors: u64,
    /// Decoded events whose write failed
    pub processing_errors: u64,
}

#[derive(Debug, Default)]
struct AtomicIngestionStats {
    idle_polls: AtomicU64,
    processed: AtomicU64,
    decode_errors: AtomicU64,
    transport_errors: AtomicU64,
    processing_errors: AtomicU64,
}

impl AtomicIngestionStats {
    fn snapshot(&self) -> IngestionStats {
        IngestionStats {
            idle_polls: self.idle_polls.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
        }
    }
}

/// Broker-to-service ingestion loop
pub struct IngestionPipeline<B, S> {
    broker: Arc<B>,
    recorder: Arc<S>,
    poll_delay: Duration,
    stats: Arc<AtomicIngestionStats>,
}

impl<B, S> Clone for IngestionPipeline<B, S> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            recorder: Arc::clone(&self.recorder),
            poll_delay: self.poll_delay,
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<B, S> IngestionPipeline<B, S>
where
    B: MessageBroker + 'static,
    S: ConnectionRecorder + 'static,
{
    pub fn new(broker: Arc<B>, recorder: Arc<S>, poll_delay: Duration) -> Self {
        Self {
            broker,
            recorder,
            poll_delay,
            stats: Arc::new(AtomicIngestionStats::default()),
        }
    }

    pub fn stats(&self) -> IngestionStats {
        self.stats.snapshot()
    }

    /// Pull, decode and record at most one message
    ///
    /// # Errors
    ///
    /// - [`IpLogsError::Transport`] if the pull fails
    /// - [`IpLogsError::Decode`] if the body is not a connection event
    /// - whatever the recorder returns for a decoded event
    ///
    /// The message is acknowledged in every case except cancellation.
    pub async fn consume_once(&self, cancel: &CancellationToken) -> IpLogsResult<ConsumeOutcome> {
        let Some(message) = self.broker.pull(cancel).await? else {
            return Ok(ConsumeOutcome::Idle);
        };

        let result = self.handle(&message, cancel).await;
        if matches!(result, Err(IpLogsError::Cancelled)) {
            return result;
        }

        if let Err(e) = self.broker.ack(&message).await {
            warn!(id = %message.id, broker = self.broker.name(), error = %e, "Failed to acknowledge message");
            self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn handle(&self, message: &BrokerMessage, cancel: &CancellationToken) -> IpLogsResult<ConsumeOutcome> {
        let event = ConnectionEvent::from_json(&message.body)?;
        if cancel.is_cancelled() {
            return Err(IpLogsError::Cancelled);
        }

        self.recorder
            .record_connection(event.user_id, &event.ip_address, event.event_time_utc, cancel)
            .await?;
        debug!(id = %message.id, user_id = event.user_id, ip = %event.ip_address, "Processed connection event");
        Ok(ConsumeOutcome::Processed(event))
    }

    /// Run until `cancel` fires
    ///
    /// Each iteration is followed by `poll_delay`; cancellation interrupts both
    /// the pull and the delay.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(broker = self.broker.name(), poll_delay_ms = self.poll_delay.as_millis(), "Ingestion pipeline started");

        while !cancel.is_cancelled() {
            match self.consume_once(&cancel).await {
                Ok(ConsumeOutcome::Idle) => {
                    self.stats.idle_polls.fetch_add(1, Ordering::Relaxed);
                }
                Ok(ConsumeOutcome::Processed(_)) => {
                    self.stats.processed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => self.record_failure(&e),
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.poll_delay) => {}
            }
        }

        info!(stats = ?self.stats(), "Ingestion pipeline stopped");
    }

    fn record_failure(&self, e: &IpLogsError) {
        match e.kind() {
            ErrorKind::Decode => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                if e.is_protocol_violation() {
                    error!(error = %e, "Message body is not JSON; dropping message");
                } else {
                    warn!(error = %e, "Message is not a connection event; dropping message");
                }
            }
            ErrorKind::Transport => {
                self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, broker = self.broker.name(), "Broker consume failed");
            }
            ErrorKind::Store | ErrorKind::Cache | ErrorKind::Unexpected | ErrorKind::Cancelled => {
                self.stats.processing_errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, kind = e.kind().as_str(), "Failed to record connection event");
            }
        }
    }

    /// Spawn [`run`](Self::run) on the tokio runtime
    pub fn start(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.run(cancel).await })
    }
}
