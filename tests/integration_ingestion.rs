//! Integration tests for the event ingestion pipeline
//!
//! Channel broker → pipeline → connection service over a counting store.

mod common;

use common::*;
use futures_util::TryStreamExt;
use ip_logs_cache::{
    ChannelBroker, ConnectionEvent, EventPublisher, IngestionPipeline, LockStrategy, MessageBroker,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const POLL_DELAY: Duration = Duration::from_millis(1);

/// A malformed message does not stop later messages from being processed
#[tokio::test]
async fn test_malformed_message_does_not_stop_loop() {
    let store = Arc::new(CountingStore::new());
    let (service, _) = service_with(Arc::clone(&store), LockStrategy::PerOperation);
    let service = Arc::new(service);
    let broker = Arc::new(ChannelBroker::new());
    let publisher = broker.publisher();

    publisher.publish_raw("{\"userId\": 1, \"ipAddr").await.unwrap();
    publisher.publish_raw(r#"{"userId":"one","ipAddress":"127.0.0.1","eventTimeUtc":"2024-03-01T10:00:00Z"}"#).await.unwrap();
    publisher
        .publish(&ConnectionEvent::new(1, "127.0.0.1", at(10, 0)))
        .await
        .unwrap();

    let pipeline = IngestionPipeline::new(Arc::clone(&broker), Arc::clone(&service), POLL_DELAY);
    let cancel = CancellationToken::new();
    let handle = pipeline.start(cancel.clone());

    assert!(wait_for(|| pipeline.stats().processed == 1, 2000).await);
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap_or_else(|_| panic!("pipeline did not stop on cancellation"))
        .unwrap();

    let stats = pipeline.stats();
    assert_eq!(stats.decode_errors, 2);
    assert_eq!(stats.processed, 1);
    assert_eq!(broker.acked(), 3);

    let last = service.get_last_connection(1, &cancel_free()).await.unwrap();
    assert_eq!(last.ip_address.as_deref(), Some("127.0.0.1"));
    assert_eq!(last.last_connection_time, Some(at(10, 0)));
}

/// Events from older producers (PascalCase, no offset) are accepted
#[tokio::test]
async fn test_legacy_wire_format_is_ingested() {
    let store = Arc::new(CountingStore::new());
    let (service, _) = service_with(Arc::clone(&store), LockStrategy::PerOperation);
    let service = Arc::new(service);
    let broker = Arc::new(ChannelBroker::new());

    broker
        .publisher()
        .publish_raw(r#"{"UserId":9,"IpAddress":"10.9.9.9","EventTime":"2024-03-01T06:15:00"}"#)
        .await
        .unwrap();

    let pipeline = IngestionPipeline::new(Arc::clone(&broker), Arc::clone(&service), POLL_DELAY);
    pipeline.consume_once(&CancellationToken::new()).await.unwrap();

    let history: Vec<String> = service.get_ip_history(9, &cancel_free()).try_collect().await.unwrap();
    assert_eq!(history, vec!["10.9.9.9"]);
    assert_eq!(store.inner.users()[0].last_connection_time_utc, at(6, 15));
}

/// Store failures are counted and the loop carries on
#[tokio::test]
async fn test_store_failure_is_isolated() {
    let store = Arc::new(CountingStore::new());
    store.fail_queries.store(true, std::sync::atomic::Ordering::SeqCst);
    let (service, _) = service_with(Arc::clone(&store), LockStrategy::PerOperation);
    let broker = Arc::new(ChannelBroker::new());
    let publisher = broker.publisher();
    for user in 1..=3 {
        publisher.publish(&ConnectionEvent::new(user, "10.0.0.1", at(1, 0))).await.unwrap();
    }

    let pipeline = IngestionPipeline::new(Arc::clone(&broker), Arc::new(service), POLL_DELAY);
    let cancel = CancellationToken::new();
    let handle = pipeline.start(cancel.clone());

    assert!(wait_for(|| pipeline.stats().processing_errors == 3, 2000).await);
    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(pipeline.stats().processed, 0);
    assert_eq!(broker.acked(), 3);
    assert!(store.inner.history().is_empty());
}

/// Cancellation interrupts the blocking pull of an idle loop
#[tokio::test]
async fn test_cancellation_stops_idle_loop() {
    let store = Arc::new(CountingStore::new());
    let (service, _) = service_with(store, LockStrategy::PerOperation);
    let broker = Arc::new(ChannelBroker::new());

    let pipeline = IngestionPipeline::new(Arc::clone(&broker), Arc::new(service), Duration::from_secs(60));
    let cancel = CancellationToken::new();
    let handle = pipeline.start(cancel.clone());

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap_or_else(|_| panic!("pipeline did not stop on cancellation"))
        .unwrap();

    // Nothing is consumed after cancellation
    broker
        .publisher()
        .publish(&ConnectionEvent::new(1, "127.0.0.1", at(1, 0)))
        .await
        .unwrap();
    assert_eq!(pipeline.stats().processed, 0);
    assert!(broker.pull(&CancellationToken::new()).await.unwrap().is_some());
}

fn cancel_free() -> CancellationToken {
    CancellationToken::new()
}
