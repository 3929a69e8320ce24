//! Ingest and Query Example
//!
//! Publishes a few connection events to a Redis stream, runs the ingestion
//! pipeline until they are recorded, then serves the three read queries
//! through the Redis cache.
//!
//! Run with: cargo run --example ingest_and_query
//! (stop early with Ctrl-C)

use futures_util::TryStreamExt;
use ip_logs_cache::{
    ConnectionEvent, ConnectionServiceBuilder, EventPublisher, IngestionPipeline, IpLogsConfig, MemoryStore,
    RedisStreamBroker, init_tracing,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    println!("=== IP Logs: Ingest and Query ===\n");

    let config = IpLogsConfig::from_env()?;
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(ConnectionServiceBuilder::from_config(&config).build(Arc::clone(&store)).await?);
    let broker = Arc::new(RedisStreamBroker::connect(&config.redis_url, config.broker.clone()).await?);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    // 1. Publish events
    let events = [
        (1, "127.0.0.1"),
        (1, "127.0.0.2"),
        (2, "127.0.0.1"),
        (3, "127.0.1.7"),
        (4, "10.0.0.4"),
    ];
    println!("Publishing {} events to '{}'...", events.len(), config.broker.stream);
    for (user_id, ip) in events {
        let id = broker.publish(&ConnectionEvent::new(user_id, ip, chrono::Utc::now())).await?;
        println!("  Published user {user_id} from {ip} as {id}");
    }
    println!();

    // 2. Ingest
    let pipeline = IngestionPipeline::new(Arc::clone(&broker), Arc::clone(&service), config.poll_delay);
    let handle = pipeline.start(cancel.clone());

    let expected = events.len() as u64;
    while pipeline.stats().processed < expected && !cancel.is_cancelled() {
        tokio::select! {
            () = cancel.cancelled() => {}
            () = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
    println!("Ingestion stats: {:?}\n", pipeline.stats());

    // 3. Query
    if !cancel.is_cancelled() {
        let last = service.get_last_connection(1, &cancel).await?;
        println!("Last connection of user 1: {last:?}");

        let history: Vec<String> = service.get_ip_history(1, &cancel).try_collect().await?;
        println!("IP history of user 1: {history:?}");

        let users: Vec<i64> = service.find_users_by_ip_prefix("127.0.", &cancel).try_collect().await?;
        println!("Users seen on 127.0.*: {users:?}");

        // Second read is served from cache
        let _ = service.get_last_connection(1, &cancel).await?;
        let stats = service.stats();
        println!("\nCache stats: {stats:?} (hit rate {:.1}%)", stats.hit_rate());
    }

    cancel.cancel();
    handle.await?;
    println!("\nStored rows: {} users, {} history entries", store.users().len(), store.history().len());

    Ok(())
}
