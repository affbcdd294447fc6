//! Standalone reaper process.
//!
//! Connects to Redis, then requeues expired leases and reaps dead workers
//! every `FAIRQ_REAPER_INTERVAL_MS` until interrupted.

use std::sync::Arc;

use anyhow::Context;

use fairq_core::SystemClock;
use fairq_infra::config::QueueConfig;
use fairq_infra::event_bus::RedisPubSubNotificationBus;
use fairq_infra::service::TaskService;
use fairq_infra::store::RedisKvStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fairq_observability::init();

    let config = QueueConfig::from_env();
    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| {
        tracing::warn!("REDIS_URL not set; using redis://localhost:6379");
        "redis://localhost:6379".to_string()
    });

    let store = RedisKvStore::new(&redis_url).context("failed to open redis store")?;
    let bus = RedisPubSubNotificationBus::new(&redis_url, config.key_prefix.clone())
        .context("failed to open redis notification bus")?;

    let interval = config.reaper_interval;
    let service = TaskService::new(Arc::new(store), Arc::new(bus), SystemClock::shared(), config);
    let handle = service
        .reaper()
        .spawn(interval)
        .context("failed to start reaper thread")?;
    tracing::info!(redis_url = %redis_url, "reaper running; press ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;

    let stats = handle.stats();
    tracing::info!(
        passes = stats.passes,
        requeued = stats.requeued,
        dead_lettered = stats.dead_lettered,
        dead_workers = stats.dead_workers,
        "shutting down reaper"
    );
    tokio::task::spawn_blocking(move || handle.shutdown())
        .await
        .context("reaper thread panicked")?;
    Ok(())
}
