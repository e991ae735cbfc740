//! Dianping Seckill Entry Point
//!
//! Loads configuration, initializes tracing, wires the single-instance
//! in-memory stores and runs the order consumer until Ctrl-C.

use std::sync::Arc;

use dianping_core::{CacheConfig, Clock, ConsumerConfig, SeckillConfig, SystemClock};
use dianping_seckill::telemetry::{init_tracing, TelemetryConfig};
use dianping_seckill::{order_consumer_task, AppState, SeckillContext, ServiceError, ServiceResult};
use dianping_storage::{InMemoryCoordinationStore, InMemoryRecordStore, RecordStore};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> ServiceResult<()> {
    init_tracing(&TelemetryConfig::from_env())?;

    let cache_config = CacheConfig::from_env();
    cache_config.validate()?;
    let seckill_config = SeckillConfig::from_env();
    seckill_config.validate()?;
    let consumer_config = ConsumerConfig::from_env();
    consumer_config.validate()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(InMemoryCoordinationStore::with_clock(Arc::clone(&clock)));
    let records: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
    let context = SeckillContext::new(store, records, clock);

    let state = AppState::build(context, cache_config, seckill_config, &consumer_config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = tokio::spawn(order_consumer_task(
        state.order_consumer(consumer_config),
        shutdown_rx,
    ));

    tracing::info!(
        mode = ?state.pipeline.config().mode,
        stream = %state.pipeline.stream_key(),
        rebuild_workers = state.rebuild_pool.worker_count(),
        "Dianping seckill ready"
    );

    let signal = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let metrics = consumer
        .await
        .map_err(|e| ServiceError::Consumer(e.to_string()))?;
    state.rebuild_pool.shutdown().await;

    let snapshot = metrics.snapshot();
    tracing::info!(
        persisted = snapshot.persisted,
        dead_lettered = snapshot.dead_lettered,
        rebuilds = state.rebuild_pool.snapshot().completed,
        "Dianping seckill stopped"
    );

    signal?;
    Ok(())
}
