//! Shared harness for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use dianping_core::{
    CacheConfig, CacheStrategy, ConsumerConfig, DispatchMode, SeckillConfig, VoucherId,
    VoucherInventory,
};
use dianping_seckill::{order_consumer_task, AppState, ConsumerMetrics, OrderConsumer, SeckillContext};
use dianping_storage::{DistributedLock, InMemoryCoordinationStore};
use dianping_test_utils::{eventually, fixtures, in_memory_stack, MemoryStack};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub type Store = InMemoryCoordinationStore;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub stack: MemoryStack,
    pub state: AppState<Store>,
}

/// Fresh stores and services. Must run inside a tokio runtime.
pub fn harness(mode: DispatchMode, strategy: CacheStrategy) -> Harness {
    build(mode, strategy, None)
}

/// Harness whose order and refresh locks come from `lock` instead of the
/// coordination store.
pub fn harness_with_lock(mode: DispatchMode, lock: Arc<dyn DistributedLock>) -> Harness {
    build(mode, CacheStrategy::LogicalExpiry, Some(lock))
}

fn build(mode: DispatchMode, strategy: CacheStrategy, lock: Option<Arc<dyn DistributedLock>>) -> Harness {
    let stack = in_memory_stack();
    let mut context = SeckillContext::new(
        Arc::clone(&stack.coordination),
        stack.records_dyn(),
        stack.clock_dyn(),
    );
    if let Some(lock) = lock {
        context = context.with_lock(lock);
    }
    let state = AppState::build(
        context,
        CacheConfig::development().with_strategy(strategy),
        SeckillConfig::development().with_mode(mode),
        &ConsumerConfig::development(),
    );
    Harness { stack, state }
}

pub fn stream_harness() -> Harness {
    harness(DispatchMode::Stream, CacheStrategy::LogicalExpiry)
}

impl Harness {
    /// Publish a voucher whose sale is open now.
    pub async fn publish(&self, id: u64, stock: u32) -> VoucherId {
        let voucher = fixtures::open_voucher(id, stock, self.stack.now());
        self.publish_inventory(&voucher).await;
        voucher.voucher_id
    }

    pub async fn publish_inventory(&self, voucher: &VoucherInventory) {
        self.state
            .pipeline
            .publish_voucher(voucher)
            .await
            .expect("publish voucher");
    }

    pub fn consumer(&self, config: ConsumerConfig) -> OrderConsumer<Store> {
        self.state.order_consumer(config)
    }

    pub fn spawn_consumer(&self, config: ConsumerConfig) -> RunningConsumer {
        let consumer = self.consumer(config);
        let metrics = consumer.metrics();
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(order_consumer_task(consumer, rx));
        RunningConsumer {
            shutdown,
            handle,
            metrics,
        }
    }

    pub async fn wait_for_orders(&self, n: usize) -> bool {
        let records = Arc::clone(&self.stack.records);
        eventually(WAIT, || {
            let records = Arc::clone(&records);
            async move { records.order_total().await == n }
        })
        .await
    }
}

pub struct RunningConsumer {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Arc<ConsumerMetrics>>,
    pub metrics: Arc<ConsumerMetrics>,
}

impl RunningConsumer {
    pub async fn wait_until<F>(&self, check: F) -> bool
    where
        F: Fn(&ConsumerMetrics) -> bool,
    {
        eventually(WAIT, || {
            let ok = check(self.metrics.as_ref());
            async move { ok }
        })
        .await
    }

    pub async fn stop(self) -> Arc<ConsumerMetrics> {
        let _ = self.shutdown.send(true);
        self.handle.await.expect("consumer task panicked")
    }
}
