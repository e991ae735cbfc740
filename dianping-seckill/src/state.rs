//! Shared service state.

use std::fmt;
use std::sync::Arc;

use dianping_core::{CacheConfig, Clock, ConsumerConfig, HolderTokens, SeckillConfig};
use dianping_storage::{CoordinationStore, DistributedLock, RebuildPool, RecordStore, StoreLock};

use crate::jobs::OrderConsumer;
use crate::pipeline::SeckillPipeline;
use crate::shop::ShopService;

/// Handles to the external collaborators, shared by every service object.
pub struct SeckillContext<S: CoordinationStore> {
    pub store: Arc<S>,
    pub records: Arc<dyn RecordStore>,
    pub lock: Arc<dyn DistributedLock>,
    pub tokens: Arc<HolderTokens>,
    pub clock: Arc<dyn Clock>,
}

impl<S: CoordinationStore> SeckillContext<S> {
    /// Context whose lock lives in the same coordination store.
    pub fn new(store: Arc<S>, records: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            lock: Arc::new(StoreLock::new(Arc::clone(&store))),
            store,
            records,
            tokens: Arc::new(HolderTokens::new()),
            clock,
        }
    }

    pub fn with_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = lock;
        self
    }
}

impl<S: CoordinationStore> Clone for SeckillContext<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            records: Arc::clone(&self.records),
            lock: Arc::clone(&self.lock),
            tokens: Arc::clone(&self.tokens),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S: CoordinationStore> fmt::Debug for SeckillContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeckillContext")
            .field("tokens", &self.tokens)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Application-wide state: what a request handler reaches for.
pub struct AppState<S: CoordinationStore> {
    pub context: SeckillContext<S>,
    pub pipeline: Arc<SeckillPipeline<S>>,
    pub shops: Arc<ShopService<S>>,
    /// Owned here so shutdown can drain it.
    pub rebuild_pool: Arc<RebuildPool>,
}

impl<S: CoordinationStore> AppState<S> {
    /// Wire the services. Spawns the rebuild workers, so it must run inside a
    /// tokio runtime.
    pub fn build(
        context: SeckillContext<S>,
        cache: CacheConfig,
        seckill: SeckillConfig,
        consumer: &ConsumerConfig,
    ) -> Self {
        let rebuild_pool = Arc::new(RebuildPool::from_config(&cache));
        let pipeline = Arc::new(SeckillPipeline::new(&context, seckill, &consumer.stream_key));
        let shops = Arc::new(ShopService::new(&context, Arc::clone(&rebuild_pool), cache));
        Self {
            context,
            pipeline,
            shops,
            rebuild_pool,
        }
    }

    /// The order consumer matching this state's pipeline.
    pub fn order_consumer(&self, config: ConsumerConfig) -> OrderConsumer<S> {
        OrderConsumer::new(&self.context, config, self.pipeline.config().order_lock_lease)
    }
}

impl<S: CoordinationStore> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            pipeline: Arc::clone(&self.pipeline),
            shops: Arc::clone(&self.shops),
            rebuild_pool: Arc::clone(&self.rebuild_pool),
        }
    }
}
