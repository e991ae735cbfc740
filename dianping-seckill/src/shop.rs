//! Cached shop listing reads.
//!
//! Reads go through `CacheClient` using the configured strategy; writes go to
//! the record store first and then drop the cached copy.

use std::sync::Arc;

use async_trait::async_trait;
use dianping_core::{CacheConfig, CacheStrategy, DianpingResult, Shop, ShopId};
use dianping_storage::{CacheClient, CacheRead, CoordinationStore, Loader, RebuildPool, RecordStore};

use crate::constants::CACHE_SHOP_KEY;
use crate::state::SeckillContext;

/// Loads shops from the record store.
pub struct ShopLoader {
    records: Arc<dyn RecordStore>,
}

impl ShopLoader {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl Loader<ShopId, Shop> for ShopLoader {
    async fn load(&self, id: &ShopId) -> DianpingResult<Option<Shop>> {
        self.records.shop_get(*id).await
    }
}

pub struct ShopService<S: CoordinationStore> {
    cache: CacheClient<S>,
    records: Arc<dyn RecordStore>,
    loader: Arc<dyn Loader<ShopId, Shop>>,
}

impl<S: CoordinationStore> ShopService<S> {
    pub fn new(context: &SeckillContext<S>, pool: Arc<RebuildPool>, config: CacheConfig) -> Self {
        let loader: Arc<dyn Loader<ShopId, Shop>> =
            Arc::new(ShopLoader::new(Arc::clone(&context.records)));
        Self::with_loader(context, pool, config, loader)
    }

    /// Service reading through a custom loader.
    pub fn with_loader(
        context: &SeckillContext<S>,
        pool: Arc<RebuildPool>,
        config: CacheConfig,
        loader: Arc<dyn Loader<ShopId, Shop>>,
    ) -> Self {
        let cache = CacheClient::new(
            Arc::clone(&context.store),
            Arc::clone(&context.lock),
            pool,
            Arc::clone(&context.tokens),
            Arc::clone(&context.clock),
            config,
        );
        Self {
            cache,
            records: Arc::clone(&context.records),
            loader,
        }
    }

    pub fn cache(&self) -> &CacheClient<S> {
        &self.cache
    }

    /// Look up a shop.
    ///
    /// With logical expiry a shop that was never warmed reads as `None`, and
    /// an expired entry is served stale while one background refresh runs.
    /// With passthrough a miss loads from the record store, and ids that do
    /// not exist are remembered for the null TTL.
    pub async fn query_by_id(&self, id: ShopId) -> DianpingResult<Option<CacheRead<Shop>>> {
        let ttl = self.cache.config().ttl;
        match self.cache.config().strategy {
            CacheStrategy::LogicalExpiry => {
                self.cache
                    .query_with_logical_expiry(CACHE_SHOP_KEY, id, Arc::clone(&self.loader), ttl)
                    .await
            }
            CacheStrategy::Passthrough => {
                self.cache
                    .query_or_load(CACHE_SHOP_KEY, &id, &*self.loader, ttl)
                    .await
            }
        }
    }

    /// Populate the cache entry for `id` ahead of traffic. Returns `false`
    /// when the shop does not exist.
    pub async fn warm(&self, id: ShopId) -> DianpingResult<bool> {
        let Some(shop) = self.loader.load(&id).await? else {
            return Ok(false);
        };
        let key = dianping_storage::cache_key(CACHE_SHOP_KEY, &id);
        let ttl = self.cache.config().ttl;
        match self.cache.config().strategy {
            CacheStrategy::LogicalExpiry => self.cache.set_with_logical_expiry(&key, &shop, ttl).await?,
            CacheStrategy::Passthrough => self.cache.set(&key, &shop, ttl).await?,
        }
        tracing::debug!(shop_id = %id, "Shop cache warmed");
        Ok(true)
    }

    /// Write the shop, then drop its cache entry. Unknown shops fail with
    /// `StoreError::NotFound` and leave the cache untouched.
    pub async fn update(&self, shop: &Shop) -> DianpingResult<()> {
        self.records.shop_update(shop).await?;
        self.cache.invalidate(CACHE_SHOP_KEY, &shop.shop_id).await?;
        tracing::debug!(shop_id = %shop.shop_id, "Shop updated, cache entry invalidated");
        Ok(())
    }
}

impl<S: CoordinationStore> std::fmt::Debug for ShopService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShopService")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
