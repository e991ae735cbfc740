//! Cache-aside client with stampede protection.
//!
//! Two read strategies:
//!
//! - `query_or_load`: passthrough. A miss calls the loader; a missing id is
//!   remembered with an empty sentinel for `null_ttl` so repeated lookups of
//!   ids that do not exist never reach the record store.
//! - `query_with_logical_expiry`: entries never physically expire and carry
//!   their own `expireTime`. An expired entry is still served; one caller per
//!   key wins the refresh lock and hands the reload to the `RebuildPool`.
//!   No reader ever waits on a reload.

use super::loader::Loader;
use super::pool::RebuildPool;
use super::read::CacheRead;
use crate::coordination::CoordinationStore;
use crate::lock::DistributedLock;
use dianping_core::{
    CacheConfig, Clock, ConfigError, DianpingResult, HolderToken, HolderTokens, LogicalEntry,
    StoreError, Timestamp,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Value cached for ids the record store does not have.
pub const EMPTY_SENTINEL: &str = "";

/// `<prefix><id>`, e.g. `cache:shop:1`.
pub fn cache_key(prefix: &str, id: &impl fmt::Display) -> String {
    format!("{prefix}{id}")
}

/// Lock resource guarding the refresh of `key`; stored as `lock:cache:<key>`.
pub fn refresh_lock_resource(key: &str) -> String {
    format!("cache:{key}")
}

fn to_chrono(ttl: Duration) -> DianpingResult<chrono::Duration> {
    chrono::Duration::from_std(ttl).map_err(|e| {
        ConfigError::InvalidValue {
            field: "ttl".to_string(),
            value: format!("{ttl:?}"),
            reason: e.to_string(),
        }
        .into()
    })
}

async fn write_envelope<S, T>(store: &S, key: &str, value: &T, expire_time: Timestamp) -> DianpingResult<()>
where
    S: CoordinationStore + ?Sized,
    T: Serialize + ?Sized,
{
    let raw = serde_json::to_string(&LogicalEntry::new(value, expire_time)).map_err(StoreError::codec)?;
    store.set(key, &raw, None).await
}

/// What a background refresh did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshOutcome {
    Rewritten,
    Removed,
}

async fn refresh<S, L, Id, T>(
    store: &S,
    loader: &L,
    id: &Id,
    key: &str,
    expire_time: Timestamp,
) -> DianpingResult<RefreshOutcome>
where
    S: CoordinationStore + ?Sized,
    L: Loader<Id, T> + ?Sized,
    Id: Send + Sync + 'static,
    T: Serialize + Send + 'static,
{
    match loader.load(id).await? {
        Some(value) => {
            write_envelope(store, key, &value, expire_time).await?;
            Ok(RefreshOutcome::Rewritten)
        }
        None => {
            store.delete(key).await?;
            Ok(RefreshOutcome::Removed)
        }
    }
}

pub struct CacheClient<S: CoordinationStore> {
    store: Arc<S>,
    lock: Arc<dyn DistributedLock>,
    pool: Arc<RebuildPool>,
    tokens: Arc<HolderTokens>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
}

impl<S: CoordinationStore> Clone for CacheClient<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            lock: Arc::clone(&self.lock),
            pool: Arc::clone(&self.pool),
            tokens: Arc::clone(&self.tokens),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
        }
    }
}

impl<S: CoordinationStore> fmt::Debug for CacheClient<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheClient")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: CoordinationStore> CacheClient<S> {
    pub fn new(
        store: Arc<S>,
        lock: Arc<dyn DistributedLock>,
        pool: Arc<RebuildPool>,
        tokens: Arc<HolderTokens>,
        clock: Arc<dyn Clock>,
        config: CacheConfig,
    ) -> Self {
        Self {
            store,
            lock,
            pool,
            tokens,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<RebuildPool> {
        &self.pool
    }

    /// Write `value` as JSON with a physical TTL.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> DianpingResult<()> {
        let raw = serde_json::to_string(value).map_err(StoreError::codec)?;
        self.store.set(key, &raw, Some(ttl)).await
    }

    /// Write `value` in a logical-expiry envelope that stays valid for `ttl`.
    /// This is the out-of-band warm-up the logical-expiry read path relies on.
    pub async fn set_with_logical_expiry<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> DianpingResult<()> {
        let expire_time = self.clock.now() + to_chrono(ttl)?;
        write_envelope(&*self.store, key, value, expire_time).await
    }

    /// Drop the cached value so the next read goes to the record store.
    pub async fn invalidate(&self, prefix: &str, id: &impl fmt::Display) -> DianpingResult<bool> {
        self.store.delete(&cache_key(prefix, id)).await
    }

    /// Passthrough read with null caching.
    pub async fn query_or_load<Id, T, L>(
        &self,
        prefix: &str,
        id: &Id,
        loader: &L,
        ttl: Duration,
    ) -> DianpingResult<Option<CacheRead<T>>>
    where
        Id: fmt::Display + Send + Sync + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
        L: Loader<Id, T> + ?Sized,
    {
        let key = cache_key(prefix, id);
        if let Some(raw) = self.store.get(&key).await? {
            if raw == EMPTY_SENTINEL {
                return Ok(None);
            }
            match serde_json::from_str::<T>(&raw) {
                Ok(value) => return Ok(Some(CacheRead::from_cache(value, None))),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                    self.store.delete(&key).await?;
                }
            }
        }

        match loader.load(id).await? {
            Some(value) => {
                self.set(&key, &value, ttl).await?;
                Ok(Some(CacheRead::from_loader(value)))
            }
            None => {
                tracing::debug!(key = %key, "Caching empty sentinel for missing id");
                self.store
                    .set(&key, EMPTY_SENTINEL, Some(self.config.null_ttl))
                    .await?;
                Ok(None)
            }
        }
    }

    /// Logical-expiry read. Absent keys are not loaded: the cache must be
    /// warmed with `set_with_logical_expiry` first.
    pub async fn query_with_logical_expiry<Id, T, L>(
        &self,
        prefix: &str,
        id: Id,
        loader: Arc<L>,
        ttl: Duration,
    ) -> DianpingResult<Option<CacheRead<T>>>
    where
        Id: fmt::Display + Send + Sync + 'static,
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        L: Loader<Id, T> + ?Sized,
    {
        let key = cache_key(prefix, &id);
        let Some(entry) = self.read_envelope::<T>(&key).await? else {
            return Ok(None);
        };
        if !entry.is_expired(self.clock.now()) {
            return Ok(Some(CacheRead::from_cache(entry.data, Some(entry.expire_time))));
        }

        let resource = refresh_lock_resource(&key);
        let token = self.tokens.next_token();
        if !self.lock.try_lock(&resource, &token, self.config.lock_lease).await? {
            tracing::trace!(key = %key, "Refresh in flight elsewhere, serving stale entry");
            return Ok(Some(CacheRead::stale(entry.data, entry.expire_time)));
        }

        // Someone may have finished a refresh between our read and the lock.
        let rechecked = match self.read_envelope::<T>(&key).await {
            Ok(rechecked) => rechecked,
            Err(e) => {
                self.release(&resource, &token).await;
                return Err(e);
            }
        };
        if let Some(fresh) = rechecked {
            if !fresh.is_expired(self.clock.now()) {
                self.release(&resource, &token).await;
                return Ok(Some(CacheRead::from_cache(fresh.data, Some(fresh.expire_time))));
            }
        }

        let lifetime = match to_chrono(ttl) {
            Ok(lifetime) => lifetime,
            Err(e) => {
                self.release(&resource, &token).await;
                return Err(e);
            }
        };
        let job = {
            let store = Arc::clone(&self.store);
            let lock = Arc::clone(&self.lock);
            let clock = Arc::clone(&self.clock);
            let key = key.clone();
            let resource = resource.clone();
            let token = token.clone();
            async move {
                let expire_time = clock.now() + lifetime;
                match refresh::<S, L, Id, T>(&*store, &*loader, &id, &key, expire_time).await {
                    Ok(RefreshOutcome::Rewritten) => {
                        tracing::debug!(key = %key, expire_time = %expire_time, "Cache entry refreshed");
                    }
                    Ok(RefreshOutcome::Removed) => {
                        tracing::info!(key = %key, "Source record gone, cache entry removed");
                    }
                    Err(e) => {
                        tracing::error!(key = %key, error = %e, "Cache refresh failed, keeping stale entry");
                    }
                }
                if let Err(e) = lock.unlock(&resource, &token).await {
                    tracing::warn!(key = %key, error = %e, "Failed to release refresh lock");
                }
            }
        };

        if let Err(e) = self.pool.try_submit(job) {
            tracing::warn!(key = %key, error = %e, "Cache refresh not scheduled, serving stale entry");
            self.release(&resource, &token).await;
        }
        Ok(Some(CacheRead::stale(entry.data, entry.expire_time)))
    }

    async fn read_envelope<T: DeserializeOwned>(&self, key: &str) -> DianpingResult<Option<LogicalEntry<T>>> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Discarding corrupt logical-expiry envelope");
                self.store.delete(key).await?;
                Ok(None)
            }
        }
    }

    async fn release(&self, resource: &str, token: &HolderToken) {
        if let Err(e) = self.lock.unlock(resource, token).await {
            tracing::warn!(resource = %resource, error = %e, "Failed to release refresh lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::StoreLock;
    use crate::memory::InMemoryCoordinationStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use crate::cache::ReadSource;
    use dianping_core::{Backend, ManualClock};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    const PREFIX: &str = "cache:item:";

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: u64,
        version: u32,
    }

    /// Loader backed by a mutable "database" row, counting calls.
    struct RowLoader {
        calls: AtomicU32,
        version: AtomicU32,
        present: AtomicBool,
        fail: AtomicBool,
        delay: Duration,
    }

    impl RowLoader {
        fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicU32::new(0),
                version: AtomicU32::new(1),
                present: AtomicBool::new(true),
                fail: AtomicBool::new(false),
                delay,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Loader<u64, Item> for RowLoader {
        async fn load(&self, id: &u64) -> DianpingResult<Option<Item>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::unavailable(Backend::Records, "db down").into());
            }
            if !self.present.load(Ordering::SeqCst) {
                return Ok(None);
            }
            Ok(Some(Item {
                id: *id,
                version: self.version.load(Ordering::SeqCst),
            }))
        }
    }

    struct Fixture {
        store: Arc<InMemoryCoordinationStore>,
        clock: Arc<ManualClock>,
        client: CacheClient<InMemoryCoordinationStore>,
    }

    fn fixture(workers: usize, queue: usize) -> Fixture {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let client = CacheClient::new(
            Arc::clone(&store),
            Arc::new(StoreLock::new(Arc::clone(&store))),
            Arc::new(RebuildPool::new(workers, queue)),
            Arc::new(HolderTokens::new()),
            clock.clone(),
            CacheConfig::default(),
        );
        Fixture { store, clock, client }
    }

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn test_passthrough_miss_then_hit() {
        let fx = fixture(1, 4);
        let loader = RowLoader::new(Duration::ZERO);

        let first = fx.client.query_or_load(PREFIX, &1u64, &loader, TTL).await.unwrap().unwrap();
        assert!(!first.was_cache_hit());
        let second = fx.client.query_or_load(PREFIX, &1u64, &loader, TTL).await.unwrap().unwrap();
        assert!(second.was_cache_hit());
        assert_eq!(second.into_value(), Item { id: 1, version: 1 });
        assert_eq!(loader.calls(), 1);
        assert_eq!(fx.store.ttl_remaining("cache:item:1"), Some(TTL));
    }

    #[tokio::test(start_paused = true)]
    async fn test_passthrough_caches_missing_ids() {
        let fx = fixture(1, 4);
        let loader = RowLoader::new(Duration::ZERO);
        loader.present.store(false, Ordering::SeqCst);

        for _ in 0..5 {
            let read: Option<CacheRead<Item>> =
                fx.client.query_or_load(PREFIX, &404u64, &loader, TTL).await.unwrap();
            assert!(read.is_none());
        }
        assert_eq!(loader.calls(), 1);
        assert_eq!(fx.store.get("cache:item:404").await.unwrap().as_deref(), Some(""));
        assert_eq!(
            fx.store.ttl_remaining("cache:item:404"),
            Some(CacheConfig::default().null_ttl)
        );

        // Once the sentinel expires the loader is consulted again.
        tokio::time::advance(CacheConfig::default().null_ttl).await;
        let _ = fx.client.query_or_load(PREFIX, &404u64, &loader, TTL).await.unwrap();
        assert_eq!(loader.calls(), 2);
    }

    #[tokio::test]
    async fn test_passthrough_corrupt_entry_is_a_miss() {
        let fx = fixture(1, 4);
        fx.store.set("cache:item:1", "{not json", None).await.unwrap();
        let loader = RowLoader::new(Duration::ZERO);
        let read = fx.client.query_or_load(PREFIX, &1u64, &loader, TTL).await.unwrap().unwrap();
        assert_eq!(read.source(), ReadSource::Loader);
        assert_eq!(loader.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let fx = fixture(1, 4);
        let loader = RowLoader::new(Duration::ZERO);
        fx.client.query_or_load(PREFIX, &1u64, &loader, TTL).await.unwrap();
        loader.version.store(2, Ordering::SeqCst);
        assert!(fx.client.invalidate(PREFIX, &1u64).await.unwrap());
        let read = fx.client.query_or_load(PREFIX, &1u64, &loader, TTL).await.unwrap().unwrap();
        assert_eq!(read.value().version, 2);
    }

    #[tokio::test]
    async fn test_logical_absent_key_never_loads() {
        let fx = fixture(1, 4);
        let loader = Arc::new(RowLoader::new(Duration::ZERO));
        let read: Option<CacheRead<Item>> = fx
            .client
            .query_with_logical_expiry(PREFIX, 1u64, Arc::clone(&loader), TTL)
            .await
            .unwrap();
        assert!(read.is_none());
        assert_eq!(loader.calls(), 0);
    }

    #[tokio::test]
    async fn test_logical_fresh_entry_is_served_directly() {
        let fx = fixture(1, 4);
        let loader = Arc::new(RowLoader::new(Duration::ZERO));
        fx.client
            .set_with_logical_expiry("cache:item:1", &Item { id: 1, version: 1 }, TTL)
            .await
            .unwrap();
        let read = fx
            .client
            .query_with_logical_expiry(PREFIX, 1u64, Arc::clone(&loader), TTL)
            .await
            .unwrap()
            .unwrap();
        assert!(!read.is_stale());
        assert_eq!(loader.calls(), 0);
    }

    #[tokio::test]
    async fn test_logical_expired_entry_serves_stale_and_refreshes_once() {
        let fx = fixture(2, 4);
        let loader = Arc::new(RowLoader::new(Duration::ZERO));
        fx.client
            .set_with_logical_expiry("cache:item:1", &Item { id: 1, version: 1 }, TTL)
            .await
            .unwrap();
        loader.version.store(2, Ordering::SeqCst);
        fx.clock.advance(chrono::Duration::seconds(31));

        let read = fx
            .client
            .query_with_logical_expiry(PREFIX, 1u64, Arc::clone(&loader), TTL)
            .await
            .unwrap()
            .unwrap();
        assert!(read.is_stale());
        assert_eq!(read.value().version, 1);

        fx.client.pool().shutdown().await;
        assert_eq!(loader.calls(), 1);
        assert_eq!(fx.store.get("lock:cache:cache:item:1").await.unwrap(), None);

        let raw = fx.store.get("cache:item:1").await.unwrap().unwrap();
        let entry: LogicalEntry<Item> = serde_json::from_str(&raw).unwrap();
        assert_eq!(entry.data.version, 2);
        assert!(!entry.is_expired(fx.clock.now()));
    }

    #[tokio::test]
    async fn test_logical_refresh_removes_vanished_record() {
        let fx = fixture(1, 4);
        let loader = Arc::new(RowLoader::new(Duration::ZERO));
        fx.client
            .set_with_logical_expiry("cache:item:1", &Item { id: 1, version: 1 }, TTL)
            .await
            .unwrap();
        loader.present.store(false, Ordering::SeqCst);
        fx.clock.advance(chrono::Duration::seconds(31));

        fx.client
            .query_with_logical_expiry(PREFIX, 1u64, Arc::clone(&loader), TTL)
            .await
            .unwrap();
        fx.client.pool().shutdown().await;
        assert_eq!(fx.store.get("cache:item:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_logical_refresh_failure_keeps_stale_and_releases_lock() {
        let fx = fixture(1, 4);
        let loader = Arc::new(RowLoader::new(Duration::ZERO));
        fx.client
            .set_with_logical_expiry("cache:item:1", &Item { id: 1, version: 1 }, TTL)
            .await
            .unwrap();
        loader.fail.store(true, Ordering::SeqCst);
        fx.clock.advance(chrono::Duration::seconds(31));

        fx.client
            .query_with_logical_expiry(PREFIX, 1u64, Arc::clone(&loader), TTL)
            .await
            .unwrap();
        fx.client.pool().shutdown().await;

        assert_eq!(loader.calls(), 1);
        assert!(fx.store.get("cache:item:1").await.unwrap().is_some());
        assert_eq!(fx.store.get("lock:cache:cache:item:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_logical_closed_pool_releases_lock_and_serves_stale() {
        let fx = fixture(1, 4);
        fx.client.pool().shutdown().await;
        let loader = Arc::new(RowLoader::new(Duration::ZERO));
        fx.client
            .set_with_logical_expiry("cache:item:1", &Item { id: 1, version: 1 }, TTL)
            .await
            .unwrap();
        fx.clock.advance(chrono::Duration::seconds(31));

        let read = fx
            .client
            .query_with_logical_expiry(PREFIX, 1u64, Arc::clone(&loader), TTL)
            .await
            .unwrap()
            .unwrap();
        assert!(read.is_stale());
        assert_eq!(loader.calls(), 0);
        assert_eq!(fx.store.get("lock:cache:cache:item:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_logical_corrupt_envelope_is_deleted() {
        let fx = fixture(1, 4);
        fx.store.set("cache:item:1", "\"just a string\"", None).await.unwrap();
        let loader = Arc::new(RowLoader::new(Duration::ZERO));
        let read: Option<CacheRead<Item>> = fx
            .client
            .query_with_logical_expiry(PREFIX, 1u64, loader, TTL)
            .await
            .unwrap();
        assert!(read.is_none());
        assert_eq!(fx.store.get("cache:item:1").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_readers_trigger_single_refresh() {
        let fx = fixture(4, 16);
        let loader = Arc::new(RowLoader::new(Duration::from_millis(200)));
        fx.client
            .set_with_logical_expiry("cache:item:7", &Item { id: 7, version: 1 }, TTL)
            .await
            .unwrap();
        loader.version.store(2, Ordering::SeqCst);
        fx.clock.advance(chrono::Duration::seconds(60));

        let mut readers = Vec::new();
        for _ in 0..64 {
            let client = fx.client.clone();
            let loader = Arc::clone(&loader);
            readers.push(tokio::spawn(async move {
                let started = tokio::time::Instant::now();
                let read = client
                    .query_with_logical_expiry(PREFIX, 7u64, loader, TTL)
                    .await
                    .unwrap()
                    .unwrap();
                (read, started.elapsed())
            }));
        }
        for reader in readers {
            let (read, waited) = reader.await.unwrap();
            // Nobody waits for the 200ms reload.
            assert!(waited < Duration::from_millis(150), "reader blocked for {waited:?}");
            assert!(read.is_stale() || read.value().version == 2);
        }

        fx.client.pool().shutdown().await;
        assert_eq!(loader.calls(), 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_envelope_is_immediately_expired() {
        let fx = fixture(1, 4);
        fx.client
            .set_with_logical_expiry("cache:item:1", &Item { id: 1, version: 1 }, Duration::ZERO)
            .await
            .unwrap();
        let raw = fx.store.get("cache:item:1").await.unwrap().unwrap();
        let entry: LogicalEntry<Item> = serde_json::from_str(&raw).unwrap();
        assert!(entry.is_expired(fx.clock.now()));
    }
}
