//! Configuration types
//!
//! Every config has a `Default`, a `from_env()` reading `DIANPING_*`
//! variables (unparseable values fall back to the default) and a
//! `development()` preset with short timings.

use crate::{ConfigError, DianpingError, DianpingResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CACHE_TTL_SECS: u64 = 30 * 60;
pub const DEFAULT_CACHE_NULL_TTL_SECS: u64 = 2 * 60;
pub const DEFAULT_CACHE_LOCK_LEASE_SECS: u64 = 10;
pub const DEFAULT_REBUILD_WORKERS: usize = 10;
pub const DEFAULT_REBUILD_QUEUE: usize = 64;

pub const DEFAULT_ORDER_LOCK_LEASE_SECS: u64 = 30;
pub const DEFAULT_ID_BUCKET: &str = "order";

pub const DEFAULT_STREAM_KEY: &str = "stream.orders";
pub const DEFAULT_CONSUMER_GROUP: &str = "g1";
pub const DEFAULT_CONSUMER_NAME: &str = "c1";
pub const DEFAULT_CONSUMER_BLOCK_MS: u64 = 2000;
pub const DEFAULT_CONSUMER_BATCH: usize = 1;
pub const DEFAULT_MAX_DELIVERIES: u32 = 16;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 20;
pub const DEFAULT_DEAD_LETTER_KEY: &str = "stream.orders.dlq";

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn require_nonzero(field: &str, value: u128) -> DianpingResult<()> {
    if value == 0 {
        return Err(DianpingError::Config(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: format!("{field} must be greater than 0"),
        }));
    }
    Ok(())
}

// ============================================================================
// CACHE
// ============================================================================

/// Which read strategy listing lookups use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// Logical expiry with background refresh. Needs a warmed cache.
    #[default]
    LogicalExpiry,
    /// Cache-aside with null caching.
    Passthrough,
}

impl FromStr for CacheStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "logical" | "logical_expiry" => Ok(CacheStrategy::LogicalExpiry),
            "passthrough" => Ok(CacheStrategy::Passthrough),
            other => Err(ConfigError::InvalidValue {
                field: "cache_strategy".to_string(),
                value: other.to_string(),
                reason: "expected `logical` or `passthrough`".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Physical TTL for passthrough entries, logical TTL for envelopes.
    pub ttl: Duration,
    /// TTL of the empty sentinel cached for missing ids.
    pub null_ttl: Duration,
    /// Lease of the per-key refresh lock.
    pub lock_lease: Duration,
    pub rebuild_workers: usize,
    /// Per-worker queue capacity of the rebuild pool.
    pub rebuild_queue: usize,
    pub strategy: CacheStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            null_ttl: Duration::from_secs(DEFAULT_CACHE_NULL_TTL_SECS),
            lock_lease: Duration::from_secs(DEFAULT_CACHE_LOCK_LEASE_SECS),
            rebuild_workers: DEFAULT_REBUILD_WORKERS,
            rebuild_queue: DEFAULT_REBUILD_QUEUE,
            strategy: CacheStrategy::default(),
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self {
            ttl: Duration::from_secs(env_or("DIANPING_CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS)),
            null_ttl: Duration::from_secs(env_or(
                "DIANPING_CACHE_NULL_TTL_SECS",
                DEFAULT_CACHE_NULL_TTL_SECS,
            )),
            lock_lease: Duration::from_secs(env_or(
                "DIANPING_CACHE_LOCK_LEASE_SECS",
                DEFAULT_CACHE_LOCK_LEASE_SECS,
            )),
            rebuild_workers: env_or("DIANPING_CACHE_REBUILD_WORKERS", DEFAULT_REBUILD_WORKERS),
            rebuild_queue: env_or("DIANPING_CACHE_REBUILD_QUEUE", DEFAULT_REBUILD_QUEUE),
            strategy: env_or("DIANPING_CACHE_STRATEGY", CacheStrategy::default()),
        }
    }

    pub fn development() -> Self {
        Self {
            ttl: Duration::from_secs(20),
            null_ttl: Duration::from_secs(5),
            lock_lease: Duration::from_secs(2),
            rebuild_workers: 2,
            rebuild_queue: 8,
            strategy: CacheStrategy::LogicalExpiry,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_null_ttl(mut self, null_ttl: Duration) -> Self {
        self.null_ttl = null_ttl;
        self
    }

    pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn validate(&self) -> DianpingResult<()> {
        require_nonzero("cache_ttl", self.ttl.as_millis())?;
        require_nonzero("cache_null_ttl", self.null_ttl.as_millis())?;
        require_nonzero("cache_lock_lease", self.lock_lease.as_millis())?;
        require_nonzero("rebuild_workers", self.rebuild_workers as u128)?;
        require_nonzero("rebuild_queue", self.rebuild_queue as u128)?;
        Ok(())
    }
}

// ============================================================================
// SECKILL
// ============================================================================

/// How a granted admission reaches the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Append to the order stream; the consumer persists.
    #[default]
    Stream,
    /// Take the per-user lock and persist on the request path.
    Direct,
}

impl FromStr for DispatchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" => Ok(DispatchMode::Stream),
            "direct" => Ok(DispatchMode::Direct),
            other => Err(ConfigError::InvalidValue {
                field: "seckill_mode".to_string(),
                value: other.to_string(),
                reason: "expected `stream` or `direct`".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeckillConfig {
    pub mode: DispatchMode,
    /// Lease of the per-user `order:<userId>` lock.
    pub order_lock_lease: Duration,
    /// Id generator bucket for order ids.
    pub id_bucket: String,
}

impl Default for SeckillConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::default(),
            order_lock_lease: Duration::from_secs(DEFAULT_ORDER_LOCK_LEASE_SECS),
            id_bucket: DEFAULT_ID_BUCKET.to_string(),
        }
    }
}

impl SeckillConfig {
    pub fn from_env() -> Self {
        Self {
            mode: env_or("DIANPING_SECKILL_MODE", DispatchMode::default()),
            order_lock_lease: Duration::from_secs(env_or(
                "DIANPING_ORDER_LOCK_LEASE_SECS",
                DEFAULT_ORDER_LOCK_LEASE_SECS,
            )),
            id_bucket: env_string("DIANPING_ID_BUCKET", DEFAULT_ID_BUCKET),
        }
    }

    pub fn development() -> Self {
        Self {
            order_lock_lease: Duration::from_secs(5),
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn validate(&self) -> DianpingResult<()> {
        require_nonzero("order_lock_lease", self.order_lock_lease.as_millis())?;
        if self.id_bucket.is_empty() {
            return Err(DianpingError::Config(ConfigError::InvalidValue {
                field: "id_bucket".to_string(),
                value: String::new(),
                reason: "id_bucket must not be empty".to_string(),
            }));
        }
        Ok(())
    }
}

// ============================================================================
// CONSUMER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub stream_key: String,
    pub group: String,
    pub consumer: String,
    /// How long one live read may block waiting for entries.
    pub block: Duration,
    pub batch: usize,
    /// Deliveries after which an entry is dead-lettered. `0` never gives up.
    pub max_deliveries: u32,
    /// Pause after a processing error before replaying the pending list.
    pub retry_backoff: Duration,
    pub dead_letter_key: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer: DEFAULT_CONSUMER_NAME.to_string(),
            block: Duration::from_millis(DEFAULT_CONSUMER_BLOCK_MS),
            batch: DEFAULT_CONSUMER_BATCH,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            dead_letter_key: DEFAULT_DEAD_LETTER_KEY.to_string(),
        }
    }
}

impl ConsumerConfig {
    pub fn from_env() -> Self {
        Self {
            stream_key: env_string("DIANPING_STREAM_KEY", DEFAULT_STREAM_KEY),
            group: env_string("DIANPING_CONSUMER_GROUP", DEFAULT_CONSUMER_GROUP),
            consumer: env_string("DIANPING_CONSUMER_NAME", DEFAULT_CONSUMER_NAME),
            block: Duration::from_millis(env_or(
                "DIANPING_CONSUMER_BLOCK_MS",
                DEFAULT_CONSUMER_BLOCK_MS,
            )),
            batch: env_or("DIANPING_CONSUMER_BATCH", DEFAULT_CONSUMER_BATCH),
            max_deliveries: env_or("DIANPING_CONSUMER_MAX_DELIVERIES", DEFAULT_MAX_DELIVERIES),
            retry_backoff: Duration::from_millis(env_or(
                "DIANPING_CONSUMER_RETRY_BACKOFF_MS",
                DEFAULT_RETRY_BACKOFF_MS,
            )),
            dead_letter_key: env_string("DIANPING_DEAD_LETTER_KEY", DEFAULT_DEAD_LETTER_KEY),
        }
    }

    pub fn development() -> Self {
        Self {
            block: Duration::from_millis(100),
            max_deliveries: 4,
            retry_backoff: Duration::from_millis(5),
            ..Self::default()
        }
    }

    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries;
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn validate(&self) -> DianpingResult<()> {
        require_nonzero("consumer_batch", self.batch as u128)?;
        require_nonzero("consumer_block", self.block.as_millis())?;
        for (field, value) in [
            ("stream_key", &self.stream_key),
            ("consumer_group", &self.group),
            ("consumer_name", &self.consumer),
            ("dead_letter_key", &self.dead_letter_key),
        ] {
            if value.is_empty() {
                return Err(DianpingError::Config(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: String::new(),
                    reason: format!("{field} must not be empty"),
                }));
            }
        }
        if self.dead_letter_key == self.stream_key {
            return Err(DianpingError::Config(ConfigError::InvalidValue {
                field: "dead_letter_key".to_string(),
                value: self.dead_letter_key.clone(),
                reason: "dead_letter_key must differ from stream_key".to_string(),
            }));
        }
        Ok(())
    }
}
