//! Coordination store contract.
//!
//! The shared store offers key/value with TTL, atomic increment, atomic
//! server-side scripts and append-only streams with consumer groups. This
//! module defines the async trait and the value types that cross it.

use async_trait::async_trait;
use chrono::TimeZone;
use dianping_core::{DianpingResult, OrderId, StoreError, Timestamp, UserId, VoucherId};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Field map of a stream entry.
pub type StreamFields = BTreeMap<String, String>;

// ============================================================================
// STREAM IDS AND ENTRIES
// ============================================================================

/// Stream entry id `<ms>-<seq>`. Ordered by time, then sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };

    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Wall-clock time the entry was appended.
    pub fn timestamp(&self) -> Timestamp {
        let ms = i64::try_from(self.ms).unwrap_or(i64::MAX);
        chrono::Utc
            .timestamp_millis_opt(ms)
            .single()
            .unwrap_or_default()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StoreError::codec(format!("invalid stream id {s:?}"));
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        Ok(Self {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// One entry handed out by a group read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: StreamFields,
    /// Times this entry has been delivered to the group, this delivery included.
    pub delivery_count: u32,
}

/// Identifies one consumer inside one group of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupCursor {
    pub stream: String,
    pub group: String,
    pub consumer: String,
}

impl GroupCursor {
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
        }
    }
}

/// Where a group read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// Entries never delivered to the group (`>`).
    New,
    /// This consumer's delivered-but-unacknowledged entries after the id.
    PendingAfter(StreamId),
}

// ============================================================================
// SCRIPTS
// ============================================================================

const UNLOCK_SOURCE: &str = include_str!("../scripts/unlock.lua");
const SECKILL_SOURCE: &str = include_str!("../scripts/seckill.lua");
const SECKILL_REVERT_SOURCE: &str = include_str!("../scripts/seckill_revert.lua");

/// Keys and arguments of the flash-sale admission script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionArgs {
    pub stock_key: String,
    pub buyers_key: String,
    pub begin_key: String,
    pub end_key: String,
    /// Stream to append the order to on success; `None` skips the append.
    pub stream_key: Option<String>,
    pub voucher_id: VoucherId,
    pub user_id: UserId,
    pub order_id: OrderId,
    pub now_epoch_secs: i64,
}

/// An atomic server-side program. Executes as one indivisible step against
/// the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    /// Delete `key` only while it still holds `expected`. Returns 1 or 0.
    CompareAndDelete { key: String, expected: String },
    /// Window, duplicate and stock checks followed by the decrement, the
    /// buyer record and the queue append. Returns the admission code.
    SeckillAdmission(AdmissionArgs),
    /// Remove the user from the buyers set and, only if they were in it, put
    /// one unit back on the stock counter. Returns 1 or 0.
    SeckillRevert {
        stock_key: String,
        buyers_key: String,
        user_id: UserId,
    },
}

impl Script {
    pub fn name(&self) -> &'static str {
        match self {
            Script::CompareAndDelete { .. } => "unlock",
            Script::SeckillAdmission(_) => "seckill",
            Script::SeckillRevert { .. } => "seckill_revert",
        }
    }

    /// Lua source for backends that evaluate scripts remotely.
    pub fn source(&self) -> &'static str {
        match self {
            Script::CompareAndDelete { .. } => UNLOCK_SOURCE,
            Script::SeckillAdmission(_) => SECKILL_SOURCE,
            Script::SeckillRevert { .. } => SECKILL_REVERT_SOURCE,
        }
    }

    pub fn keys(&self) -> Vec<String> {
        match self {
            Script::CompareAndDelete { key, .. } => vec![key.clone()],
            Script::SeckillAdmission(args) => vec![
                args.stock_key.clone(),
                args.buyers_key.clone(),
                args.begin_key.clone(),
                args.end_key.clone(),
                args.stream_key.clone().unwrap_or_default(),
            ],
            Script::SeckillRevert {
                stock_key,
                buyers_key,
                ..
            } => vec![stock_key.clone(), buyers_key.clone()],
        }
    }

    pub fn args(&self) -> Vec<String> {
        match self {
            Script::CompareAndDelete { expected, .. } => vec![expected.clone()],
            Script::SeckillAdmission(args) => vec![
                args.voucher_id.to_string(),
                args.user_id.to_string(),
                args.order_id.to_string(),
                args.now_epoch_secs.to_string(),
            ],
            Script::SeckillRevert { user_id, .. } => vec![user_id.to_string()],
        }
    }
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Shared coordination store.
///
/// Every method is a single round trip. Implementations must fail with
/// `StoreError::Unavailable` when the backend cannot be reached; callers never
/// fall back to local state.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> DianpingResult<Option<String>>;

    /// Overwrite `key`. `ttl = None` stores the value without expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> DianpingResult<()>;

    /// Store `value` only when `key` is absent. Returns whether it was stored.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> DianpingResult<bool>;

    async fn delete(&self, key: &str) -> DianpingResult<bool>;

    /// Atomically add one to the integer at `key`, starting from zero.
    async fn incr(&self, key: &str) -> DianpingResult<i64>;

    async fn set_contains(&self, key: &str, member: &str) -> DianpingResult<bool>;

    async fn eval(&self, script: &Script) -> DianpingResult<i64>;

    async fn stream_add(&self, stream: &str, fields: &[(String, String)]) -> DianpingResult<StreamId>;

    async fn stream_len(&self, stream: &str) -> DianpingResult<u64>;

    /// All entries currently in the stream, oldest first.
    async fn stream_range(&self, stream: &str) -> DianpingResult<Vec<StreamEntry>>;

    /// Create a consumer group reading from the start of the stream, creating
    /// the stream if needed. Returns `false` when the group already exists.
    async fn group_create(&self, stream: &str, group: &str) -> DianpingResult<bool>;

    /// Read up to `count` entries for the cursor's consumer. `block` only
    /// applies to `ReadFrom::New` and bounds how long the call waits for new
    /// entries.
    async fn read_group(
        &self,
        cursor: &GroupCursor,
        from: ReadFrom,
        count: usize,
        block: Option<Duration>,
    ) -> DianpingResult<Vec<StreamEntry>>;

    /// Acknowledge entries, removing them from the pending list.
    async fn ack(&self, cursor: &GroupCursor, ids: &[StreamId]) -> DianpingResult<u64>;

    /// Delivered-but-unacknowledged entries of the cursor's group.
    async fn pending_count(&self, cursor: &GroupCursor) -> DianpingResult<u64>;
}
