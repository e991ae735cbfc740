//! Time-ordered 64-bit id generation.
//!
//! An id is `(seconds since epoch << 32) | daily sequence`. The sequence comes
//! from one atomic increment of `icr:<bucket>:<yyyy:MM:dd>`, so the counter
//! starts over every UTC day without any cleanup.

use crate::coordination::CoordinationStore;
use chrono::TimeZone;
use dianping_core::{Clock, DianpingResult, IdError, OrderId, Timestamp};
use std::sync::Arc;

/// 2022-01-01T00:00:00Z.
pub const ID_EPOCH_SECS: i64 = 1_640_995_200;
/// Width of the sequence part.
pub const SEQUENCE_BITS: u32 = 32;

/// Counter key for a bucket on the given day.
pub fn counter_key(bucket: &str, at: Timestamp) -> String {
    format!("icr:{}:{}", bucket, at.format("%Y:%m:%d"))
}

pub struct IdGenerator<S: CoordinationStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: CoordinationStore> IdGenerator<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Mint the next id in `bucket`. Fails if the counter backend is
    /// unreachable; there is no local fallback.
    pub async fn next_id(&self, bucket: &str) -> DianpingResult<OrderId> {
        let now = self.clock.now();
        let elapsed = now.timestamp() - ID_EPOCH_SECS;
        if elapsed < 0 {
            return Err(IdError::ClockBeforeEpoch.into());
        }
        if elapsed > i64::from(u32::MAX) {
            return Err(IdError::TimestampOverflow { elapsed }.into());
        }

        let sequence = self.store.incr(&counter_key(bucket, now)).await?;
        if sequence <= 0 || sequence > i64::from(u32::MAX) {
            return Err(IdError::SequenceExhausted {
                bucket: bucket.to_string(),
                sequence,
            }
            .into());
        }

        Ok(OrderId::new(((elapsed as u64) << SEQUENCE_BITS) | sequence as u64))
    }

    /// Split an id into its second-resolution timestamp and sequence.
    pub fn decompose(id: OrderId) -> (Timestamp, u32) {
        let raw = id.get();
        let secs = ID_EPOCH_SECS + (raw >> SEQUENCE_BITS) as i64;
        let at = chrono::Utc
            .timestamp_opt(secs, 0)
            .single()
            .unwrap_or_default();
        (at, (raw & u64::from(u32::MAX)) as u32)
    }
}

impl<S: CoordinationStore> std::fmt::Debug for IdGenerator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGenerator")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
