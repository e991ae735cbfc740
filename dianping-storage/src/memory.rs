//! In-process coordination store.
//!
//! Suitable for single-instance deployments and tests. All state sits behind
//! one mutex, so every call (scripts included) is atomic with respect to every
//! other call. Expiry uses `tokio::time::Instant`, which lets tests pause and
//! advance time.

use crate::coordination::{
    AdmissionArgs, CoordinationStore, GroupCursor, ReadFrom, Script, StreamEntry, StreamFields,
    StreamId,
};
use async_trait::async_trait;
use dianping_core::{Backend, Clock, DianpingResult, QueueEntry, StoreError, SystemClock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Admission script result codes.
pub const ADMISSION_GRANTED: i64 = 0;
pub const ADMISSION_OUT_OF_STOCK: i64 = 1;
pub const ADMISSION_DUPLICATE: i64 = 2;
pub const ADMISSION_NOT_STARTED: i64 = 3;
pub const ADMISSION_ENDED: i64 = 4;

/// Writes with a TTL between two sweeps of expired keys.
const SWEEP_EVERY: u32 = 128;

#[derive(Debug)]
enum Value {
    Str(String),
    Set(BTreeSet<String>),
}

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: StreamId,
    pending: BTreeMap<StreamId, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<StreamId, StreamFields>,
    last_id: StreamId,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct State {
    keys: HashMap<String, Slot>,
    streams: HashMap<String, StreamState>,
    outage: Option<String>,
    /// Expiring writes since the last sweep.
    ttl_writes: u32,
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
    }
}

fn no_group(cursor: &GroupCursor) -> StoreError {
    StoreError::NotFound {
        entity: "consumer group".to_string(),
        id: format!("{}/{}", cursor.stream, cursor.group),
    }
}

impl State {
    /// Slot for `key`, dropping it first if its TTL has passed.
    fn live(&mut self, key: &str) -> Option<&mut Slot> {
        let now = Instant::now();
        if self.keys.get(key).is_some_and(|slot| !slot.is_live(now)) {
            self.keys.remove(key);
        }
        self.keys.get_mut(key)
    }

    fn get_str(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn get_int(&mut self, script: &str, key: &str) -> Result<Option<i64>, StoreError> {
        match self.get_str(key)? {
            None => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|_| StoreError::Script {
                script: script.to_string(),
                reason: format!("{key} is not an integer: {raw:?}"),
            }),
        }
    }

    fn put_str(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        if ttl.is_some() {
            self.note_ttl_write();
        }
        self.keys.insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    /// Keys that are never read again would otherwise outlive their TTL, so
    /// every `SWEEP_EVERY` expiring writes drop all dead slots.
    fn note_ttl_write(&mut self) {
        self.ttl_writes += 1;
        if self.ttl_writes >= SWEEP_EVERY {
            self.ttl_writes = 0;
            self.sweep_expired();
        }
    }

    fn sweep_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.keys.len();
        self.keys.retain(|_, slot| slot.is_live(now));
        let swept = before - self.keys.len();
        if swept > 0 {
            tracing::trace!(swept, remaining = self.keys.len(), "Expired keys swept");
        }
        swept
    }

    fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let Some(slot) = self.live(key) else {
            self.put_str(key, &delta.to_string(), None);
            return Ok(delta);
        };
        let Value::Str(raw) = &mut slot.value else {
            return Err(wrong_type(key));
        };
        let current: i64 = raw.trim().parse().map_err(|_| wrong_type(key))?;
        let next = current
            .checked_add(delta)
            .ok_or_else(|| StoreError::codec(format!("increment of {key} overflows")))?;
        *raw = next.to_string();
        Ok(next)
    }

    fn set_add(&mut self, key: &str, member: &str) -> Result<bool, StoreError> {
        if self.live(key).is_none() {
            self.keys.insert(
                key.to_string(),
                Slot {
                    value: Value::Set(BTreeSet::new()),
                    expires_at: None,
                },
            );
        }
        match self.keys.get_mut(key).map(|slot| &mut slot.value) {
            Some(Value::Set(members)) => Ok(members.insert(member.to_string())),
            _ => Err(wrong_type(key)),
        }
    }

    fn set_remove(&mut self, key: &str, member: &str) -> Result<bool, StoreError> {
        match self.live(key).map(|slot| &mut slot.value) {
            None => Ok(false),
            Some(Value::Set(members)) => Ok(members.remove(member)),
            Some(Value::Str(_)) => Err(wrong_type(key)),
        }
    }

    fn set_contains(&mut self, key: &str, member: &str) -> Result<bool, StoreError> {
        match self.live(key).map(|slot| &slot.value) {
            None => Ok(false),
            Some(Value::Set(members)) => Ok(members.contains(member)),
            Some(Value::Str(_)) => Err(wrong_type(key)),
        }
    }

    fn append(&mut self, stream: &str, fields: StreamFields, now_ms: u64) -> StreamId {
        let state = self.streams.entry(stream.to_string()).or_default();
        let id = if now_ms > state.last_id.ms {
            StreamId::new(now_ms, 0)
        } else {
            StreamId::new(state.last_id.ms, state.last_id.seq + 1)
        };
        state.last_id = id;
        state.entries.insert(id, fields);
        id
    }

    /// Returns the admission code and whether an entry was appended.
    fn run_admission(&mut self, args: &AdmissionArgs, now_ms: u64) -> Result<(i64, bool), StoreError> {
        let now = args.now_epoch_secs;
        if let Some(begin) = self.get_int("seckill", &args.begin_key)? {
            if now < begin {
                return Ok((ADMISSION_NOT_STARTED, false));
            }
        }
        if let Some(end) = self.get_int("seckill", &args.end_key)? {
            if now >= end {
                return Ok((ADMISSION_ENDED, false));
            }
        }

        let user = args.user_id.to_string();
        if self.set_contains(&args.buyers_key, &user)? {
            return Ok((ADMISSION_DUPLICATE, false));
        }
        let stock = self.get_int("seckill", &args.stock_key)?;
        if stock.map_or(true, |stock| stock <= 0) {
            return Ok((ADMISSION_OUT_OF_STOCK, false));
        }

        self.incr_by(&args.stock_key, -1)?;
        self.set_add(&args.buyers_key, &user)?;
        match &args.stream_key {
            Some(stream) => {
                let fields: StreamFields = [
                    (QueueEntry::FIELD_USER_ID.to_string(), user),
                    (QueueEntry::FIELD_VOUCHER_ID.to_string(), args.voucher_id.to_string()),
                    (QueueEntry::FIELD_ORDER_ID.to_string(), args.order_id.to_string()),
                ]
                .into_iter()
                .collect();
                self.append(stream, fields, now_ms);
                Ok((ADMISSION_GRANTED, true))
            }
            None => Ok((ADMISSION_GRANTED, false)),
        }
    }

    fn deliver_new(&mut self, cursor: &GroupCursor, count: usize) -> Result<Vec<StreamEntry>, StoreError> {
        let StreamState { entries, groups, .. } = self
            .streams
            .get_mut(&cursor.stream)
            .ok_or_else(|| no_group(cursor))?;
        let group = groups.get_mut(&cursor.group).ok_or_else(|| no_group(cursor))?;

        let mut out = Vec::new();
        for (id, fields) in entries.range((Excluded(group.last_delivered), Unbounded)).take(count) {
            group.pending.insert(
                *id,
                PendingEntry {
                    consumer: cursor.consumer.clone(),
                    delivery_count: 1,
                },
            );
            group.last_delivered = *id;
            out.push(StreamEntry {
                id: *id,
                fields: fields.clone(),
                delivery_count: 1,
            });
        }
        Ok(out)
    }

    fn redeliver_pending(
        &mut self,
        cursor: &GroupCursor,
        after: StreamId,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let StreamState { entries, groups, .. } = self
            .streams
            .get_mut(&cursor.stream)
            .ok_or_else(|| no_group(cursor))?;
        let group = groups.get_mut(&cursor.group).ok_or_else(|| no_group(cursor))?;

        let mut out = Vec::new();
        for (id, pending) in group
            .pending
            .range_mut((Excluded(after), Unbounded))
            .filter(|(_, p)| p.consumer == cursor.consumer)
            .take(count)
        {
            pending.delivery_count = pending.delivery_count.saturating_add(1);
            out.push(StreamEntry {
                id: *id,
                fields: entries.get(id).cloned().unwrap_or_default(),
                delivery_count: pending.delivery_count,
            });
        }
        Ok(out)
    }
}

// ============================================================================
// STORE
// ============================================================================

/// Coordination store living in this process.
#[derive(Debug)]
pub struct InMemoryCoordinationStore {
    state: Mutex<State>,
    appended: Notify,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Stream entry ids take their millisecond part from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            appended: Notify::new(),
            clock,
        }
    }

    /// Simulate the backend going away (`Some`) or coming back (`None`).
    pub fn set_unavailable(&self, reason: Option<&str>) {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.outage = reason.map(str::to_string);
    }

    /// Time left before `key` expires. `None` when absent or without TTL.
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let mut guard = self.state.lock().ok()?;
        let slot = guard.live(key)?;
        slot.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Slots held in memory, expired ones not yet swept included.
    pub fn key_count(&self) -> usize {
        match self.state.lock() {
            Ok(guard) => guard.keys.len(),
            Err(poisoned) => poisoned.into_inner().keys.len(),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        let guard = self.state.lock().map_err(|_| StoreError::LockPoisoned)?;
        if let Some(reason) = &guard.outage {
            return Err(StoreError::unavailable(Backend::Coordination, reason.clone()));
        }
        Ok(guard)
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0)
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn get(&self, key: &str) -> DianpingResult<Option<String>> {
        Ok(self.state()?.get_str(key)?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> DianpingResult<()> {
        self.state()?.put_str(key, value, ttl);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> DianpingResult<bool> {
        let mut state = self.state()?;
        if state.live(key).is_some() {
            return Ok(false);
        }
        state.put_str(key, value, Some(ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> DianpingResult<bool> {
        let mut state = self.state()?;
        let existed = state.live(key).is_some();
        state.keys.remove(key);
        Ok(existed)
    }

    async fn incr(&self, key: &str) -> DianpingResult<i64> {
        Ok(self.state()?.incr_by(key, 1)?)
    }

    async fn set_contains(&self, key: &str, member: &str) -> DianpingResult<bool> {
        Ok(self.state()?.set_contains(key, member)?)
    }

    async fn eval(&self, script: &Script) -> DianpingResult<i64> {
        let now_ms = self.now_ms();
        let (code, appended) = {
            let mut state = self.state()?;
            match script {
                Script::CompareAndDelete { key, expected } => {
                    if state.get_str(key)?.as_deref() == Some(expected.as_str()) {
                        state.keys.remove(key);
                        (1, false)
                    } else {
                        (0, false)
                    }
                }
                Script::SeckillAdmission(args) => state.run_admission(args, now_ms)?,
                Script::SeckillRevert {
                    stock_key,
                    buyers_key,
                    user_id,
                } => {
                    if state.set_remove(buyers_key, &user_id.to_string())? {
                        state.incr_by(stock_key, 1)?;
                        (1, false)
                    } else {
                        (0, false)
                    }
                }
            }
        };
        if appended {
            self.appended.notify_waiters();
        }
        Ok(code)
    }

    async fn stream_add(&self, stream: &str, fields: &[(String, String)]) -> DianpingResult<StreamId> {
        let now_ms = self.now_ms();
        let id = {
            let mut state = self.state()?;
            state.append(stream, fields.iter().cloned().collect(), now_ms)
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn stream_len(&self, stream: &str) -> DianpingResult<u64> {
        let state = self.state()?;
        Ok(state
            .streams
            .get(stream)
            .map_or(0, |s| s.entries.len() as u64))
    }

    async fn stream_range(&self, stream: &str) -> DianpingResult<Vec<StreamEntry>> {
        let state = self.state()?;
        Ok(state
            .streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(id, fields)| StreamEntry {
                        id: *id,
                        fields: fields.clone(),
                        delivery_count: 0,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn group_create(&self, stream: &str, group: &str) -> DianpingResult<bool> {
        let mut state = self.state()?;
        let stream = state.streams.entry(stream.to_string()).or_default();
        if stream.groups.contains_key(group) {
            return Ok(false);
        }
        stream.groups.insert(group.to_string(), GroupState::default());
        Ok(true)
    }

    async fn read_group(
        &self,
        cursor: &GroupCursor,
        from: ReadFrom,
        count: usize,
        block: Option<Duration>,
    ) -> DianpingResult<Vec<StreamEntry>> {
        let count = count.max(1);
        let deadline = block.map(|block| Instant::now() + block);
        loop {
            // Registered before the check so an append in between still wakes us.
            let appended = self.appended.notified();
            {
                let mut state = self.state()?;
                let entries = match from {
                    ReadFrom::New => state.deliver_new(cursor, count)?,
                    ReadFrom::PendingAfter(after) => {
                        return Ok(state.redeliver_pending(cursor, after, count)?)
                    }
                };
                if !entries.is_empty() {
                    return Ok(entries);
                }
            }
            let Some(deadline) = deadline else {
                return Ok(Vec::new());
            };
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, cursor: &GroupCursor, ids: &[StreamId]) -> DianpingResult<u64> {
        let mut state = self.state()?;
        let Some(group) = state
            .streams
            .get_mut(&cursor.stream)
            .and_then(|s| s.groups.get_mut(&cursor.group))
        else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter(|id| group.pending.remove(*id).is_some())
            .count() as u64)
    }

    async fn pending_count(&self, cursor: &GroupCursor) -> DianpingResult<u64> {
        let state = self.state()?;
        Ok(state
            .streams
            .get(&cursor.stream)
            .and_then(|s| s.groups.get(&cursor.group))
            .map_or(0, |g| g.pending.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dianping_core::{DianpingError, OrderId, UserId, VoucherId};

    fn admission(user: u64, stream: Option<&str>, now: i64) -> Script {
        Script::SeckillAdmission(AdmissionArgs {
            stock_key: "seckill:stock:1".to_string(),
            buyers_key: "seckill:order:1".to_string(),
            begin_key: "seckill:begin:1".to_string(),
            end_key: "seckill:end:1".to_string(),
            stream_key: stream.map(str::to_string),
            voucher_id: VoucherId::new(1),
            user_id: UserId::new(user),
            order_id: OrderId::new(1000 + user),
            now_epoch_secs: now,
        })
    }

    fn cursor() -> GroupCursor {
        GroupCursor::new("stream.orders", "g1", "c1")
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = InMemoryCoordinationStore::new();
        store.set("k", "v", Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_respects_live_keys_only() {
        let store = InMemoryCoordinationStore::new();
        assert!(store.set_if_absent("lock:a", "t1", Duration::from_secs(1)).await.unwrap());
        assert!(!store.set_if_absent("lock:a", "t2", Duration::from_secs(1)).await.unwrap());
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(store.set_if_absent("lock:a", "t2", Duration::from_secs(1)).await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap().as_deref(), Some("t2"));
    }

    #[tokio::test]
    async fn test_incr_starts_at_one_and_rejects_non_integers() {
        let store = InMemoryCoordinationStore::new();
        assert_eq!(store.incr("icr:order:2024:01:01").await.unwrap(), 1);
        assert_eq!(store.incr("icr:order:2024:01:01").await.unwrap(), 2);
        store.set("text", "abc", None).await.unwrap();
        assert!(matches!(
            store.incr("text").await,
            Err(DianpingError::Store(StoreError::WrongType { .. }))
        ));
    }

    #[tokio::test]
    async fn test_compare_and_delete_checks_token() {
        let store = InMemoryCoordinationStore::new();
        store.set("lock:x", "owner", None).await.unwrap();
        let wrong = Script::CompareAndDelete {
            key: "lock:x".to_string(),
            expected: "intruder".to_string(),
        };
        assert_eq!(store.eval(&wrong).await.unwrap(), 0);
        let right = Script::CompareAndDelete {
            key: "lock:x".to_string(),
            expected: "owner".to_string(),
        };
        assert_eq!(store.eval(&right).await.unwrap(), 1);
        assert_eq!(store.get("lock:x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_admission_codes() {
        let store = InMemoryCoordinationStore::new();
        // No stock key at all.
        assert_eq!(store.eval(&admission(1, None, 50)).await.unwrap(), ADMISSION_OUT_OF_STOCK);

        store.set("seckill:stock:1", "1", None).await.unwrap();
        store.set("seckill:begin:1", "10", None).await.unwrap();
        store.set("seckill:end:1", "100", None).await.unwrap();

        assert_eq!(store.eval(&admission(1, None, 9)).await.unwrap(), ADMISSION_NOT_STARTED);
        assert_eq!(store.eval(&admission(1, None, 100)).await.unwrap(), ADMISSION_ENDED);
        assert_eq!(store.eval(&admission(1, None, 50)).await.unwrap(), ADMISSION_GRANTED);
        assert_eq!(store.get("seckill:stock:1").await.unwrap().as_deref(), Some("0"));
        assert!(store.set_contains("seckill:order:1", "1").await.unwrap());
        // A repeat buyer hears about the duplicate even once sold out.
        assert_eq!(store.eval(&admission(1, None, 50)).await.unwrap(), ADMISSION_DUPLICATE);
        assert_eq!(store.eval(&admission(2, None, 50)).await.unwrap(), ADMISSION_OUT_OF_STOCK);

        store.set("seckill:stock:1", "5", None).await.unwrap();
        assert_eq!(store.eval(&admission(1, None, 50)).await.unwrap(), ADMISSION_DUPLICATE);
        assert_eq!(store.get("seckill:stock:1").await.unwrap().as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn test_revert_undoes_only_a_held_grant() {
        let store = InMemoryCoordinationStore::new();
        store.set("seckill:stock:1", "1", None).await.unwrap();
        assert_eq!(store.eval(&admission(1, None, 0)).await.unwrap(), ADMISSION_GRANTED);

        let revert = |user: u64| Script::SeckillRevert {
            stock_key: "seckill:stock:1".to_string(),
            buyers_key: "seckill:order:1".to_string(),
            user_id: UserId::new(user),
        };
        assert_eq!(store.eval(&revert(2)).await.unwrap(), 0);
        assert_eq!(store.get("seckill:stock:1").await.unwrap().as_deref(), Some("0"));

        assert_eq!(store.eval(&revert(1)).await.unwrap(), 1);
        assert_eq!(store.get("seckill:stock:1").await.unwrap().as_deref(), Some("1"));
        assert!(!store.set_contains("seckill:order:1", "1").await.unwrap());
        // A second revert finds nothing to undo.
        assert_eq!(store.eval(&revert(1)).await.unwrap(), 0);
        assert_eq!(store.get("seckill:stock:1").await.unwrap().as_deref(), Some("1"));

        assert_eq!(store.eval(&admission(1, None, 0)).await.unwrap(), ADMISSION_GRANTED);
    }

    #[tokio::test]
    async fn test_admission_appends_inside_script() {
        let store = InMemoryCoordinationStore::new();
        store.set("seckill:stock:1", "2", None).await.unwrap();
        assert_eq!(
            store.eval(&admission(7, Some("stream.orders"), 0)).await.unwrap(),
            ADMISSION_GRANTED
        );
        assert_eq!(store.eval(&admission(7, Some("stream.orders"), 0)).await.unwrap(), ADMISSION_DUPLICATE);
        let entries = store.stream_range("stream.orders").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fields.get("userId").map(String::as_str), Some("7"));
        assert_eq!(entries[0].fields.get("orderId").map(String::as_str), Some("1007"));
    }

    #[tokio::test]
    async fn test_group_read_ack_and_pending_redelivery() {
        let store = InMemoryCoordinationStore::new();
        assert!(store.group_create("stream.orders", "g1").await.unwrap());
        assert!(!store.group_create("stream.orders", "g1").await.unwrap());

        let fields = vec![("orderId".to_string(), "1".to_string())];
        let first = store.stream_add("stream.orders", &fields).await.unwrap();
        let second = store.stream_add("stream.orders", &fields).await.unwrap();
        assert!(second > first);

        let got = store.read_group(&cursor(), ReadFrom::New, 10, None).await.unwrap();
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|e| e.delivery_count == 1));
        assert_eq!(store.pending_count(&cursor()).await.unwrap(), 2);

        // Nothing new left.
        assert!(store.read_group(&cursor(), ReadFrom::New, 10, None).await.unwrap().is_empty());

        assert_eq!(store.ack(&cursor(), &[first]).await.unwrap(), 1);
        let pending = store
            .read_group(&cursor(), ReadFrom::PendingAfter(StreamId::ZERO), 10, None)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second);
        assert_eq!(pending[0].delivery_count, 2);

        // Other consumers in the group do not see c1's pending entries.
        let other = GroupCursor::new("stream.orders", "g1", "c2");
        assert!(store
            .read_group(&other, ReadFrom::PendingAfter(StreamId::ZERO), 10, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_read_without_group_fails() {
        let store = InMemoryCoordinationStore::new();
        assert!(matches!(
            store.read_group(&cursor(), ReadFrom::New, 1, None).await,
            Err(DianpingError::Store(StoreError::NotFound { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_read_times_out_empty() {
        let store = InMemoryCoordinationStore::new();
        store.group_create("stream.orders", "g1").await.unwrap();
        let got = store
            .read_group(&cursor(), ReadFrom::New, 1, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_read_wakes_on_append() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        store.group_create("stream.orders", "g1").await.unwrap();

        let reader = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .read_group(&cursor(), ReadFrom::New, 1, Some(Duration::from_secs(10)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        store
            .stream_add("stream.orders", &[("orderId".to_string(), "9".to_string())])
            .await
            .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn test_outage_surfaces_as_unavailable() {
        let store = InMemoryCoordinationStore::new();
        store.set_unavailable(Some("connection refused"));
        let err = store.incr("icr:order:x").await.unwrap_err();
        assert!(err.is_infrastructure());
        store.set_unavailable(None);
        assert_eq!(store.incr("icr:order:x").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unread_expired_keys_are_swept() {
        let store = InMemoryCoordinationStore::new();
        for id in 0..200 {
            store
                .set(&format!("cache:shop:{id}"), "", Some(Duration::from_secs(1)))
                .await
                .unwrap();
        }
        store.set("seckill:stock:1", "10", None).await.unwrap();
        assert_eq!(store.key_count(), 201);

        tokio::time::advance(Duration::from_secs(2)).await;
        for id in 0..SWEEP_EVERY {
            store
                .set(&format!("cache:shop:new:{id}"), "", Some(Duration::from_secs(60)))
                .await
                .unwrap();
        }
        // Only the persistent key and the fresh sentinels are left.
        assert_eq!(store.key_count(), 1 + SWEEP_EVERY as usize);
        assert_eq!(store.get("seckill:stock:1").await.unwrap().as_deref(), Some("10"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_remaining_reports_expiry() {
        let store = InMemoryCoordinationStore::new();
        store.set("cache:shop:1", "", Some(Duration::from_secs(120))).await.unwrap();
        store.set("cache:shop:2", "{}", None).await.unwrap();
        assert_eq!(store.ttl_remaining("cache:shop:1"), Some(Duration::from_secs(120)));
        assert_eq!(store.ttl_remaining("cache:shop:2"), None);
    }
}
