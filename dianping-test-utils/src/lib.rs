//! Dianping Test Utilities
//!
//! Shared test infrastructure for the dianping workspace:
//! - Proptest generators for ids, timestamps and sale windows
//! - Fixtures for vouchers, shops and a fully in-memory store stack
//! - Counting and slow loaders for cache tests
//! - Custom assertions for dianping-specific results

pub use dianping_core::{
    Clock, DianpingError, DianpingResult, ManualClock, Order, OrderId, QueueEntry, Rejection,
    SaleWindow, Shop, ShopId, StoreError, Timestamp, UserId, VoucherId, VoucherInventory,
};
pub use dianping_storage::{InMemoryCoordinationStore, InMemoryRecordStore, RecordStore};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use dianping_core::HolderTokens;
use dianping_storage::{DistributedLock, Loader, StoreLock};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// IN-MEMORY STACK
// ============================================================================

/// Everything a pipeline, consumer or cache needs, wired to in-process stores
/// that share one manual clock.
#[derive(Debug, Clone)]
pub struct MemoryStack {
    pub coordination: Arc<InMemoryCoordinationStore>,
    pub records: Arc<InMemoryRecordStore>,
    pub clock: Arc<ManualClock>,
    pub tokens: Arc<HolderTokens>,
    pub lock: Arc<StoreLock<InMemoryCoordinationStore>>,
}

impl MemoryStack {
    pub fn records_dyn(&self) -> Arc<dyn RecordStore> {
        self.records.clone()
    }

    pub fn clock_dyn(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn lock_dyn(&self) -> Arc<dyn DistributedLock> {
        self.lock.clone()
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }
}

/// Fresh stores on a clock pinned to 2024-06-01T12:00:00Z.
pub fn in_memory_stack() -> MemoryStack {
    let clock = Arc::new(ManualClock::new(fixtures::reference_time()));
    let coordination = Arc::new(InMemoryCoordinationStore::with_clock(clock.clone()));
    MemoryStack {
        lock: Arc::new(StoreLock::new(Arc::clone(&coordination))),
        coordination,
        records: Arc::new(InMemoryRecordStore::new()),
        clock,
        tokens: Arc::new(HolderTokens::new()),
    }
}

/// Poll `check` every few milliseconds until it returns true or `within`
/// elapses. Returns the last result.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// LOADERS
// ============================================================================

/// Shop loader over a record store that counts how often it is called.
pub struct CountingLoader {
    records: Arc<dyn RecordStore>,
    calls: AtomicU32,
}

impl CountingLoader {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self {
            records,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Loader<ShopId, Shop> for CountingLoader {
    async fn load(&self, id: &ShopId) -> DianpingResult<Option<Shop>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.records.shop_get(*id).await
    }
}

/// `CountingLoader` that sleeps before every load, to widen race windows.
pub struct SlowLoader {
    inner: CountingLoader,
    delay: Duration,
}

impl SlowLoader {
    pub fn new(records: Arc<dyn RecordStore>, delay: Duration) -> Self {
        Self {
            inner: CountingLoader::new(records),
            delay,
        }
    }

    pub fn calls(&self) -> u32 {
        self.inner.calls()
    }
}

#[async_trait]
impl Loader<ShopId, Shop> for SlowLoader {
    async fn load(&self, id: &ShopId) -> DianpingResult<Option<Shop>> {
        tokio::time::sleep(self.delay).await;
        self.inner.load(id).await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for dianping types.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_user_id() -> impl Strategy<Value = UserId> {
        (1u64..10_000_000).prop_map(UserId::new)
    }

    pub fn arb_voucher_id() -> impl Strategy<Value = VoucherId> {
        (1u64..100_000).prop_map(VoucherId::new)
    }

    pub fn arb_order_id() -> impl Strategy<Value = OrderId> {
        any::<u64>().prop_map(OrderId::new)
    }

    /// Timestamps between 2022 and 2030, whole seconds.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1_640_995_200i64..1_893_456_000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    /// A valid window of one second to thirty days.
    pub fn arb_sale_window() -> impl Strategy<Value = SaleWindow> {
        (arb_timestamp(), 1i64..30 * 86_400).prop_filter_map("valid window", |(begin, len)| {
            SaleWindow::new(begin, begin + ChronoDuration::seconds(len)).ok()
        })
    }

    pub fn arb_queue_entry() -> impl Strategy<Value = QueueEntry> {
        (arb_order_id(), arb_voucher_id(), arb_user_id(), arb_timestamp()).prop_map(
            |(order_id, voucher_id, user_id, enqueued_at)| QueueEntry {
                order_id,
                voucher_id,
                user_id,
                enqueued_at,
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;

    /// 2024-06-01T12:00:00Z.
    pub fn reference_time() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Window running from one hour before `now` to one hour after.
    pub fn open_window(now: Timestamp) -> SaleWindow {
        window_between(now - ChronoDuration::hours(1), now + ChronoDuration::hours(1))
    }

    pub fn window_between(begin: Timestamp, end: Timestamp) -> SaleWindow {
        match SaleWindow::new(begin, end) {
            Ok(window) => window,
            Err(e) => panic!("fixture window is invalid: {e}"),
        }
    }

    /// Voucher whose sale is open at `now`.
    pub fn open_voucher(id: u64, stock: u32, now: Timestamp) -> VoucherInventory {
        VoucherInventory {
            voucher_id: VoucherId::new(id),
            stock,
            sale_window: open_window(now),
        }
    }

    pub fn sample_shop(id: u64, now: Timestamp) -> Shop {
        Shop {
            shop_id: ShopId::new(id),
            name: format!("Shop {id}"),
            type_id: 1,
            area: "Daning".to_string(),
            address: format!("{id} Gonghexin Road"),
            avg_price: 8_000,
            score: 47,
            updated_at: now,
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for dianping results.

    use super::*;

    #[track_caller]
    pub fn assert_rejected<T: std::fmt::Debug>(result: &DianpingResult<T>, expected: Rejection) {
        match result {
            Err(DianpingError::Rejected(got)) => {
                assert_eq!(*got, expected, "Wrong rejection");
            }
            other => panic!("Expected rejection {:?}, got: {:?}", expected, other),
        }
    }

    #[track_caller]
    pub fn assert_infrastructure<T: std::fmt::Debug>(result: &DianpingResult<T>) {
        match result {
            Err(e) if e.is_infrastructure() => {}
            other => panic!("Expected infrastructure error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_lock_contention<T: std::fmt::Debug>(result: &DianpingResult<T>) {
        match result {
            Err(DianpingError::LockContention { .. }) => {}
            other => panic!("Expected lock contention, got: {:?}", other),
        }
    }

    /// Assert that no two orders share a (user, voucher) pair.
    #[track_caller]
    pub fn assert_one_order_per_user(orders: &[Order]) {
        let mut seen = std::collections::HashSet::new();
        for order in orders {
            assert!(
                seen.insert((order.user_id, order.voucher_id)),
                "Duplicate order for user {} voucher {}",
                order.user_id,
                order.voucher_id
            );
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use dianping_core::WindowStatus;
    use proptest::prelude::*;

    #[test]
    fn test_open_voucher_is_open_at_now() {
        let now = fixtures::reference_time();
        let voucher = fixtures::open_voucher(1, 5, now);
        assert_eq!(voucher.sale_window.status(now), WindowStatus::Open);
    }

    #[tokio::test]
    async fn test_counting_loader_counts() {
        let stack = in_memory_stack();
        stack
            .records
            .shop_insert(&fixtures::sample_shop(1, stack.now()))
            .await
            .unwrap();
        let loader = CountingLoader::new(stack.records_dyn());
        assert!(loader.load(&ShopId::new(1)).await.unwrap().is_some());
        assert!(loader.load(&ShopId::new(2)).await.unwrap().is_none());
        assert_eq!(loader.calls(), 2);
    }

    #[tokio::test]
    async fn test_eventually_gives_up() {
        assert!(!eventually(Duration::from_millis(20), || async { false }).await);
        assert!(eventually(Duration::from_millis(20), || async { true }).await);
    }

    #[test]
    fn test_assertion_rejected() {
        let result: DianpingResult<()> = Err(Rejection::OutOfStock.into());
        assertions::assert_rejected(&result, Rejection::OutOfStock);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_generated_window_contains_begin_not_end(window in generators::arb_sale_window()) {
            prop_assert!(window.contains(window.begin()));
            prop_assert!(!window.contains(window.end()));
        }
    }
}
