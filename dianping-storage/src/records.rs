//! Durable record store contract and its in-process implementation.

use async_trait::async_trait;
use dianping_core::{
    Backend, DianpingResult, Order, OrderId, Shop, ShopId, StoreError, UserId, VoucherId,
    VoucherInventory,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Relational store holding shops, vouchers and orders.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    async fn shop_get(&self, id: ShopId) -> DianpingResult<Option<Shop>>;

    async fn shop_insert(&self, shop: &Shop) -> DianpingResult<()>;

    /// Overwrite an existing shop. Fails with `NotFound` for unknown ids.
    async fn shop_update(&self, shop: &Shop) -> DianpingResult<()>;

    async fn voucher_get(&self, id: VoucherId) -> DianpingResult<Option<VoucherInventory>>;

    async fn voucher_insert(&self, voucher: &VoucherInventory) -> DianpingResult<()>;

    async fn order_get(&self, id: OrderId) -> DianpingResult<Option<Order>>;

    async fn orders_for_voucher(&self, voucher: VoucherId) -> DianpingResult<Vec<Order>>;

    /// Open a transaction. Dropping it without `commit` rolls back.
    async fn begin(&self) -> DianpingResult<Box<dyn RecordTx>>;
}

/// Multi-statement unit of work against the record store.
#[async_trait]
pub trait RecordTx: Send {
    async fn order_count(&mut self, user: UserId, voucher: VoucherId) -> DianpingResult<u64>;

    /// `stock = stock - 1 WHERE voucher_id = ? AND stock > 0`. Returns whether
    /// a row changed.
    async fn decrement_stock_if_positive(&mut self, voucher: VoucherId) -> DianpingResult<bool>;

    async fn order_insert(&mut self, order: &Order) -> DianpingResult<()>;

    async fn commit(self: Box<Self>) -> DianpingResult<()>;
}

// ============================================================================
// IN-MEMORY RECORD STORE
// ============================================================================

#[derive(Debug, Default)]
struct Tables {
    shops: HashMap<ShopId, Shop>,
    vouchers: HashMap<VoucherId, VoucherInventory>,
    orders: HashMap<OrderId, Order>,
}

/// Record store kept in process memory.
///
/// Transactions are serializable: an open transaction holds the table lock
/// until it commits or is dropped.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    tables: Arc<AsyncMutex<Tables>>,
    outage: Mutex<Option<String>>,
    failing_inserts: Arc<AtomicU32>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the database going away (`Some`) or coming back (`None`).
    pub fn set_unavailable(&self, reason: Option<&str>) {
        let mut guard = match self.outage.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = reason.map(str::to_string);
    }

    /// Make the next `n` order inserts fail as if the connection dropped
    /// mid-transaction.
    pub fn fail_next_inserts(&self, n: u32) {
        self.failing_inserts.store(n, Ordering::SeqCst);
    }

    pub async fn order_total(&self) -> usize {
        self.tables.lock().await.orders.len()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        let guard = self.outage.lock().map_err(|_| StoreError::LockPoisoned)?;
        match guard.as_ref() {
            Some(reason) => Err(StoreError::unavailable(Backend::Records, reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn shop_get(&self, id: ShopId) -> DianpingResult<Option<Shop>> {
        self.check_available()?;
        Ok(self.tables.lock().await.shops.get(&id).cloned())
    }

    async fn shop_insert(&self, shop: &Shop) -> DianpingResult<()> {
        self.check_available()?;
        self.tables.lock().await.shops.insert(shop.shop_id, shop.clone());
        Ok(())
    }

    async fn shop_update(&self, shop: &Shop) -> DianpingResult<()> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        let existing = tables.shops.get_mut(&shop.shop_id).ok_or_else(|| StoreError::NotFound {
            entity: "shop".to_string(),
            id: shop.shop_id.to_string(),
        })?;
        *existing = shop.clone();
        Ok(())
    }

    async fn voucher_get(&self, id: VoucherId) -> DianpingResult<Option<VoucherInventory>> {
        self.check_available()?;
        Ok(self.tables.lock().await.vouchers.get(&id).cloned())
    }

    async fn voucher_insert(&self, voucher: &VoucherInventory) -> DianpingResult<()> {
        self.check_available()?;
        self.tables
            .lock()
            .await
            .vouchers
            .insert(voucher.voucher_id, voucher.clone());
        Ok(())
    }

    async fn order_get(&self, id: OrderId) -> DianpingResult<Option<Order>> {
        self.check_available()?;
        Ok(self.tables.lock().await.orders.get(&id).cloned())
    }

    async fn orders_for_voucher(&self, voucher: VoucherId) -> DianpingResult<Vec<Order>> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| o.voucher_id == voucher)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.order_id);
        Ok(orders)
    }

    async fn begin(&self) -> DianpingResult<Box<dyn RecordTx>> {
        self.check_available()?;
        let guard = Arc::clone(&self.tables).lock_owned().await;
        Ok(Box::new(InMemoryTx {
            tables: guard,
            taken: HashMap::new(),
            inserted: Vec::new(),
            failing_inserts: Arc::clone(&self.failing_inserts),
        }))
    }
}

/// Staged changes over a locked snapshot of the tables.
struct InMemoryTx {
    tables: OwnedMutexGuard<Tables>,
    taken: HashMap<VoucherId, u32>,
    inserted: Vec<Order>,
    failing_inserts: Arc<AtomicU32>,
}

#[async_trait]
impl RecordTx for InMemoryTx {
    async fn order_count(&mut self, user: UserId, voucher: VoucherId) -> DianpingResult<u64> {
        let matches = |o: &&Order| o.user_id == user && o.voucher_id == voucher;
        let committed = self.tables.orders.values().filter(matches).count();
        let staged = self.inserted.iter().filter(matches).count();
        Ok((committed + staged) as u64)
    }

    async fn decrement_stock_if_positive(&mut self, voucher: VoucherId) -> DianpingResult<bool> {
        let Some(row) = self.tables.vouchers.get(&voucher) else {
            return Ok(false);
        };
        let taken = self.taken.entry(voucher).or_insert(0);
        if row.stock > *taken {
            *taken += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn order_insert(&mut self, order: &Order) -> DianpingResult<()> {
        let fail = self
            .failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(StoreError::unavailable(Backend::Records, "connection reset during insert").into());
        }
        self.inserted.push(order.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> DianpingResult<()> {
        let InMemoryTx {
            mut tables,
            taken,
            inserted,
            ..
        } = *self;
        for (voucher, n) in taken {
            if let Some(row) = tables.vouchers.get_mut(&voucher) {
                row.stock -= n;
            }
        }
        for order in inserted {
            tables.orders.insert(order.order_id, order);
        }
        Ok(())
    }
}
