//! Transactional order persistence.
//!
//! Safe to run more than once for the same queue entry: the uniqueness check
//! and the conditional decrement make a replay a no-op.

use std::sync::Arc;

use dianping_core::{DianpingResult, Order};
use dianping_storage::RecordStore;

/// What a persistence attempt did to the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Stock decremented and the order row written.
    Persisted,
    /// The user already has an order for this voucher; nothing written.
    AlreadyOrdered,
    /// Durable stock is exhausted; nothing written.
    SoldOut,
}

/// One transaction: uniqueness check, `stock = stock - 1 WHERE stock > 0`,
/// insert. Dropping the transaction on any error rolls it back.
#[derive(Clone)]
pub struct PersistOrder {
    records: Arc<dyn RecordStore>,
}

impl PersistOrder {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }

    pub async fn execute(&self, order: &Order) -> DianpingResult<PersistOutcome> {
        let mut tx = self.records.begin().await?;

        if tx.order_count(order.user_id, order.voucher_id).await? > 0 {
            tracing::debug!(
                order_id = %order.order_id,
                user_id = %order.user_id,
                voucher_id = %order.voucher_id,
                "User already holds an order for this voucher"
            );
            return Ok(PersistOutcome::AlreadyOrdered);
        }

        if !tx.decrement_stock_if_positive(order.voucher_id).await? {
            tracing::warn!(
                order_id = %order.order_id,
                voucher_id = %order.voucher_id,
                "Durable stock exhausted"
            );
            return Ok(PersistOutcome::SoldOut);
        }

        tx.order_insert(order).await?;
        tx.commit().await?;
        Ok(PersistOutcome::Persisted)
    }
}

impl std::fmt::Debug for PersistOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistOrder").finish_non_exhaustive()
    }
}
