//! Flash-sale order pipeline.
//!
//! `attempt` mints the order id first, then runs the admission script once.
//! In stream mode a grant means the order is already queued for the
//! `OrderConsumer` and the id is returned at once. In direct mode the request
//! takes the per-user lock first, then runs admission and persists the order
//! itself; a grant whose write fails is reverted before the error returns.

use std::sync::Arc;

use dianping_core::{
    Clock, DianpingError, DianpingResult, DispatchMode, HolderTokens, Order, OrderId, Rejection,
    SeckillConfig, UserId, VoucherId, VoucherInventory,
};
use dianping_storage::{
    release_lease, try_lease, CoordinationStore, DistributedLock, IdGenerator, RecordStore,
};

use crate::admission::AdmissionCheck;
use crate::constants::{begin_key, end_key, order_lock_resource, stock_key};
use crate::persist::{PersistOrder, PersistOutcome};
use crate::state::SeckillContext;

pub struct SeckillPipeline<S: CoordinationStore> {
    ids: IdGenerator<S>,
    admission: AdmissionCheck<S>,
    persist: PersistOrder,
    store: Arc<S>,
    records: Arc<dyn RecordStore>,
    lock: Arc<dyn DistributedLock>,
    tokens: Arc<HolderTokens>,
    clock: Arc<dyn Clock>,
    config: SeckillConfig,
    stream_key: String,
}

impl<S: CoordinationStore> SeckillPipeline<S> {
    pub fn new(context: &SeckillContext<S>, config: SeckillConfig, stream_key: &str) -> Self {
        Self {
            ids: IdGenerator::new(Arc::clone(&context.store), Arc::clone(&context.clock)),
            admission: AdmissionCheck::new(Arc::clone(&context.store)),
            persist: PersistOrder::new(Arc::clone(&context.records)),
            store: Arc::clone(&context.store),
            records: Arc::clone(&context.records),
            lock: Arc::clone(&context.lock),
            tokens: Arc::clone(&context.tokens),
            clock: Arc::clone(&context.clock),
            config,
            stream_key: stream_key.to_string(),
        }
    }

    pub fn config(&self) -> &SeckillConfig {
        &self.config
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Store a voucher and seed its stock and sale window in the
    /// coordination store. Re-publishing overwrites the cached stock.
    pub async fn publish_voucher(&self, inventory: &VoucherInventory) -> DianpingResult<()> {
        let voucher = inventory.voucher_id;
        self.records.voucher_insert(inventory).await?;
        self.store
            .set(&stock_key(voucher), &inventory.stock.to_string(), None)
            .await?;
        self.store
            .set(
                &begin_key(voucher),
                &inventory.sale_window.begin().timestamp().to_string(),
                None,
            )
            .await?;
        self.store
            .set(
                &end_key(voucher),
                &inventory.sale_window.end().timestamp().to_string(),
                None,
            )
            .await?;

        tracing::info!(
            voucher_id = %voucher,
            stock = inventory.stock,
            begin = %inventory.sale_window.begin(),
            end = %inventory.sale_window.end(),
            "Voucher published"
        );
        Ok(())
    }

    /// Try to buy one unit of `voucher` for `user`.
    ///
    /// Returns the order id on a grant. Rejections come back as
    /// `DianpingError::Rejected`; an unreachable store fails the attempt.
    pub async fn attempt(&self, voucher: VoucherId, user: UserId) -> DianpingResult<OrderId> {
        let order_id = self.ids.next_id(&self.config.id_bucket).await?;
        match self.config.mode {
            DispatchMode::Stream => {
                self.admit(voucher, user, order_id, Some(self.stream_key.as_str()))
                    .await?;
                tracing::debug!(
                    voucher_id = %voucher,
                    user_id = %user,
                    order_id = %order_id,
                    "Order queued"
                );
                Ok(order_id)
            }
            DispatchMode::Direct => self.attempt_direct(voucher, user, order_id).await,
        }
    }

    async fn admit(
        &self,
        voucher: VoucherId,
        user: UserId,
        order_id: OrderId,
        stream: Option<&str>,
    ) -> DianpingResult<()> {
        let decision = self
            .admission
            .evaluate(voucher, user, order_id, self.clock.now(), stream)
            .await?;
        if let Err(rejection) = decision.into_result() {
            tracing::debug!(
                voucher_id = %voucher,
                user_id = %user,
                reason = %rejection,
                "Attempt rejected"
            );
            return Err(rejection.into());
        }
        Ok(())
    }

    /// Direct mode holds the per-user lock across admission and the write, so
    /// contention is reported before anything is granted.
    async fn attempt_direct(
        &self,
        voucher: VoucherId,
        user: UserId,
        order_id: OrderId,
    ) -> DianpingResult<OrderId> {
        let resource = order_lock_resource(user);
        let lease = try_lease(
            &*self.lock,
            &resource,
            self.tokens.next_token(),
            self.config.order_lock_lease,
            self.clock.now(),
        )
        .await?;
        let Some(lease) = lease else {
            tracing::warn!(
                user_id = %user,
                voucher_id = %voucher,
                order_id = %order_id,
                "Order lock held elsewhere"
            );
            return Err(DianpingError::LockContention { resource });
        };

        let result = self.admit_and_persist(voucher, user, order_id).await;
        if let Err(e) = release_lease(&*self.lock, lease).await {
            tracing::warn!(resource = %resource, error = %e, "Failed to release order lock");
        }
        result.map(|()| order_id)
    }

    async fn admit_and_persist(
        &self,
        voucher: VoucherId,
        user: UserId,
        order_id: OrderId,
    ) -> DianpingResult<()> {
        self.admit(voucher, user, order_id, None).await?;
        let order = Order {
            order_id,
            voucher_id: voucher,
            user_id: user,
            created_at: self.clock.now(),
        };

        match self.persist.execute(&order).await {
            Ok(PersistOutcome::Persisted) => {
                tracing::debug!(order_id = %order_id, "Order persisted");
                Ok(())
            }
            Ok(PersistOutcome::AlreadyOrdered) => Err(Rejection::DuplicateOrder.into()),
            Ok(PersistOutcome::SoldOut) => Err(Rejection::OutOfStock.into()),
            Err(e) => {
                // The transaction rolled back; hand the grant back so a retry
                // can be admitted again.
                match self.admission.revert(voucher, user).await {
                    Ok(reverted) => tracing::warn!(
                        order_id = %order_id,
                        user_id = %user,
                        voucher_id = %voucher,
                        reverted,
                        error = %e,
                        "Order not persisted, admission grant reverted"
                    ),
                    Err(revert_err) => tracing::error!(
                        order_id = %order_id,
                        user_id = %user,
                        voucher_id = %voucher,
                        error = %e,
                        revert_error = %revert_err,
                        "Order not persisted and admission grant could not be reverted"
                    ),
                }
                Err(e)
            }
        }
    }
}

impl<S: CoordinationStore> std::fmt::Debug for SeckillPipeline<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeckillPipeline")
            .field("config", &self.config)
            .field("stream_key", &self.stream_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dianping_core::DEFAULT_STREAM_KEY;
    use dianping_storage::InMemoryCoordinationStore;
    use dianping_test_utils::{fixtures, in_memory_stack, MemoryStack};

    fn pipeline(stack: &MemoryStack, mode: DispatchMode) -> SeckillPipeline<InMemoryCoordinationStore> {
        let context = SeckillContext::new(
            Arc::clone(&stack.coordination),
            stack.records_dyn(),
            stack.clock_dyn(),
        );
        SeckillPipeline::new(
            &context,
            SeckillConfig::development().with_mode(mode),
            DEFAULT_STREAM_KEY,
        )
    }

    #[tokio::test]
    async fn test_publish_seeds_coordination_keys() {
        let stack = in_memory_stack();
        let pipeline = pipeline(&stack, DispatchMode::Stream);
        let voucher = fixtures::open_voucher(4, 25, stack.now());
        pipeline.publish_voucher(&voucher).await.unwrap();

        let store = &stack.coordination;
        assert_eq!(store.get("seckill:stock:4").await.unwrap().as_deref(), Some("25"));
        let begin = voucher.sale_window.begin().timestamp().to_string();
        assert_eq!(store.get("seckill:begin:4").await.unwrap(), Some(begin));
        assert!(stack.records.voucher_get(VoucherId::new(4)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stream_mode_queues_and_returns_id() {
        let stack = in_memory_stack();
        let pipeline = pipeline(&stack, DispatchMode::Stream);
        pipeline
            .publish_voucher(&fixtures::open_voucher(1, 2, stack.now()))
            .await
            .unwrap();

        let id = pipeline.attempt(VoucherId::new(1), UserId::new(9)).await.unwrap();
        let queued = stack.coordination.stream_range(DEFAULT_STREAM_KEY).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].fields.get("orderId"), Some(&id.to_string()));
        // Nothing durable yet.
        assert_eq!(stack.records.order_total().await, 0);
    }

    #[tokio::test]
    async fn test_direct_mode_persists_on_request_path() {
        let stack = in_memory_stack();
        let pipeline = pipeline(&stack, DispatchMode::Direct);
        pipeline
            .publish_voucher(&fixtures::open_voucher(1, 2, stack.now()))
            .await
            .unwrap();

        let id = pipeline.attempt(VoucherId::new(1), UserId::new(9)).await.unwrap();
        assert!(stack.records.order_get(id).await.unwrap().is_some());
        assert_eq!(stack.coordination.stream_len(DEFAULT_STREAM_KEY).await.unwrap(), 0);
        // Lock released afterwards.
        assert_eq!(stack.coordination.get("lock:order:9").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_direct_mode_contention_grants_nothing() {
        let stack = in_memory_stack();
        let pipeline = pipeline(&stack, DispatchMode::Direct);
        pipeline
            .publish_voucher(&fixtures::open_voucher(1, 5, stack.now()))
            .await
            .unwrap();
        stack
            .coordination
            .set("lock:order:9", "someone-else", Some(std::time::Duration::from_secs(30)))
            .await
            .unwrap();

        let result = pipeline.attempt(VoucherId::new(1), UserId::new(9)).await;
        dianping_test_utils::assertions::assert_lock_contention(&result);
        let store = &stack.coordination;
        assert_eq!(store.get("seckill:stock:1").await.unwrap().as_deref(), Some("5"));
        assert!(!store.set_contains("seckill:order:1", "9").await.unwrap());

        store.delete("lock:order:9").await.unwrap();
        let id = pipeline.attempt(VoucherId::new(1), UserId::new(9)).await.unwrap();
        assert!(stack.records.order_get(id).await.unwrap().is_some());
        assert_eq!(store.get("seckill:stock:1").await.unwrap().as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_direct_mode_reverts_grant_when_records_are_down() {
        let stack = in_memory_stack();
        let pipeline = pipeline(&stack, DispatchMode::Direct);
        pipeline
            .publish_voucher(&fixtures::open_voucher(1, 5, stack.now()))
            .await
            .unwrap();
        stack.records.set_unavailable(Some("database down"));

        let result = pipeline.attempt(VoucherId::new(1), UserId::new(9)).await;
        dianping_test_utils::assertions::assert_infrastructure(&result);
        let store = &stack.coordination;
        assert_eq!(store.get("seckill:stock:1").await.unwrap().as_deref(), Some("5"));
        assert!(!store.set_contains("seckill:order:1", "9").await.unwrap());
        assert_eq!(store.get("lock:order:9").await.unwrap(), None);

        stack.records.set_unavailable(None);
        let id = pipeline.attempt(VoucherId::new(1), UserId::new(9)).await.unwrap();
        assert!(stack.records.order_get(id).await.unwrap().is_some());
        let inventory = stack.records.voucher_get(VoucherId::new(1)).await.unwrap().unwrap();
        assert_eq!(inventory.stock, 4);
    }

    #[tokio::test]
    async fn test_direct_mode_failed_insert_can_be_retried() {
        let stack = in_memory_stack();
        let pipeline = pipeline(&stack, DispatchMode::Direct);
        pipeline
            .publish_voucher(&fixtures::open_voucher(1, 1, stack.now()))
            .await
            .unwrap();
        stack.records.fail_next_inserts(1);

        assert!(pipeline.attempt(VoucherId::new(1), UserId::new(9)).await.is_err());
        assert_eq!(stack.coordination.get("seckill:stock:1").await.unwrap().as_deref(), Some("1"));

        // The last unit is still available to the same buyer.
        let id = pipeline.attempt(VoucherId::new(1), UserId::new(9)).await.unwrap();
        assert!(stack.records.order_get(id).await.unwrap().is_some());
        let again = pipeline.attempt(VoucherId::new(1), UserId::new(9)).await;
        dianping_test_utils::assertions::assert_rejected(&again, Rejection::DuplicateOrder);
    }

    #[tokio::test]
    async fn test_id_failure_stops_before_admission() {
        let stack = in_memory_stack();
        let pipeline = pipeline(&stack, DispatchMode::Stream);
        pipeline
            .publish_voucher(&fixtures::open_voucher(1, 2, stack.now()))
            .await
            .unwrap();
        stack.coordination.set_unavailable(Some("down"));
        let result = pipeline.attempt(VoucherId::new(1), UserId::new(9)).await;
        dianping_test_utils::assertions::assert_infrastructure(&result);

        stack.coordination.set_unavailable(None);
        assert_eq!(stack.coordination.get("seckill:stock:1").await.unwrap().as_deref(), Some("2"));
    }
}
