//! Order Consumer Background Task
//!
//! Persists the orders that admission queued on the order stream. Exactly one
//! consumer runs per process, so writes within a process are serialized by
//! the task itself; the per-user lock only matters across processes.
//!
//! Delivery is at-least-once. An entry is acknowledged only after it has been
//! handled; anything that fails mid-way stays on the group's pending list and
//! is replayed by the recovery pass, which runs on start and after every
//! error. Replays are safe because `PersistOrder` re-checks uniqueness and
//! decrements stock conditionally.
//!
//! Entries are acknowledged without being persisted when:
//!
//! - the fields do not decode (malformed, never retried)
//! - the per-user lock is held elsewhere (admission already deduplicated)
//! - they were delivered more than `max_deliveries` times (copied to the
//!   dead-letter stream first)
//!
//! # Usage
//!
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let handle = tokio::spawn(order_consumer_task(consumer, shutdown_rx));
//! // ...
//! let _ = shutdown_tx.send(true);
//! let metrics = handle.await?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dianping_core::{
    Clock, ConsumerConfig, DianpingResult, HolderTokens, Order, QueueEntry,
};
use dianping_storage::{
    release_lease, try_lease, CoordinationStore, DistributedLock, GroupCursor, ReadFrom,
    StreamEntry, StreamId,
};
use tokio::sync::watch;

use crate::constants::{order_lock_resource, DEAD_LETTER_FIELD_ERROR, DEAD_LETTER_FIELD_SOURCE_ID};
use crate::persist::{PersistOrder, PersistOutcome};
use crate::state::SeckillContext;

// ============================================================================
// METRICS
// ============================================================================

/// Counters for consumer activity since start.
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    /// Entries handed to the consumer, replays included
    pub entries_read: AtomicU64,

    /// Orders written to the record store
    pub persisted: AtomicU64,

    /// Entries whose order already existed
    pub duplicates_skipped: AtomicU64,

    /// Entries refused by the durable stock check
    pub sold_out_skipped: AtomicU64,

    /// Entries dropped because the per-user lock was held elsewhere
    pub lock_contention_dropped: AtomicU64,

    /// Entries acknowledged because their fields did not decode
    pub malformed_discarded: AtomicU64,

    /// Entries moved to the dead-letter stream
    pub dead_lettered: AtomicU64,

    /// Reads or entries that failed and were left pending
    pub processing_errors: AtomicU64,

    /// Pending-list replays started
    pub recovery_passes: AtomicU64,
}

impl ConsumerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            entries_read: self.entries_read.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            sold_out_skipped: self.sold_out_skipped.load(Ordering::Relaxed),
            lock_contention_dropped: self.lock_contention_dropped.load(Ordering::Relaxed),
            malformed_discarded: self.malformed_discarded.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
            recovery_passes: self.recovery_passes.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of consumer metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumerSnapshot {
    pub entries_read: u64,
    pub persisted: u64,
    pub duplicates_skipped: u64,
    pub sold_out_skipped: u64,
    pub lock_contention_dropped: u64,
    pub malformed_discarded: u64,
    pub dead_lettered: u64,
    pub processing_errors: u64,
    pub recovery_passes: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ============================================================================
// CONSUMER
// ============================================================================

pub struct OrderConsumer<S: CoordinationStore> {
    store: Arc<S>,
    persist: PersistOrder,
    lock: Arc<dyn DistributedLock>,
    tokens: Arc<HolderTokens>,
    clock: Arc<dyn Clock>,
    cursor: GroupCursor,
    config: ConsumerConfig,
    order_lock_lease: Duration,
    metrics: Arc<ConsumerMetrics>,
}

impl<S: CoordinationStore> OrderConsumer<S> {
    pub fn new(context: &SeckillContext<S>, config: ConsumerConfig, order_lock_lease: Duration) -> Self {
        Self {
            store: Arc::clone(&context.store),
            persist: PersistOrder::new(Arc::clone(&context.records)),
            lock: Arc::clone(&context.lock),
            tokens: Arc::clone(&context.tokens),
            clock: Arc::clone(&context.clock),
            cursor: GroupCursor::new(&config.stream_key, &config.group, &config.consumer),
            config,
            order_lock_lease,
            metrics: Arc::new(ConsumerMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<ConsumerMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn cursor(&self) -> &GroupCursor {
        &self.cursor
    }

    /// Entries delivered to this consumer and not yet acknowledged.
    pub async fn pending_depth(&self) -> DianpingResult<u64> {
        self.store.pending_count(&self.cursor).await
    }

    /// Replay this consumer's pending list until it is empty. Creates the
    /// group first if it does not exist yet.
    pub async fn recover(&self, shutdown: &watch::Receiver<bool>) -> DianpingResult<()> {
        bump(&self.metrics.recovery_passes);
        if self.store.group_create(&self.cursor.stream, &self.cursor.group).await? {
            tracing::info!(
                stream = %self.cursor.stream,
                group = %self.cursor.group,
                "Consumer group created"
            );
        }

        let mut after = StreamId::ZERO;
        let mut replayed = 0u64;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let entries = self
                .store
                .read_group(&self.cursor, ReadFrom::PendingAfter(after), self.config.batch, None)
                .await?;
            let Some(last) = entries.last() else {
                break;
            };
            after = last.id;
            self.metrics
                .entries_read
                .fetch_add(entries.len() as u64, Ordering::Relaxed);
            for entry in &entries {
                self.handle(entry).await?;
                replayed += 1;
            }
        }

        if replayed > 0 {
            tracing::info!(replayed, "Pending entries recovered");
        } else {
            tracing::trace!("Pending list empty");
        }
        Ok(())
    }

    /// Handle one delivered entry. `Ok` means it was acknowledged; `Err`
    /// leaves it pending.
    pub async fn handle(&self, entry: &StreamEntry) -> DianpingResult<()> {
        if self.config.max_deliveries > 0 && entry.delivery_count > self.config.max_deliveries {
            return self.dead_letter(entry).await;
        }

        let queued = match QueueEntry::from_fields(&entry.id.to_string(), &entry.fields, entry.id.timestamp()) {
            Ok(queued) => queued,
            Err(e) => {
                tracing::warn!(entry_id = %entry.id, error = %e, "Discarding malformed queue entry");
                self.ack(entry.id).await?;
                bump(&self.metrics.malformed_discarded);
                return Ok(());
            }
        };

        let resource = order_lock_resource(queued.user_id);
        let lease = try_lease(
            &*self.lock,
            &resource,
            self.tokens.next_token(),
            self.order_lock_lease,
            self.clock.now(),
        )
        .await?;
        let Some(lease) = lease else {
            // Admission already guaranteed one order per user; whoever holds
            // the lock is writing it.
            tracing::warn!(
                entry_id = %entry.id,
                user_id = %queued.user_id,
                voucher_id = %queued.voucher_id,
                order_id = %queued.order_id,
                "Order lock held elsewhere, dropping entry"
            );
            self.ack(entry.id).await?;
            bump(&self.metrics.lock_contention_dropped);
            return Ok(());
        };

        let order = Order {
            order_id: queued.order_id,
            voucher_id: queued.voucher_id,
            user_id: queued.user_id,
            created_at: queued.enqueued_at,
        };
        let outcome = self.persist.execute(&order).await;
        if let Err(e) = release_lease(&*self.lock, lease).await {
            tracing::warn!(resource = %resource, error = %e, "Failed to release order lock");
        }

        match outcome? {
            PersistOutcome::Persisted => {
                self.ack(entry.id).await?;
                bump(&self.metrics.persisted);
                tracing::debug!(order_id = %order.order_id, entry_id = %entry.id, "Order persisted");
            }
            PersistOutcome::AlreadyOrdered => {
                self.ack(entry.id).await?;
                bump(&self.metrics.duplicates_skipped);
            }
            PersistOutcome::SoldOut => {
                self.ack(entry.id).await?;
                bump(&self.metrics.sold_out_skipped);
            }
        }
        Ok(())
    }

    async fn dead_letter(&self, entry: &StreamEntry) -> DianpingResult<()> {
        let reason = format!("exceeded {} deliveries", self.config.max_deliveries);
        let mut fields: Vec<(String, String)> = entry
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        fields.push((DEAD_LETTER_FIELD_ERROR.to_string(), reason.clone()));
        fields.push((DEAD_LETTER_FIELD_SOURCE_ID.to_string(), entry.id.to_string()));

        let dead_id = self.store.stream_add(&self.config.dead_letter_key, &fields).await?;
        self.ack(entry.id).await?;
        bump(&self.metrics.dead_lettered);
        tracing::error!(
            entry_id = %entry.id,
            dead_letter_id = %dead_id,
            deliveries = entry.delivery_count,
            dead_letter_key = %self.config.dead_letter_key,
            reason = %reason,
            "Queue entry dead-lettered"
        );
        Ok(())
    }

    async fn ack(&self, id: StreamId) -> DianpingResult<()> {
        self.store.ack(&self.cursor, &[id]).await?;
        Ok(())
    }

    async fn handle_batch(&self, entries: &[StreamEntry]) -> DianpingResult<()> {
        self.metrics
            .entries_read
            .fetch_add(entries.len() as u64, Ordering::Relaxed);
        for entry in entries {
            self.handle(entry).await?;
        }
        Ok(())
    }

    /// Sleep for the retry backoff unless shutdown arrives first.
    async fn back_off(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.retry_backoff) => {}
            _ = shutdown.changed() => {}
        }
    }
}

impl<S: CoordinationStore> std::fmt::Debug for OrderConsumer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderConsumer")
            .field("cursor", &self.cursor)
            .field("config", &self.config)
            .field("metrics", &self.metrics.snapshot())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Run the consumer until the shutdown signal is received.
///
/// Replays the pending list first, then tails new entries with a bounded
/// blocking read. Any failure is counted, backed off, and followed by
/// another pending replay before the live tail resumes.
///
/// # Returns
///
/// Metrics collected during the task's lifetime
pub async fn order_consumer_task<S: CoordinationStore>(
    consumer: OrderConsumer<S>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<ConsumerMetrics> {
    let metrics = consumer.metrics();

    tracing::info!(
        stream = %consumer.cursor.stream,
        group = %consumer.cursor.group,
        consumer = %consumer.cursor.consumer,
        block_ms = consumer.config.block.as_millis() as u64,
        max_deliveries = consumer.config.max_deliveries,
        "Order consumer started"
    );

    let mut needs_recovery = true;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        if needs_recovery {
            match consumer.recover(&shutdown_rx).await {
                Ok(()) => needs_recovery = false,
                Err(e) => {
                    bump(&metrics.processing_errors);
                    tracing::error!(error = %e, "Pending recovery failed");
                    consumer.back_off(&mut shutdown_rx).await;
                    continue;
                }
            }
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            read = consumer.store.read_group(
                &consumer.cursor,
                ReadFrom::New,
                consumer.config.batch,
                Some(consumer.config.block),
            ) => {
                let result = match read {
                    Ok(entries) => consumer.handle_batch(&entries).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    bump(&metrics.processing_errors);
                    tracing::error!(error = %e, "Order processing failed, replaying pending list");
                    needs_recovery = true;
                    consumer.back_off(&mut shutdown_rx).await;
                }
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        entries_read = snapshot.entries_read,
        persisted = snapshot.persisted,
        duplicates_skipped = snapshot.duplicates_skipped,
        sold_out_skipped = snapshot.sold_out_skipped,
        lock_contention_dropped = snapshot.lock_contention_dropped,
        malformed_discarded = snapshot.malformed_discarded,
        dead_lettered = snapshot.dead_lettered,
        processing_errors = snapshot.processing_errors,
        recovery_passes = snapshot.recovery_passes,
        "Order consumer stopped"
    );

    metrics
}
