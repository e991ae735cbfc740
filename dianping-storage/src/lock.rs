//! Leased mutual exclusion.
//!
//! `try_lock` never waits: it either takes the lease in one atomic step or
//! reports contention. `unlock` deletes the key only while it still holds the
//! caller's token, so a holder whose lease already ran out cannot remove a
//! lease granted to someone else afterwards.

use crate::coordination::{CoordinationStore, Script};
use async_trait::async_trait;
use dianping_core::{
    lock_key, ConfigError, DianpingError, DianpingResult, HolderToken, Held, Lease, LockLease,
    StoreError, Timestamp,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Non-reentrant leased lock over named resources (`order:1010`,
/// `cache:shop:1`). Implementations store the lease under `lock:<resource>`.
#[async_trait]
pub trait DistributedLock: Send + Sync + 'static {
    async fn try_lock(&self, resource: &str, token: &HolderToken, lease: Duration) -> DianpingResult<bool>;

    /// Returns `true` only when this token's lease was removed.
    async fn unlock(&self, resource: &str, token: &HolderToken) -> DianpingResult<bool>;
}

fn check_lease(lease: Duration) -> DianpingResult<()> {
    if lease.is_zero() {
        return Err(DianpingError::Config(ConfigError::InvalidValue {
            field: "lease".to_string(),
            value: format!("{lease:?}"),
            reason: "lease must be greater than 0".to_string(),
        }));
    }
    Ok(())
}

// ============================================================================
// COORDINATION-STORE LOCK
// ============================================================================

/// Lock shared by every process using the same coordination store.
#[derive(Debug)]
pub struct StoreLock<S: CoordinationStore> {
    store: Arc<S>,
}

impl<S: CoordinationStore> StoreLock<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: CoordinationStore> DistributedLock for StoreLock<S> {
    async fn try_lock(&self, resource: &str, token: &HolderToken, lease: Duration) -> DianpingResult<bool> {
        check_lease(lease)?;
        self.store
            .set_if_absent(&lock_key(resource), token.as_str(), lease)
            .await
    }

    async fn unlock(&self, resource: &str, token: &HolderToken) -> DianpingResult<bool> {
        let script = Script::CompareAndDelete {
            key: lock_key(resource),
            expected: token.as_str().to_string(),
        };
        Ok(self.store.eval(&script).await? == 1)
    }
}

// ============================================================================
// LOCAL LOCK
// ============================================================================

/// Lock confined to this process, for single-instance deployments.
#[derive(Debug, Default)]
pub struct LocalLock {
    leases: Mutex<HashMap<String, (HolderToken, Instant)>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leases currently tracked, expired ones not yet pruned included.
    pub fn lease_count(&self) -> usize {
        self.leases.lock().map_or(0, |leases| leases.len())
    }
}

#[async_trait]
impl DistributedLock for LocalLock {
    async fn try_lock(&self, resource: &str, token: &HolderToken, lease: Duration) -> DianpingResult<bool> {
        check_lease(lease)?;
        let now = Instant::now();
        let mut leases = self.leases.lock().map_err(|_| StoreError::LockPoisoned)?;
        // Leases that ran out without an unlock are dropped here.
        leases.retain(|_, (_, expires)| *expires > now);
        let key = lock_key(resource);
        if leases.contains_key(&key) {
            return Ok(false);
        }
        leases.insert(key, (token.clone(), now + lease));
        Ok(true)
    }

    async fn unlock(&self, resource: &str, token: &HolderToken) -> DianpingResult<bool> {
        let now = Instant::now();
        let mut leases = self.leases.lock().map_err(|_| StoreError::LockPoisoned)?;
        let key = lock_key(resource);
        match leases.get(&key) {
            Some((holder, expires)) if holder == token && *expires > now => {
                leases.remove(&key);
                Ok(true)
            }
            Some((_, expires)) if *expires <= now => {
                leases.remove(&key);
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}

// ============================================================================
// TYPED LEASES
// ============================================================================

/// Try to take `resource` and wrap the grant in a `Lease<Held>`.
pub async fn try_lease<L: DistributedLock + ?Sized>(
    lock: &L,
    resource: &str,
    token: HolderToken,
    lease: Duration,
    now: Timestamp,
) -> DianpingResult<Option<Lease<Held>>> {
    if !lock.try_lock(resource, &token, lease).await? {
        return Ok(None);
    }
    Ok(Some(Lease::new(LockLease::new(
        resource.to_string(),
        token,
        now,
        lease,
    ))))
}

/// Release a held lease. `false` means the lease had already expired and the
/// key was left untouched.
pub async fn release_lease<L: DistributedLock + ?Sized>(
    lock: &L,
    lease: Lease<Held>,
) -> DianpingResult<bool> {
    let removed = lock.unlock(lease.resource_key(), lease.holder_token()).await?;
    let _ = lease.release();
    Ok(removed)
}
