//! Lease typestate for leased locks.
//!
//! A lease can only be released while it is in the `Held` state, and
//! releasing consumes it.
//!
//! ```text
//! (free) ─── try_lease() ──→ Held ─── release() ──→ (free)
//!                              │
//!                        TTL elapses ──→ (free)
//! ```

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Namespace prefix for every lock key.
pub const LOCK_KEY_PREFIX: &str = "lock:";

/// Full lock key for a resource, e.g. `lock:order:1010`.
pub fn lock_key(resource: &str) -> String {
    format!("{LOCK_KEY_PREFIX}{resource}")
}

// ============================================================================
// HOLDER TOKENS
// ============================================================================

/// Opaque value stored under a lock key by whoever holds it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderToken(String);

impl HolderToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HolderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mints one token per logical operation: `<instance-uuid>-<sequence>`.
#[derive(Debug)]
pub struct HolderTokens {
    instance: Uuid,
    next: AtomicU64,
}

impl HolderTokens {
    pub fn new() -> Self {
        Self::with_instance(Uuid::now_v7())
    }

    pub fn with_instance(instance: Uuid) -> Self {
        Self {
            instance,
            next: AtomicU64::new(1),
        }
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn next_token(&self) -> HolderToken {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        HolderToken(format!("{}-{}", self.instance.simple(), seq))
    }
}

impl Default for HolderTokens {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// LEASE DATA
// ============================================================================

/// What the caller knows about a lease it acquired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    /// Resource name without the `lock:` namespace, e.g. `order:1010`.
    pub resource_key: String,
    pub holder_token: HolderToken,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

impl LockLease {
    pub fn new(resource_key: String, holder_token: HolderToken, acquired_at: Timestamp, lease: Duration) -> Self {
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        Self {
            resource_key,
            holder_token,
            acquired_at,
            expires_at: acquired_at.checked_add_signed(lease).unwrap_or(acquired_at),
        }
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    pub fn remaining(&self, now: Timestamp) -> Option<Duration> {
        if self.is_expired(now) {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }
}

// ============================================================================
// TYPESTATE MARKERS
// ============================================================================

pub trait LeaseState: private::Sealed + Send + Sync {}

/// Lease is currently held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Held;
impl LeaseState for Held {}

/// Lease has been given up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released;
impl LeaseState for Released {}

mod private {
    pub trait Sealed {}
    impl Sealed for super::Held {}
    impl Sealed for super::Released {}
}

/// A lease with compile-time state tracking.
#[derive(Debug)]
pub struct Lease<S: LeaseState> {
    data: LockLease,
    _state: PhantomData<S>,
}

impl<S: LeaseState> Lease<S> {
    pub fn data(&self) -> &LockLease {
        &self.data
    }

    pub fn resource_key(&self) -> &str {
        &self.data.resource_key
    }

    pub fn holder_token(&self) -> &HolderToken {
        &self.data.holder_token
    }

    pub fn expires_at(&self) -> Timestamp {
        self.data.expires_at
    }
}

impl Lease<Held> {
    /// Only called once the store has granted the lease.
    pub fn new(data: LockLease) -> Self {
        Lease {
            data,
            _state: PhantomData,
        }
    }

    /// Give the lease up. The store-side delete is done by the lock before
    /// calling this.
    pub fn release(self) -> Lease<Released> {
        Lease {
            data: self.data,
            _state: PhantomData,
        }
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.data.is_expired(now)
    }
}

impl Lease<Released> {
    pub fn into_data(self) -> LockLease {
        self.data
    }
}
