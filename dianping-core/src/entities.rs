//! Entity types for the flash-sale pipeline and the listing cache.

use crate::{ConfigError, OrderId, QueueError, ShopId, Timestamp, UserId, VoucherId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// SALE WINDOW
// ============================================================================

/// Where `now` falls relative to a sale window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStatus {
    NotStarted,
    Open,
    Ended,
}

/// Half-open `[begin, end)` period during which a voucher may be bought.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleWindow {
    begin: Timestamp,
    end: Timestamp,
}

impl SaleWindow {
    pub fn new(begin: Timestamp, end: Timestamp) -> Result<Self, ConfigError> {
        if end <= begin {
            return Err(ConfigError::InvalidValue {
                field: "sale_window".to_string(),
                value: format!("{begin}..{end}"),
                reason: "end must be after begin".to_string(),
            });
        }
        Ok(Self { begin, end })
    }

    pub fn begin(&self) -> Timestamp {
        self.begin
    }

    pub fn end(&self) -> Timestamp {
        self.end
    }

    pub fn status(&self, now: Timestamp) -> WindowStatus {
        if now < self.begin {
            WindowStatus::NotStarted
        } else if now >= self.end {
            WindowStatus::Ended
        } else {
            WindowStatus::Open
        }
    }

    pub fn contains(&self, now: Timestamp) -> bool {
        self.status(now) == WindowStatus::Open
    }
}

// ============================================================================
// VOUCHERS AND ORDERS
// ============================================================================

/// Durable inventory of a flash-sale voucher.
///
/// `stock` only ever changes through the record store's conditional
/// decrement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherInventory {
    pub voucher_id: VoucherId,
    pub stock: u32,
    pub sale_window: SaleWindow,
}

/// A persisted voucher order. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: OrderId,
    pub voucher_id: VoucherId,
    pub user_id: UserId,
    pub created_at: Timestamp,
}

// ============================================================================
// SHOP LISTING
// ============================================================================

/// Business listing served through the cache-aside read path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shop {
    pub shop_id: ShopId,
    pub name: String,
    pub type_id: u64,
    pub area: String,
    pub address: String,
    /// Average spend per customer, in cents.
    pub avg_price: u64,
    /// Rating times ten (4.7 stars is 47).
    pub score: u32,
    pub updated_at: Timestamp,
}

// ============================================================================
// QUEUE ENTRY
// ============================================================================

/// Order handed from the admission step to the background consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub order_id: OrderId,
    pub voucher_id: VoucherId,
    pub user_id: UserId,
    pub enqueued_at: Timestamp,
}

impl QueueEntry {
    pub const FIELD_ORDER_ID: &'static str = "orderId";
    pub const FIELD_VOUCHER_ID: &'static str = "voucherId";
    pub const FIELD_USER_ID: &'static str = "userId";

    /// Flat field map as written to the stream. The enqueue time lives in the
    /// stream entry id, not in the fields.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (Self::FIELD_ORDER_ID.to_string(), self.order_id.to_string()),
            (Self::FIELD_VOUCHER_ID.to_string(), self.voucher_id.to_string()),
            (Self::FIELD_USER_ID.to_string(), self.user_id.to_string()),
        ]
    }

    pub fn from_fields(
        entry_id: &str,
        fields: &BTreeMap<String, String>,
        enqueued_at: Timestamp,
    ) -> Result<Self, QueueError> {
        Ok(Self {
            order_id: OrderId::new(field(entry_id, fields, Self::FIELD_ORDER_ID)?),
            voucher_id: VoucherId::new(field(entry_id, fields, Self::FIELD_VOUCHER_ID)?),
            user_id: UserId::new(field(entry_id, fields, Self::FIELD_USER_ID)?),
            enqueued_at,
        })
    }
}

fn field(entry_id: &str, fields: &BTreeMap<String, String>, name: &str) -> Result<u64, QueueError> {
    let raw = fields.get(name).ok_or_else(|| QueueError::MalformedEntry {
        entry_id: entry_id.to_string(),
        reason: format!("missing field {name}"),
    })?;
    raw.trim().parse().map_err(|e| QueueError::MalformedEntry {
        entry_id: entry_id.to_string(),
        reason: format!("field {name}={raw:?}: {e}"),
    })
}

// ============================================================================
// LOGICAL-EXPIRY ENVELOPE
// ============================================================================

/// Cache envelope whose validity is decided by comparing `expire_time` to now.
/// The key itself never physically expires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalEntry<T> {
    pub data: T,
    pub expire_time: Timestamp,
}

impl<T> LogicalEntry<T> {
    pub fn new(data: T, expire_time: Timestamp) -> Self {
        Self { data, expire_time }
    }

    /// Still fresh only while `expire_time` is strictly after `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expire_time <= now
    }
}
