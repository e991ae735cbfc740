//! Constants for the flash-sale service
//!
//! Key layouts shared with the admission script and the order consumer live
//! here so both sides agree on them.

use dianping_core::{UserId, VoucherId};

// ============================================================================
// SECKILL KEYS
// ============================================================================

/// Cached remaining stock per voucher.
pub const SECKILL_STOCK_KEY: &str = "seckill:stock:";

/// Set of user ids that already hold an order per voucher.
pub const SECKILL_ORDER_KEY: &str = "seckill:order:";

/// Sale window bounds per voucher, in epoch seconds.
pub const SECKILL_BEGIN_KEY: &str = "seckill:begin:";
pub const SECKILL_END_KEY: &str = "seckill:end:";

pub fn stock_key(voucher: VoucherId) -> String {
    format!("{SECKILL_STOCK_KEY}{voucher}")
}

pub fn buyers_key(voucher: VoucherId) -> String {
    format!("{SECKILL_ORDER_KEY}{voucher}")
}

pub fn begin_key(voucher: VoucherId) -> String {
    format!("{SECKILL_BEGIN_KEY}{voucher}")
}

pub fn end_key(voucher: VoucherId) -> String {
    format!("{SECKILL_END_KEY}{voucher}")
}

// ============================================================================
// LOCKS
// ============================================================================

/// Per-user lock resource serializing order writes; stored as
/// `lock:order:<userId>`.
pub fn order_lock_resource(user: UserId) -> String {
    format!("order:{user}")
}

// ============================================================================
// CACHE
// ============================================================================

pub const CACHE_SHOP_KEY: &str = "cache:shop:";

// ============================================================================
// DEAD LETTERS
// ============================================================================

/// Extra fields written next to the source fields of a dead-lettered entry.
pub const DEAD_LETTER_FIELD_ERROR: &str = "error";
pub const DEAD_LETTER_FIELD_SOURCE_ID: &str = "sourceId";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let voucher = VoucherId::new(11);
        assert_eq!(stock_key(voucher), "seckill:stock:11");
        assert_eq!(buyers_key(voucher), "seckill:order:11");
        assert_eq!(begin_key(voucher), "seckill:begin:11");
        assert_eq!(end_key(voucher), "seckill:end:11");
        assert_eq!(
            dianping_core::lock_key(&order_lock_resource(UserId::new(5))),
            "lock:order:5"
        );
    }
}
