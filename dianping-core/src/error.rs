//! Error types for dianping operations

use thiserror::Error;

/// Which external collaborator failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Shared key/value + script + stream store.
    Coordination,
    /// Durable relational record store.
    Records,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Coordination => write!(f, "coordination store"),
            Backend::Records => write!(f, "record store"),
        }
    }
}

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{backend} unavailable: {reason}")]
    Unavailable { backend: Backend, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Script {script} failed: {reason}")]
    Script { script: String, reason: String },

    #[error("Codec error: {reason}")]
    Codec { reason: String },

    #[error("Key {key} holds a value of the wrong type")]
    WrongType { key: String },

    #[error("{entity} with id {id} not found")]
    NotFound { entity: String, id: String },
}

impl StoreError {
    pub fn unavailable(backend: Backend, reason: impl Into<String>) -> Self {
        StoreError::Unavailable {
            backend,
            reason: reason.into(),
        }
    }

    pub fn codec(reason: impl std::fmt::Display) -> Self {
        StoreError::Codec {
            reason: reason.to_string(),
        }
    }
}

/// Admission rejections. Returned to the caller as typed results.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq, Hash)]
pub enum Rejection {
    #[error("voucher is out of stock")]
    OutOfStock,

    #[error("user already holds an order for this voucher")]
    DuplicateOrder,

    #[error("sale has not started")]
    SaleNotStarted,

    #[error("sale has ended")]
    SaleEnded,
}

impl Rejection {
    /// Short message shown to the end user.
    pub fn user_message(&self) -> &'static str {
        match self {
            Rejection::OutOfStock => "Sorry, this voucher is sold out.",
            Rejection::DuplicateOrder => "You have already purchased this voucher.",
            Rejection::SaleNotStarted => "The sale has not started yet.",
            Rejection::SaleEnded => "The sale has ended.",
        }
    }
}

/// Order queue errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Malformed queue entry {entry_id}: {reason}")]
    MalformedEntry { entry_id: String, reason: String },
}

/// Id generation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("Daily sequence exhausted for bucket {bucket}: {sequence}")]
    SequenceExhausted { bucket: String, sequence: i64 },

    #[error("Clock reads before the id epoch")]
    ClockBeforeEpoch,

    #[error("Timestamp part overflows 32 bits: {elapsed}s since the id epoch")]
    TimestampOverflow { elapsed: i64 },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all dianping operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DianpingError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("Lock on {resource} is held elsewhere")]
    LockContention { resource: String },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Id error: {0}")]
    Id(#[from] IdError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl DianpingError {
    /// True when a collaborator was unreachable and the operation must fail.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            DianpingError::Store(StoreError::Unavailable { .. } | StoreError::LockPoisoned)
        )
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self, DianpingError::Rejected(_))
    }

    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            DianpingError::Rejected(r) => Some(*r),
            _ => None,
        }
    }
}

/// Result type alias for dianping operations.
pub type DianpingResult<T> = Result<T, DianpingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display_unavailable() {
        let err = StoreError::unavailable(Backend::Coordination, "connection refused");
        assert_eq!(
            err.to_string(),
            "coordination store unavailable: connection refused"
        );
    }

    #[test]
    fn test_dianping_error_from_variants() {
        let store = DianpingError::from(StoreError::LockPoisoned);
        assert!(matches!(store, DianpingError::Store(_)));
        assert!(store.is_infrastructure());

        let rejected = DianpingError::from(Rejection::OutOfStock);
        assert!(rejected.is_rejection());
        assert_eq!(rejected.rejection(), Some(Rejection::OutOfStock));
        assert!(!rejected.is_infrastructure());

        let id = DianpingError::from(IdError::ClockBeforeEpoch);
        assert!(matches!(id, DianpingError::Id(_)));
    }

    #[test]
    fn test_lock_contention_is_neither_rejection_nor_infrastructure() {
        let err = DianpingError::LockContention {
            resource: "order:7".to_string(),
        };
        assert!(!err.is_rejection());
        assert!(!err.is_infrastructure());
    }

    #[test]
    fn test_rejection_user_messages_are_distinct() {
        let all = [
            Rejection::OutOfStock,
            Rejection::DuplicateOrder,
            Rejection::SaleNotStarted,
            Rejection::SaleEnded,
        ];
        let messages: std::collections::HashSet<_> =
            all.iter().map(|r| r.user_message()).collect();
        assert_eq!(messages.len(), all.len());
    }
}
