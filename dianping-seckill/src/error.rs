//! Error Types for the flash-sale service
//!
//! `ErrorCode` and `ApiError` are the caller-facing shape of a failed
//! operation: typed admission rejections keep their specific message, while
//! infrastructure detail is not leaked. `ServiceError` covers process-level
//! failures of the binary.

use dianping_core::{DianpingError, Rejection};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Admission rejections
    // ========================================================================
    OutOfStock,
    DuplicateOrder,
    SaleNotStarted,
    SaleEnded,

    // ========================================================================
    // Transient
    // ========================================================================
    /// Another request for the same user is being handled.
    Busy,
    /// A backing store could not be reached.
    ServiceUnavailable,

    // ========================================================================
    // Everything else
    // ========================================================================
    InternalError,
}

impl ErrorCode {
    /// Whether retrying the same request later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::Busy | ErrorCode::ServiceUnavailable)
    }
}

impl From<Rejection> for ErrorCode {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::OutOfStock => ErrorCode::OutOfStock,
            Rejection::DuplicateOrder => ErrorCode::DuplicateOrder,
            Rejection::SaleNotStarted => ErrorCode::SaleNotStarted,
            Rejection::SaleEnded => ErrorCode::SaleEnded,
        }
    }
}

// ============================================================================
// API ERROR
// ============================================================================

/// Body returned to the caller for a failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<&DianpingError> for ApiError {
    fn from(err: &DianpingError) -> Self {
        if let Some(rejection) = err.rejection() {
            return ApiError::new(rejection.into(), rejection.user_message());
        }
        match err {
            DianpingError::LockContention { .. } => {
                ApiError::new(ErrorCode::Busy, "Your previous request is still being processed.")
            }
            e if e.is_infrastructure() => ApiError::new(
                ErrorCode::ServiceUnavailable,
                "Service is temporarily unavailable, please retry.",
            ),
            _ => ApiError::new(ErrorCode::InternalError, "Internal error."),
        }
    }
}

impl From<DianpingError> for ApiError {
    fn from(err: DianpingError) -> Self {
        ApiError::from(&err)
    }
}

// ============================================================================
// SERVICE ERROR
// ============================================================================

/// Failures that stop the binary.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Dianping(#[from] DianpingError),

    #[error("Failed to install tracing subscriber: {0}")]
    Telemetry(String),

    #[error("Failed to listen for shutdown signal: {0}")]
    Signal(#[from] std::io::Error),

    #[error("Order consumer task failed: {0}")]
    Consumer(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;
