//! Observability setup for the flash-sale service.

pub mod tracer;

pub use tracer::{init_tracing, LogFormat, TelemetryConfig, DEFAULT_LOG_FILTER};
