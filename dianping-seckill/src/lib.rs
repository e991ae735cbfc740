//! Dianping Seckill - Flash-Sale Order Pipeline
//!
//! Admission control for limited-inventory vouchers, asynchronous order
//! persistence from the order stream, and cached shop listing reads.
//!
//! A purchase attempt is decided by one atomic script in the coordination
//! store; granted orders are queued on a stream and written to the record
//! store by a single background `OrderConsumer` per process.

pub mod admission;
pub mod constants;
pub mod error;
pub mod jobs;
pub mod persist;
pub mod pipeline;
pub mod shop;
pub mod state;
pub mod telemetry;

// Re-export commonly used types
pub use admission::{AdmissionCheck, AdmissionDecision};
pub use error::{ApiError, ErrorCode, ServiceError, ServiceResult};
pub use jobs::{order_consumer_task, ConsumerMetrics, ConsumerSnapshot, OrderConsumer};
pub use persist::{PersistOrder, PersistOutcome};
pub use pipeline::SeckillPipeline;
pub use shop::{ShopLoader, ShopService};
pub use state::{AppState, SeckillContext};
