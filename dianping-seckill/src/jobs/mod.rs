//! Background Jobs for the flash-sale service
//!
//! - `order_consumer`: persists queued orders from the order stream
//!
//! # Usage
//!
//! ```ignore
//! use dianping_seckill::jobs::order_consumer_task;
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let handle = tokio::spawn(order_consumer_task(state.order_consumer(config), shutdown_rx));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! let metrics = handle.await?;
//! ```

pub mod order_consumer;

pub use order_consumer::{order_consumer_task, ConsumerMetrics, ConsumerSnapshot, OrderConsumer};
