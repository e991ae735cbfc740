//! Dianping Core - Entity Types
//!
//! Identifiers, entities, lease typestate, errors and configuration shared by
//! the storage and seckill crates. No I/O lives here.

mod config;
mod entities;
mod error;
mod identity;
mod lock;

pub use config::*;
pub use entities::*;
pub use error::*;
pub use identity::*;
pub use lock::*;
