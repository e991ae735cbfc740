//! Cache-aside reads over the coordination store.

mod client;
mod loader;
mod pool;
mod read;

pub use client::{cache_key, refresh_lock_resource, CacheClient, EMPTY_SENTINEL};
pub use loader::{FnLoader, Loader};
pub use pool::{PoolSnapshot, RebuildPool, SubmitError};
pub use read::{CacheRead, ReadSource};
