//! Cache read results.

use dianping_core::Timestamp;

/// Where a returned value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Served from the coordination store.
    Cache,
    /// Loaded from the record store on a miss.
    Loader,
}

/// A value returned by `CacheClient`, with how it was served.
///
/// Logical-expiry reads may hand back a stale payload while a refresh runs in
/// the background; `is_stale` tells callers when that happened.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead<T> {
    value: T,
    source: ReadSource,
    /// Logical expiry of the envelope the value came from.
    expires_at: Option<Timestamp>,
    stale: bool,
}

impl<T> CacheRead<T> {
    pub fn from_cache(value: T, expires_at: Option<Timestamp>) -> Self {
        Self {
            value,
            source: ReadSource::Cache,
            expires_at,
            stale: false,
        }
    }

    pub fn from_loader(value: T) -> Self {
        Self {
            value,
            source: ReadSource::Loader,
            expires_at: None,
            stale: false,
        }
    }

    /// Logically expired payload served while a refresh is pending.
    pub fn stale(value: T, expires_at: Timestamp) -> Self {
        Self {
            value,
            source: ReadSource::Cache,
            expires_at: Some(expires_at),
            stale: true,
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn source(&self) -> ReadSource {
        self.source
    }

    pub fn expires_at(&self) -> Option<Timestamp> {
        self.expires_at
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn was_cache_hit(&self) -> bool {
        self.source == ReadSource::Cache
    }

    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            source: self.source,
            expires_at: self.expires_at,
            stale: self.stale,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}
