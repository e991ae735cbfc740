//! Dianping Storage
//!
//! Contracts for the two external stores (coordination and records), their
//! in-process implementations, and the primitives built on the coordination
//! store: leased locks, id generation and cache-aside reads.

pub mod cache;
pub mod coordination;
pub mod id_worker;
pub mod lock;
pub mod memory;
pub mod records;

pub use cache::{
    cache_key, CacheClient, CacheRead, FnLoader, Loader, PoolSnapshot, ReadSource, RebuildPool,
    SubmitError, EMPTY_SENTINEL,
};
pub use coordination::{
    AdmissionArgs, CoordinationStore, GroupCursor, ReadFrom, Script, StreamEntry, StreamFields,
    StreamId,
};
pub use id_worker::{IdGenerator, ID_EPOCH_SECS};
pub use lock::{release_lease, try_lease, DistributedLock, LocalLock, StoreLock};
pub use memory::{
    InMemoryCoordinationStore, ADMISSION_DUPLICATE, ADMISSION_ENDED, ADMISSION_GRANTED,
    ADMISSION_NOT_STARTED, ADMISSION_OUT_OF_STOCK,
};
pub use records::{InMemoryRecordStore, RecordStore, RecordTx};
