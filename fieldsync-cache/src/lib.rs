//! Fieldsync Cache - Read-Through Document Cache
//!
//! Sits between application code and a remote [`DocumentStore`] and answers
//! one question cheaply: is my cached view of this collection query still
//! correct? See [`cache`] for the read protocol.
//!
//! [`DocumentStore`]: fieldsync_core::DocumentStore

pub mod cache;

pub use cache::{
    canonical_signature, CacheData, CacheEntry, CacheRead, CacheService, CacheStats, CacheStore,
    EntryOrigin, ListenerErrorCallback, ListenerHandle, ListenerRegistry, ProbeOutcome, PullWrite,
    QueryKey, ReadSource, StalenessProber, Watermark,
};

// Callers usually need these alongside the service.
pub use fieldsync_core::{
    CacheConfig, CachedRecord, Clock, DocumentStore, FieldsyncError, FieldsyncResult, Filter,
    FilterOperator, ManualClock, QuerySpec, RawRecord, ReadOptions, SystemClock,
};
