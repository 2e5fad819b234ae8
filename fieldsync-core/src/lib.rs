//! Fieldsync Core - Shared Types
//!
//! Pure data structures shared by the cache and its collaborators: raw
//! records, query specifications, errors, configuration, the clock, and the
//! remote document store contract.

use chrono::{DateTime, Utc};

pub mod clock;
pub mod config;
pub mod error;
pub mod query;
pub mod record;
pub mod store;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

pub use clock::{elapsed_since, Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, ReadOptions, DEFAULT_MAX_AGE};
pub use error::{
    ConfigError, FieldsyncError, FieldsyncResult, QueryError, RecordError, StoreError,
};
pub use query::{Direction, Filter, FilterOperator, OrderBy, QuerySpec, DOCUMENT_ID_FIELD};
pub use record::{
    format_timestamp, normalize_json_timestamps, parse_timestamp, CachedRecord, RawRecord,
    CREATED_AT, UPDATED_AT,
};
pub use store::{
    DocumentStore, ErrorCallback, SnapshotCallback, StoreResult, Subscription,
};

/// Reject empty collection names before they reach the store.
pub fn validate_collection(collection: &str) -> Result<(), QueryError> {
    if collection.trim().is_empty() {
        Err(QueryError::EmptyCollection)
    } else {
        Ok(())
    }
}
