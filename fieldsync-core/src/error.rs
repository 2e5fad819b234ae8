//! Error types for Fieldsync operations

use thiserror::Error;

/// Errors reported by the remote document store client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Document store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Query against {collection} failed: {reason}")]
    QueryFailed { collection: String, reason: String },

    #[error("Fetch of {collection}/{id} failed: {reason}")]
    FetchFailed {
        collection: String,
        id: String,
        reason: String,
    },

    #[error("Subscription to {collection} failed: {reason}")]
    SubscriptionFailed { collection: String, reason: String },

    #[error("Permission denied on {collection}")]
    PermissionDenied { collection: String },
}

/// Malformed query specifications, rejected before any network call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("Collection name must not be empty")]
    EmptyCollection,

    #[error("Unknown filter operator: {operator}")]
    UnknownOperator { operator: String },

    #[error("Filter field name must not be empty")]
    EmptyField,

    #[error("Invalid operand for {field} {operator}: {reason}")]
    InvalidOperand {
        field: String,
        operator: String,
        reason: String,
    },

    #[error("Unknown sort direction: {direction}")]
    UnknownDirection { direction: String },

    #[error("Limit must be greater than 0")]
    ZeroLimit,

    #[error("Document id must not be empty")]
    EmptyDocumentId,
}

/// Errors raised while mapping raw records into caller types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("Record {id} is missing required field {field}")]
    MissingField { id: String, field: String },

    #[error("Record {id} has an invalid timestamp in {field}: {value}")]
    InvalidTimestamp {
        id: String,
        field: String,
        value: String,
    },

    #[error("Record {id} could not be decoded: {reason}")]
    Decode { id: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Fieldsync errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FieldsyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cache lock poisoned")]
    LockPoisoned,
}

impl FieldsyncError {
    /// True for errors produced by the remote store rather than by the caller.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

/// Result type alias for Fieldsync operations.
pub type FieldsyncResult<T> = Result<T, FieldsyncError>;

// =============================================================================
// TESTS
// =============================================================================
