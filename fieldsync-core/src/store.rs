//! Remote document store contract.
//!
//! The cache consumes the remote store only through [`DocumentStore`]. Wire
//! format, authentication and reconnect policy belong to the implementation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::query::QuerySpec;
use crate::record::RawRecord;

/// Result type for remote store calls.
pub type StoreResult<T> = Result<T, StoreError>;

/// Invoked with the full current result set of a subscribed query.
pub type SnapshotCallback = Arc<dyn Fn(Vec<RawRecord>) + Send + Sync>;

/// Invoked when a standing subscription reports an error.
pub type ErrorCallback = Arc<dyn Fn(StoreError) + Send + Sync>;

/// A standing subscription. Unsubscribing stops further callbacks.
pub trait Subscription: Send {
    fn unsubscribe(self: Box<Self>);
}

/// Remote, queryable document collection API.
///
/// Implementations must be safe to call from many tasks at once.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// One-shot query: apply filters, sort and limit.
    async fn query(&self, collection: &str, query: &QuerySpec) -> StoreResult<Vec<RawRecord>>;

    /// Fetch a single document by id.
    async fn get_one(&self, collection: &str, id: &str) -> StoreResult<Option<RawRecord>>;

    /// Open a standing subscription. `on_change` receives the initial snapshot
    /// and every subsequent change; `on_error` receives subscription failures.
    fn subscribe(
        &self,
        collection: &str,
        query: &QuerySpec,
        on_change: SnapshotCallback,
        on_error: ErrorCallback,
    ) -> StoreResult<Box<dyn Subscription>>;
}
