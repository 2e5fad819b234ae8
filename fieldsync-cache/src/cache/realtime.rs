//! Realtime sync path.
//!
//! A listener wraps a standing store subscription. Every snapshot it delivers
//! is mapped, written into the same slot a pull read of that query would use,
//! and then forwarded to the caller. While at least one listener is open on a
//! key and the slot was last written by a push, pull reads serve it without
//! probing.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use fieldsync_core::{
    CachedRecord, Clock, ErrorCallback, FieldsyncError, RawRecord, SnapshotCallback, StoreError,
    Subscription,
};
use tracing::{debug, warn};

use super::key::QueryKey;
use super::stats::StatsRecorder;
use super::store::{CacheData, CacheStore, EntryOrigin};
use super::watermark::Watermark;

/// Caller callback for listener failures.
pub type ListenerErrorCallback = Arc<dyn Fn(FieldsyncError) + Send + Sync>;

// ============================================================================
// REGISTRY
// ============================================================================

/// Open-listener counts per cache key.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    open: Mutex<HashMap<QueryKey, usize>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: &QueryKey) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        *open.entry(key.clone()).or_insert(0) += 1;
    }

    pub fn release(&self, key: &QueryKey) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = open.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                open.remove(key);
            }
        }
    }

    /// Whether any listener is open on `key`.
    pub fn is_listening(&self, key: &QueryKey) -> bool {
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        open.contains_key(key)
    }

    /// Total open listeners across all keys.
    pub fn active_count(&self) -> usize {
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        open.values().sum()
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// Disposer for a realtime listener.
///
/// Disposing, explicitly or by drop, unsubscribes from the store. Once
/// [`dispose`](Self::dispose) returns no further cache writes happen for
/// this listener.
#[must_use = "dropping a ListenerHandle disposes the listener"]
pub struct ListenerHandle {
    key: QueryKey,
    gate: Arc<RwLock<bool>>,
    subscription: Option<Box<dyn Subscription>>,
    registry: Arc<ListenerRegistry>,
}

impl ListenerHandle {
    pub(crate) fn new(
        key: QueryKey,
        gate: Arc<RwLock<bool>>,
        subscription: Box<dyn Subscription>,
        registry: Arc<ListenerRegistry>,
    ) -> Self {
        Self {
            key,
            gate,
            subscription: Some(subscription),
            registry,
        }
    }

    /// Cache key this listener keeps warm.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        *self.gate.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tear the listener down.
    pub fn dispose(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        {
            // Waits for any snapshot write already in progress.
            let mut open = self.gate.write().unwrap_or_else(PoisonError::into_inner);
            if !*open {
                return;
            }
            *open = false;
        }
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.registry.release(&self.key);
        debug!(key = %self.key, "realtime listener disposed");
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("key", &self.key)
            .field("active", &self.is_active())
            .finish()
    }
}

// ============================================================================
// PUSH WRITER
// ============================================================================

/// Everything a snapshot callback needs to restock the cache.
pub(crate) struct PushContext {
    pub key: QueryKey,
    pub gate: Arc<RwLock<bool>>,
    pub cache: Arc<CacheStore>,
    pub clock: Arc<dyn Clock>,
    pub stats: Arc<StatsRecorder>,
    pub on_error: Option<ListenerErrorCallback>,
}

/// Map a pushed snapshot into the caller's record type.
pub(crate) fn map_snapshot<T: CachedRecord>(
    records: Vec<RawRecord>,
) -> Result<Vec<T>, FieldsyncError> {
    records
        .into_iter()
        .map(|mut raw| {
            raw.normalize_timestamps();
            T::from_raw(raw)
        })
        .collect::<Result<Vec<T>, _>>()
        .map_err(FieldsyncError::from)
}

/// Build the store-facing snapshot callback for a listener.
pub(crate) fn snapshot_writer<T, F>(ctx: Arc<PushContext>, on_change: F) -> SnapshotCallback
where
    T: CachedRecord,
    F: Fn(Arc<Vec<T>>) + Send + Sync + 'static,
{
    Arc::new(move |records: Vec<RawRecord>| {
        let items = match map_snapshot::<T>(records) {
            Ok(items) => items,
            Err(e) => {
                warn!(key = %ctx.key, error = %e, "pushed snapshot could not be mapped");
                if let Some(on_error) = &ctx.on_error {
                    on_error(e);
                }
                return;
            }
        };

        let data = Arc::new(items);
        {
            let open = ctx.gate.read().unwrap_or_else(PoisonError::into_inner);
            if !*open {
                return;
            }
            let watermark = Watermark::from_records(data.as_slice(), ctx.clock.now());
            let payload: CacheData = data.clone();
            if let Err(e) = ctx.cache.put(ctx.key.clone(), payload, watermark, EntryOrigin::Push) {
                warn!(key = %ctx.key, error = %e, "push write failed");
                drop(open);
                if let Some(on_error) = &ctx.on_error {
                    on_error(e);
                }
                return;
            }
            StatsRecorder::bump(&ctx.stats.push_updates);
            debug!(key = %ctx.key, records = data.len(), "push snapshot cached");
        }

        on_change(data);
    })
}

/// Build the store-facing error callback for a listener.
///
/// The last snapshot stays in place; no retry is attempted.
pub(crate) fn error_forwarder(ctx: Arc<PushContext>) -> ErrorCallback {
    Arc::new(move |error: StoreError| {
        warn!(key = %ctx.key, error = %error, "realtime subscription error");
        if let Some(on_error) = &ctx.on_error {
            on_error(FieldsyncError::Store(error));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_core::{RecordError, UPDATED_AT};

    #[test]
    fn test_registry_counts_per_key() {
        let registry = ListenerRegistry::new();
        let tasks = QueryKey::collection("tasks", None);
        let payments = QueryKey::collection("payments", None);

        registry.register(&tasks);
        registry.register(&tasks);
        registry.register(&payments);
        assert_eq!(registry.active_count(), 3);

        registry.release(&tasks);
        assert!(registry.is_listening(&tasks));
        registry.release(&tasks);
        assert!(!registry.is_listening(&tasks));
        // Releasing an unknown key is a no-op.
        registry.release(&tasks);
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_map_snapshot_normalizes_and_maps() {
        let raw = vec![RawRecord::new("t-1")
            .with_field(UPDATED_AT, serde_json::json!({"seconds": 100, "nanoseconds": 0}))];
        let mapped = map_snapshot::<RawRecord>(raw).unwrap();
        assert!(mapped[0].get(UPDATED_AT).and_then(|v| v.as_str()).is_some());
    }

    #[test]
    fn test_map_snapshot_surfaces_record_errors() {
        #[derive(Clone, Debug)]
        struct Picky;

        impl CachedRecord for Picky {
            fn from_raw(raw: RawRecord) -> Result<Self, RecordError> {
                Err(RecordError::MissingField {
                    id: raw.id,
                    field: "title".to_string(),
                })
            }

            fn last_modified(&self) -> Option<fieldsync_core::Timestamp> {
                None
            }
        }

        let err = map_snapshot::<Picky>(vec![RawRecord::new("t-1")]).unwrap_err();
        assert!(matches!(err, FieldsyncError::Record(RecordError::MissingField { .. })));
    }
}
