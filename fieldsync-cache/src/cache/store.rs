//! In-memory slot map behind the cache service.
//!
//! Each slot holds type-erased data, the wall-clock write time, the
//! watermark and a store-wide write sequence. Writes and lookups are atomic
//! per slot: a reader sees either the previous entry or the new one.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use fieldsync_core::{Clock, FieldsyncError, FieldsyncResult, Timestamp};
use tracing::trace;

use super::key::QueryKey;
use super::watermark::Watermark;

/// Type-erased slot payload: `Vec<T>` for collection reads, `T` for documents.
pub type CacheData = Arc<dyn Any + Send + Sync>;

/// Which path wrote an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryOrigin {
    /// Full fetch on the pull path.
    Pull,
    /// Snapshot delivered by a realtime listener.
    Push,
}

/// A single cache slot.
#[derive(Clone)]
pub struct CacheEntry {
    data: CacheData,
    write_time: Timestamp,
    watermark: Option<Watermark>,
    origin: EntryOrigin,
    sequence: u64,
}

impl CacheEntry {
    /// Downcast the payload. `None` when the slot holds a different type.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.data).downcast::<T>().ok()
    }

    pub fn write_time(&self) -> Timestamp {
        self.write_time
    }

    pub fn watermark(&self) -> Option<Watermark> {
        self.watermark
    }

    pub fn origin(&self) -> EntryOrigin {
        self.origin
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("write_time", &self.write_time)
            .field("watermark", &self.watermark)
            .field("origin", &self.origin)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Outcome of a conditional pull-path write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullWrite {
    /// Stored under the given sequence.
    Stored(u64),
    /// A realtime snapshot landed on the slot after the fetch started.
    SupersededByPush,
    /// The collection was cleared after the fetch started.
    Invalidated,
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<QueryKey, CacheEntry>,
    /// Sequence at which each collection was last cleared.
    cleared: HashMap<String, u64>,
    /// Sequence at which the whole store was last cleared.
    cleared_all: u64,
    sequence: u64,
}

impl StoreInner {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn cleared_since(&self, collection: &str, started_at: u64) -> bool {
        let collection_clear = self.cleared.get(collection).copied().unwrap_or(0);
        self.cleared_all.max(collection_clear) > started_at
    }
}

/// Concurrent map from [`QueryKey`] to [`CacheEntry`].
pub struct CacheStore {
    inner: RwLock<StoreInner>,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            clock,
        }
    }

    /// Pure lookup.
    pub fn get(&self, key: &QueryKey) -> FieldsyncResult<Option<CacheEntry>> {
        let inner = self.inner.read().map_err(|_| FieldsyncError::LockPoisoned)?;
        Ok(inner.entries.get(key).cloned())
    }

    /// Overwrite the slot with `write_time = now`. The slot's watermark never
    /// moves backwards. Returns the write sequence.
    pub fn put(
        &self,
        key: QueryKey,
        data: CacheData,
        watermark: Option<Watermark>,
        origin: EntryOrigin,
    ) -> FieldsyncResult<u64> {
        let mut inner = self.inner.write().map_err(|_| FieldsyncError::LockPoisoned)?;
        let sequence = inner.next_sequence();
        let watermark = Watermark::advance(
            inner.entries.get(&key).and_then(CacheEntry::watermark),
            watermark,
        );
        trace!(key = %key, sequence, ?origin, "cache slot written");
        inner.entries.insert(
            key,
            CacheEntry {
                data,
                write_time: self.clock.now(),
                watermark,
                origin,
                sequence,
            },
        );
        Ok(sequence)
    }

    /// Pull-path write for a fetch that started at sequence `started_at`.
    ///
    /// Skipped when a push-origin write or an invalidation touched the slot
    /// after the fetch started.
    pub fn put_pulled(
        &self,
        key: QueryKey,
        data: CacheData,
        watermark: Option<Watermark>,
        started_at: u64,
    ) -> FieldsyncResult<PullWrite> {
        let mut inner = self.inner.write().map_err(|_| FieldsyncError::LockPoisoned)?;

        if inner.cleared_since(key.collection_name(), started_at) {
            trace!(key = %key, started_at, "pull write dropped after invalidation");
            return Ok(PullWrite::Invalidated);
        }
        if let Some(existing) = inner.entries.get(&key) {
            if existing.origin == EntryOrigin::Push && existing.sequence > started_at {
                trace!(key = %key, started_at, "pull write superseded by push");
                return Ok(PullWrite::SupersededByPush);
            }
        }

        let sequence = inner.next_sequence();
        let watermark = Watermark::advance(
            inner.entries.get(&key).and_then(CacheEntry::watermark),
            watermark,
        );
        inner.entries.insert(
            key,
            CacheEntry {
                data,
                write_time: self.clock.now(),
                watermark,
                origin: EntryOrigin::Pull,
                sequence,
            },
        );
        Ok(PullWrite::Stored(sequence))
    }

    /// Remove a single slot. Returns whether it existed.
    pub fn remove(&self, key: &QueryKey) -> FieldsyncResult<bool> {
        let mut inner = self.inner.write().map_err(|_| FieldsyncError::LockPoisoned)?;
        Ok(inner.entries.remove(key).is_some())
    }

    /// Remove every slot of `collection`. Returns the number removed.
    pub fn invalidate_collection(&self, collection: &str) -> FieldsyncResult<usize> {
        let mut inner = self.inner.write().map_err(|_| FieldsyncError::LockPoisoned)?;
        let sequence = inner.next_sequence();
        inner.cleared.insert(collection.to_string(), sequence);

        let before = inner.entries.len();
        inner.entries.retain(|key, _| !key.belongs_to(collection));
        Ok(before - inner.entries.len())
    }

    /// Empty the store. Returns the number of slots removed.
    pub fn invalidate_all(&self) -> FieldsyncResult<usize> {
        let mut inner = self.inner.write().map_err(|_| FieldsyncError::LockPoisoned)?;
        let sequence = inner.next_sequence();
        inner.cleared_all = sequence;
        inner.cleared.clear();

        let removed = inner.entries.len();
        inner.entries.clear();
        Ok(removed)
    }

    /// Latest sequence handed out. A fetch records this when it starts.
    pub fn current_sequence(&self) -> FieldsyncResult<u64> {
        let inner = self.inner.read().map_err(|_| FieldsyncError::LockPoisoned)?;
        Ok(inner.sequence)
    }

    pub fn len(&self) -> FieldsyncResult<usize> {
        let inner = self.inner.read().map_err(|_| FieldsyncError::LockPoisoned)?;
        Ok(inner.entries.len())
    }

    pub fn is_empty(&self) -> FieldsyncResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
