//! Read-through cache service.
//!
//! [`CacheService`] routes every read through the same decision:
//!
//! 1. A slot kept current by an open realtime listener is served as is.
//! 2. A slot younger than `max_age` is reused, after a staleness probe when
//!    `check_updated` is set and the slot has a watermark.
//! 3. Anything else is a full fetch, shared by every concurrent caller for
//!    the same key, which restocks the slot.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use fieldsync_core::{
    elapsed_since, validate_collection, CacheConfig, CachedRecord, Clock, DocumentStore,
    FieldsyncError, FieldsyncResult, QueryError, QuerySpec, ReadOptions, RecordError, SystemClock,
    Timestamp,
};
use futures_util::future::{BoxFuture, FutureExt};
use tracing::{debug, warn};

use super::flight::FlightTable;
use super::freshness::{CacheRead, ReadSource};
use super::key::QueryKey;
use super::probe::{ProbeOutcome, StalenessProber};
use super::realtime::{
    error_forwarder, map_snapshot, snapshot_writer, ListenerErrorCallback, ListenerHandle,
    ListenerRegistry, PushContext,
};
use super::stats::{CacheStats, StatsRecorder};
use super::store::{CacheData, CacheEntry, CacheStore, EntryOrigin, PullWrite};
use super::watermark::Watermark;

/// Result of a full fetch, shared between every caller that joined it.
#[derive(Clone)]
struct Fetched {
    /// `None` for a document that does not exist.
    data: Option<CacheData>,
    cached_at: Timestamp,
    watermark: Option<Watermark>,
}

/// What the slot lookup decided before any full fetch.
enum Lookup<V> {
    Hit(CacheRead<V>),
    Miss,
    Stale,
}

/// Read-through cache over a [`DocumentStore`].
///
/// Construct once and share by handle; clones share the same slots,
/// in-flight table, listeners and statistics.
///
/// # Example
///
/// ```ignore
/// let cache = CacheService::with_defaults(Arc::new(store));
///
/// let open = QuerySpec::new().filter(Filter::eq("status", "open"));
/// let tasks: Arc<Vec<Task>> = cache
///     .get_cached_collection("tasks", Some(&open), None)
///     .await?;
///
/// let _listener = cache.setup_realtime_listener("tasks", |tasks: Arc<Vec<Task>>| {
///     render(&tasks);
/// }, Some(&open))?;
/// ```
pub struct CacheService<S: DocumentStore> {
    store: Arc<S>,
    cache: Arc<CacheStore>,
    prober: StalenessProber<S>,
    flights: FlightTable<Fetched>,
    listeners: Arc<ListenerRegistry>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    stats: Arc<StatsRecorder>,
}

impl<S: DocumentStore> CacheService<S> {
    /// Create a cache service on the system clock.
    pub fn new(store: Arc<S>, config: CacheConfig) -> FieldsyncResult<Self> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Create a cache service with default configuration.
    pub fn with_defaults(store: Arc<S>) -> Self {
        Self::build(store, CacheConfig::default(), Arc::new(SystemClock))
    }

    /// Create a cache service on an explicit clock.
    pub fn with_clock(
        store: Arc<S>,
        config: CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> FieldsyncResult<Self> {
        config.validate()?;
        Ok(Self::build(store, config, clock))
    }

    fn build(store: Arc<S>, config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            prober: StalenessProber::new(Arc::clone(&store)),
            cache: Arc::new(CacheStore::new(Arc::clone(&clock))),
            store,
            flights: FlightTable::new(),
            listeners: Arc::new(ListenerRegistry::new()),
            clock,
            config,
            stats: Arc::new(StatsRecorder::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // ========================================================================
    // COLLECTION READS
    // ========================================================================

    /// Read a collection query through the cache.
    pub async fn get_cached_collection<T: CachedRecord>(
        &self,
        collection: &str,
        query: Option<&QuerySpec>,
        options: Option<ReadOptions>,
    ) -> FieldsyncResult<Arc<Vec<T>>> {
        Ok(self
            .read_collection::<T>(collection, query, options)
            .await?
            .into_value())
    }

    /// Read a collection query through the cache, with freshness metadata.
    pub async fn read_collection<T: CachedRecord>(
        &self,
        collection: &str,
        query: Option<&QuerySpec>,
        options: Option<ReadOptions>,
    ) -> FieldsyncResult<CacheRead<Vec<T>>> {
        validate_collection(collection)?;
        if let Some(query) = query {
            query.validate()?;
        }
        let options = options.unwrap_or_else(|| self.config.read_options());
        let key = QueryKey::collection(collection, query);

        let lookup = match self.cache.get(&key)? {
            Some(entry) => {
                self.check_entry::<Vec<T>, T, _>(&key, &entry, options, |prober, fields, mark| {
                    let collection = collection.to_string();
                    async move { prober.probe_collection(&collection, fields, mark).await }.boxed()
                })
                .await
            }
            None => Lookup::Miss,
        };
        match lookup {
            Lookup::Hit(read) => return Ok(read),
            Lookup::Miss => StatsRecorder::bump(&self.stats.misses),
            Lookup::Stale => StatsRecorder::bump(&self.stats.stale_refetches),
        }

        debug!(collection, key = %key, "full fetch");
        let start = {
            let store = Arc::clone(&self.store);
            let cache = Arc::clone(&self.cache);
            let clock = Arc::clone(&self.clock);
            let key = key.clone();
            let collection = collection.to_string();
            let query = query.cloned().unwrap_or_default();
            move || restock_collection::<S, T>(store, cache, clock, key, collection, query).boxed()
        };
        let (fetched, source) = self.run_flight(&key, start).await?;

        match fetched.data.and_then(|data| data.downcast::<Vec<T>>().ok()) {
            Some(items) => Ok(CacheRead::new(
                items,
                fetched.cached_at,
                fetched.watermark,
                source,
            )),
            None => Err(type_mismatch(&key)),
        }
    }

    // ========================================================================
    // DOCUMENT READS
    // ========================================================================

    /// Read a single document through the cache. `Ok(None)` when it does not
    /// exist remotely.
    pub async fn get_cached_document<T: CachedRecord>(
        &self,
        collection: &str,
        id: &str,
        options: Option<ReadOptions>,
    ) -> FieldsyncResult<Option<Arc<T>>> {
        Ok(self
            .read_document::<T>(collection, id, options)
            .await?
            .map(CacheRead::into_value))
    }

    /// Read a single document through the cache, with freshness metadata.
    pub async fn read_document<T: CachedRecord>(
        &self,
        collection: &str,
        id: &str,
        options: Option<ReadOptions>,
    ) -> FieldsyncResult<Option<CacheRead<T>>> {
        validate_collection(collection)?;
        if id.trim().is_empty() {
            return Err(QueryError::EmptyDocumentId.into());
        }
        let options = options.unwrap_or_else(|| self.config.read_options());
        let key = QueryKey::document(collection, id);

        let lookup = match self.cache.get(&key)? {
            Some(entry) => {
                self.check_entry::<T, T, _>(&key, &entry, options, |prober, fields, mark| {
                    let collection = collection.to_string();
                    let id = id.to_string();
                    async move { prober.probe_document(&collection, &id, fields, mark).await }
                        .boxed()
                })
                .await
            }
            None => Lookup::Miss,
        };
        match lookup {
            Lookup::Hit(read) => return Ok(Some(read)),
            Lookup::Miss => StatsRecorder::bump(&self.stats.misses),
            Lookup::Stale => StatsRecorder::bump(&self.stats.stale_refetches),
        }

        debug!(collection, key = %key, "document fetch");
        let start = {
            let store = Arc::clone(&self.store);
            let cache = Arc::clone(&self.cache);
            let clock = Arc::clone(&self.clock);
            let key = key.clone();
            let collection = collection.to_string();
            let id = id.to_string();
            move || restock_document::<S, T>(store, cache, clock, key, collection, id).boxed()
        };
        let (fetched, source) = self.run_flight(&key, start).await?;

        let Some(data) = fetched.data else {
            return Ok(None);
        };
        match data.downcast::<T>() {
            Ok(record) => Ok(Some(CacheRead::new(
                record,
                fetched.cached_at,
                fetched.watermark,
                source,
            ))),
            Err(_) => Err(type_mismatch(&key)),
        }
    }

    // ========================================================================
    // REALTIME
    // ========================================================================

    /// Keep the cache slot for `(collection, query)` warm from a standing
    /// subscription. `on_change` receives the full current result set on the
    /// initial snapshot and on every change.
    pub fn setup_realtime_listener<T, F>(
        &self,
        collection: &str,
        on_change: F,
        query: Option<&QuerySpec>,
    ) -> FieldsyncResult<ListenerHandle>
    where
        T: CachedRecord,
        F: Fn(Arc<Vec<T>>) + Send + Sync + 'static,
    {
        self.open_listener(collection, query, on_change, None)
    }

    /// As [`setup_realtime_listener`](Self::setup_realtime_listener), with a
    /// callback for subscription and mapping errors.
    pub fn setup_realtime_listener_with_errors<T, F, E>(
        &self,
        collection: &str,
        on_change: F,
        on_error: E,
        query: Option<&QuerySpec>,
    ) -> FieldsyncResult<ListenerHandle>
    where
        T: CachedRecord,
        F: Fn(Arc<Vec<T>>) + Send + Sync + 'static,
        E: Fn(FieldsyncError) + Send + Sync + 'static,
    {
        self.open_listener(collection, query, on_change, Some(Arc::new(on_error)))
    }

    fn open_listener<T, F>(
        &self,
        collection: &str,
        query: Option<&QuerySpec>,
        on_change: F,
        on_error: Option<ListenerErrorCallback>,
    ) -> FieldsyncResult<ListenerHandle>
    where
        T: CachedRecord,
        F: Fn(Arc<Vec<T>>) + Send + Sync + 'static,
    {
        validate_collection(collection)?;
        if let Some(query) = query {
            query.validate()?;
        }
        let key = QueryKey::collection(collection, query);
        let gate = Arc::new(RwLock::new(true));
        let ctx = Arc::new(PushContext {
            key: key.clone(),
            gate: Arc::clone(&gate),
            cache: Arc::clone(&self.cache),
            clock: Arc::clone(&self.clock),
            stats: Arc::clone(&self.stats),
            on_error,
        });

        // Registered first so the initial snapshot already counts as live.
        self.listeners.register(&key);
        let spec = query.cloned().unwrap_or_default();
        let subscribed = self.store.subscribe(
            collection,
            &spec,
            snapshot_writer::<T, F>(Arc::clone(&ctx), on_change),
            error_forwarder(ctx),
        );

        match subscribed {
            Ok(subscription) => {
                debug!(collection, key = %key, "realtime listener opened");
                Ok(ListenerHandle::new(
                    key,
                    gate,
                    subscription,
                    Arc::clone(&self.listeners),
                ))
            }
            Err(e) => {
                *gate.write().unwrap_or_else(PoisonError::into_inner) = false;
                self.listeners.release(&key);
                warn!(collection, key = %key, error = %e, "realtime subscribe failed");
                Err(e.into())
            }
        }
    }

    // ========================================================================
    // INVALIDATION & STATS
    // ========================================================================

    /// Remove every cached slot of `collection`. Returns the number removed.
    pub fn clear_collection_cache(&self, collection: &str) -> FieldsyncResult<usize> {
        let removed = self.cache.invalidate_collection(collection)?;
        debug!(collection, removed, "collection cache cleared");
        Ok(removed)
    }

    /// Empty the cache. Returns the number of slots removed.
    pub fn clear_all_cache(&self) -> FieldsyncResult<usize> {
        let removed = self.cache.invalidate_all()?;
        debug!(removed, "cache cleared");
        Ok(removed)
    }

    /// Snapshot of usage counters.
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot(
            self.cache.len().unwrap_or(0) as u64,
            self.listeners.active_count() as u64,
        )
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    /// Decide whether `entry` can be served.
    async fn check_entry<V, T, P>(
        &self,
        key: &QueryKey,
        entry: &CacheEntry,
        options: ReadOptions,
        probe: P,
    ) -> Lookup<V>
    where
        V: Any + Send + Sync,
        T: CachedRecord,
        P: FnOnce(StalenessProber<S>, &'static [&'static str], Watermark) -> BoxFuture<'static, ProbeOutcome>,
    {
        let Some(data) = entry.downcast::<V>() else {
            debug!(key = %key, "cached slot holds another type, treating as miss");
            return Lookup::Miss;
        };
        let read = |source| CacheRead::new(Arc::clone(&data), entry.write_time(), entry.watermark(), source);

        if entry.origin() == EntryOrigin::Push && self.listeners.is_listening(key) {
            StatsRecorder::bump(&self.stats.live_hits);
            debug!(key = %key, "live hit");
            return Lookup::Hit(read(ReadSource::Live));
        }

        let age = elapsed_since(entry.write_time(), self.clock.now());
        if age >= options.max_age {
            debug!(key = %key, age_ms = age.as_millis() as u64, "cached slot expired");
            return Lookup::Miss;
        }

        let fields = T::last_modified_fields();
        let (Some(watermark), false, true) =
            (entry.watermark(), fields.is_empty(), options.check_updated)
        else {
            StatsRecorder::bump(&self.stats.hits);
            debug!(key = %key, age_ms = age.as_millis() as u64, "hit");
            return Lookup::Hit(read(ReadSource::Cache));
        };

        StatsRecorder::bump(&self.stats.probes);
        match probe(self.prober.clone(), fields, watermark).await {
            ProbeOutcome::Unchanged => {
                StatsRecorder::bump(&self.stats.verified_hits);
                debug!(key = %key, %watermark, "verified hit");
                Lookup::Hit(read(ReadSource::Verified))
            }
            ProbeOutcome::Changed => Lookup::Stale,
            ProbeOutcome::Failed(_) => {
                StatsRecorder::bump(&self.stats.probe_failures);
                Lookup::Stale
            }
        }
    }

    /// Join or start the full fetch for `key`.
    async fn run_flight<F>(&self, key: &QueryKey, start: F) -> FieldsyncResult<(Fetched, ReadSource)>
    where
        F: FnOnce() -> BoxFuture<'static, FieldsyncResult<Fetched>>,
    {
        let flight = self.flights.join_or_start(key, start)?;
        let joined = flight.joined();
        if joined {
            StatsRecorder::bump(&self.stats.coalesced);
        }

        match flight.wait().await {
            Ok(fetched) => {
                let source = if joined {
                    ReadSource::Joined
                } else {
                    ReadSource::Remote
                };
                Ok((fetched, source))
            }
            Err(e) => {
                if !joined {
                    StatsRecorder::bump(&self.stats.fetch_failures);
                    warn!(key = %key, error = %e, "full fetch failed");
                }
                Err(e)
            }
        }
    }
}

impl<S: DocumentStore> Clone for CacheService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            prober: self.prober.clone(),
            flights: self.flights.clone(),
            listeners: Arc::clone(&self.listeners),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<S: DocumentStore> fmt::Debug for CacheService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheService")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Two record types read through the same key.
fn type_mismatch(key: &QueryKey) -> FieldsyncError {
    FieldsyncError::Record(RecordError::Decode {
        id: key.to_string(),
        reason: "shared fetch produced a different record type".to_string(),
    })
}

/// Full collection fetch and restock.
async fn restock_collection<S, T>(
    store: Arc<S>,
    cache: Arc<CacheStore>,
    clock: Arc<dyn Clock>,
    key: QueryKey,
    collection: String,
    query: QuerySpec,
) -> FieldsyncResult<Fetched>
where
    S: DocumentStore,
    T: CachedRecord,
{
    let started_at = cache.current_sequence()?;
    let records = store.query(&collection, &query).await?;
    let items = map_snapshot::<T>(records)?;

    let cached_at = clock.now();
    let watermark = Watermark::from_records(&items, cached_at);
    let count = items.len();
    let data: CacheData = Arc::new(items);
    let written = cache.put_pulled(key.clone(), Arc::clone(&data), watermark, started_at)?;
    debug!(collection = %collection, key = %key, records = count, ?written, "collection restocked");

    Ok(Fetched {
        data: Some(data),
        cached_at,
        watermark,
    })
}

/// Full document fetch and restock. A missing document drops its slot.
async fn restock_document<S, T>(
    store: Arc<S>,
    cache: Arc<CacheStore>,
    clock: Arc<dyn Clock>,
    key: QueryKey,
    collection: String,
    id: String,
) -> FieldsyncResult<Fetched>
where
    S: DocumentStore,
    T: CachedRecord,
{
    let started_at = cache.current_sequence()?;
    let fetched = store.get_one(&collection, &id).await?;
    let cached_at = clock.now();

    let Some(mut raw) = fetched else {
        if cache.remove(&key)? {
            debug!(collection = %collection, key = %key, "document gone, slot dropped");
        }
        return Ok(Fetched {
            data: None,
            cached_at,
            watermark: None,
        });
    };

    raw.normalize_timestamps();
    let record = T::from_raw(raw)?;
    let watermark = Watermark::from_record(&record, cached_at);
    let data: CacheData = Arc::new(record);
    let written: PullWrite =
        cache.put_pulled(key.clone(), Arc::clone(&data), watermark, started_at)?;
    debug!(collection = %collection, key = %key, ?written, "document restocked");

    Ok(Fetched {
        data: Some(data),
        cached_at,
        watermark,
    })
}
