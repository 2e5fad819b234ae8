//! In-memory [`DocumentStore`] with call accounting, fault injection and
//! push notifications.
//!
//! Queries are evaluated against the stored records the way a remote
//! document store would: filters, then sort, then limit. Every call is
//! counted so tests can assert exactly how many network round trips a cache
//! operation cost.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fieldsync_core::{
    parse_timestamp, Direction, DocumentStore, ErrorCallback, Filter, FilterOperator, QuerySpec,
    RawRecord, SnapshotCallback, StoreError, StoreResult, Subscription, DOCUMENT_ID_FIELD,
};
use serde_json::Value;

/// Call counters, reset with [`InMemoryDocumentStore::reset_counters`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// Full queries (anything that is not a staleness probe).
    pub queries: usize,
    /// Staleness probes: limit 1 with a `>` filter on a timestamp.
    pub probes: usize,
    pub get_one: usize,
    pub subscribes: usize,
}

impl CallCounts {
    /// Every remote round trip, probes included.
    pub fn total(&self) -> usize {
        self.queries + self.probes + self.get_one + self.subscribes
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    queries: bool,
    probes: bool,
    get_one: bool,
    subscribe: bool,
}

struct Subscriber {
    collection: String,
    query: QuerySpec,
    on_change: SnapshotCallback,
    on_error: ErrorCallback,
}

#[derive(Default)]
struct StoreState {
    collections: HashMap<String, BTreeMap<String, RawRecord>>,
    subscribers: BTreeMap<u64, Subscriber>,
    next_subscriber: u64,
    counts: CallCounts,
    query_log: Vec<(String, QuerySpec)>,
    faults: Faults,
    latency: Option<Duration>,
    paused: bool,
}

/// In-memory document store for tests.
#[derive(Clone, Default)]
pub struct InMemoryDocumentStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // DATA
    // ========================================================================

    /// Insert or replace a record and notify matching subscribers.
    pub fn insert(&self, collection: &str, record: RawRecord) {
        {
            let mut state = self.state();
            state
                .collections
                .entry(collection.to_string())
                .or_default()
                .insert(record.id.clone(), record);
        }
        self.notify(collection);
    }

    /// Insert many records with a single notification.
    pub fn insert_all(&self, collection: &str, records: impl IntoIterator<Item = RawRecord>) {
        {
            let mut state = self.state();
            let docs = state.collections.entry(collection.to_string()).or_default();
            for record in records {
                docs.insert(record.id.clone(), record);
            }
        }
        self.notify(collection);
    }

    /// Modify a stored record in place. Returns false when it does not exist.
    pub fn update<F>(&self, collection: &str, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut RawRecord),
    {
        let found = {
            let mut state = self.state();
            match state.collections.get_mut(collection).and_then(|c| c.get_mut(id)) {
                Some(record) => {
                    f(record);
                    true
                }
                None => false,
            }
        };
        if found {
            self.notify(collection);
        }
        found
    }

    /// Delete a record. Returns whether it existed.
    pub fn remove(&self, collection: &str, id: &str) -> bool {
        let removed = {
            let mut state = self.state();
            state
                .collections
                .get_mut(collection)
                .and_then(|c| c.remove(id))
                .is_some()
        };
        if removed {
            self.notify(collection);
        }
        removed
    }

    /// Number of records stored in `collection`.
    pub fn record_count(&self, collection: &str) -> usize {
        self.state().collections.get(collection).map_or(0, BTreeMap::len)
    }

    // ========================================================================
    // ACCOUNTING
    // ========================================================================

    pub fn counts(&self) -> CallCounts {
        self.state().counts.clone()
    }

    pub fn query_count(&self) -> usize {
        self.state().counts.queries
    }

    pub fn probe_count(&self) -> usize {
        self.state().counts.probes
    }

    pub fn get_one_count(&self) -> usize {
        self.state().counts.get_one
    }

    pub fn subscribe_count(&self) -> usize {
        self.state().counts.subscribes
    }

    /// Every query and probe received, in order.
    pub fn query_log(&self) -> Vec<(String, QuerySpec)> {
        self.state().query_log.clone()
    }

    pub fn reset_counters(&self) {
        let mut state = self.state();
        state.counts = CallCounts::default();
        state.query_log.clear();
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state().subscribers.len()
    }

    // ========================================================================
    // FAULTS & TIMING
    // ========================================================================

    /// Make full queries fail with [`StoreError::QueryFailed`].
    pub fn fail_queries(&self, enabled: bool) {
        self.state().faults.queries = enabled;
    }

    /// Make staleness probes fail with [`StoreError::QueryFailed`].
    pub fn fail_probes(&self, enabled: bool) {
        self.state().faults.probes = enabled;
    }

    pub fn fail_get_one(&self, enabled: bool) {
        self.state().faults.get_one = enabled;
    }

    pub fn fail_subscribe(&self, enabled: bool) {
        self.state().faults.subscribe = enabled;
    }

    /// Delay every async call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    /// While paused, mutations are stored but subscribers are not notified.
    pub fn pause_notifications(&self, paused: bool) {
        self.state().paused = paused;
    }

    /// Deliver `error` to every subscriber of `collection`.
    pub fn emit_error(&self, collection: &str, error: StoreError) {
        let callbacks: Vec<ErrorCallback> = self
            .state()
            .subscribers
            .values()
            .filter(|s| s.collection == collection)
            .map(|s| Arc::clone(&s.on_error))
            .collect();
        for on_error in callbacks {
            on_error(error.clone());
        }
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn notify(&self, collection: &str) {
        let deliveries: Vec<(SnapshotCallback, Vec<RawRecord>)> = {
            let state = self.state();
            if state.paused {
                return;
            }
            state
                .subscribers
                .values()
                .filter(|s| s.collection == collection)
                .map(|s| (Arc::clone(&s.on_change), state.evaluate(&s.collection, &s.query)))
                .collect()
        };
        // Callbacks run outside the lock; they may call back into the store.
        for (on_change, snapshot) in deliveries {
            on_change(snapshot);
        }
    }

    async fn simulate_latency(&self) {
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl StoreState {
    fn evaluate(&self, collection: &str, query: &QuerySpec) -> Vec<RawRecord> {
        let Some(docs) = self.collections.get(collection) else {
            return Vec::new();
        };

        let mut matched: Vec<RawRecord> = docs
            .values()
            .filter(|record| query.filters.iter().all(|f| matches_filter(record, f)))
            .cloned()
            .collect();

        if let Some(order) = &query.order_by {
            matched.sort_by(|a, b| {
                let ordering = match (field_value(a, &order.field), field_value(b, &order.field)) {
                    (Some(x), Some(y)) => compare_values(&x, &y).unwrap_or(Ordering::Equal),
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                match order.direction {
                    Direction::Asc => ordering,
                    Direction::Desc => ordering.reverse(),
                }
            });
        }

        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        matched
    }
}

/// Probe shape used by the cache: limit 1 plus a `>` filter on a timestamp.
pub fn is_probe(query: &QuerySpec) -> bool {
    query.limit == Some(1)
        && query.filters.iter().any(|f| {
            f.operator == FilterOperator::Gt && f.value.is_string() && parse_timestamp(&f.value).is_some()
        })
}

fn field_value(record: &RawRecord, field: &str) -> Option<Value> {
    if field == DOCUMENT_ID_FIELD {
        return Some(Value::String(record.id.clone()));
    }
    record.get(field).filter(|v| !v.is_null()).cloned()
}

fn matches_filter(record: &RawRecord, filter: &Filter) -> bool {
    let Some(actual) = field_value(record, &filter.field) else {
        return false;
    };
    let operand = &filter.value;
    let list = || operand.as_array().map(Vec::as_slice).unwrap_or(&[]);

    match filter.operator {
        FilterOperator::Eq => values_equal(&actual, operand),
        FilterOperator::Ne => !values_equal(&actual, operand),
        FilterOperator::Lt => compare_values(&actual, operand) == Some(Ordering::Less),
        FilterOperator::Lte => matches!(
            compare_values(&actual, operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOperator::Gt => compare_values(&actual, operand) == Some(Ordering::Greater),
        FilterOperator::Gte => matches!(
            compare_values(&actual, operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOperator::In => list().iter().any(|v| values_equal(&actual, v)),
        FilterOperator::NotIn => !list().iter().any(|v| values_equal(&actual, v)),
        FilterOperator::ArrayContains => actual
            .as_array()
            .is_some_and(|items| items.iter().any(|v| values_equal(v, operand))),
        FilterOperator::ArrayContainsAny => actual.as_array().is_some_and(|items| {
            items
                .iter()
                .any(|item| list().iter().any(|v| values_equal(item, v)))
        }),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match compare_values(a, b) {
        Some(ordering) => ordering == Ordering::Equal,
        None => a == b,
    }
}

/// Numbers compare numerically, timestamps chronologically, strings
/// lexically. Mixed kinds are incomparable.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => match (parse_timestamp(a), parse_timestamp(b)) {
            (Some(t1), Some(t2)) => Some(t1.cmp(&t2)),
            _ => Some(x.cmp(y)),
        },
        (Value::Object(_), _) | (_, Value::Object(_)) => {
            Some(parse_timestamp(a)?.cmp(&parse_timestamp(b)?))
        }
        _ => None,
    }
}

struct MemorySubscription {
    id: u64,
    state: Arc<Mutex<StoreState>>,
}

impl Subscription for MemorySubscription {
    fn unsubscribe(self: Box<Self>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.subscribers.remove(&self.id);
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn query(&self, collection: &str, query: &QuerySpec) -> StoreResult<Vec<RawRecord>> {
        let probe = is_probe(query);
        let fail = {
            let mut state = self.state();
            if probe {
                state.counts.probes += 1;
            } else {
                state.counts.queries += 1;
            }
            state.query_log.push((collection.to_string(), query.clone()));
            if probe {
                state.faults.probes
            } else {
                state.faults.queries
            }
        };

        self.simulate_latency().await;

        if fail {
            return Err(StoreError::QueryFailed {
                collection: collection.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(self.state().evaluate(collection, query))
    }

    async fn get_one(&self, collection: &str, id: &str) -> StoreResult<Option<RawRecord>> {
        let fail = {
            let mut state = self.state();
            state.counts.get_one += 1;
            state.faults.get_one
        };

        self.simulate_latency().await;

        if fail {
            return Err(StoreError::FetchFailed {
                collection: collection.to_string(),
                id: id.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(self
            .state()
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned())
    }

    fn subscribe(
        &self,
        collection: &str,
        query: &QuerySpec,
        on_change: SnapshotCallback,
        on_error: ErrorCallback,
    ) -> StoreResult<Box<dyn Subscription>> {
        let (id, snapshot) = {
            let mut state = self.state();
            state.counts.subscribes += 1;
            if state.faults.subscribe {
                return Err(StoreError::SubscriptionFailed {
                    collection: collection.to_string(),
                    reason: "injected failure".to_string(),
                });
            }
            let id = state.next_subscriber;
            state.next_subscriber += 1;
            state.subscribers.insert(
                id,
                Subscriber {
                    collection: collection.to_string(),
                    query: query.clone(),
                    on_change: Arc::clone(&on_change),
                    on_error,
                },
            );
            (id, state.evaluate(collection, query))
        };

        // Initial snapshot, delivered before subscribe returns.
        on_change(snapshot);

        Ok(Box::new(MemorySubscription {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_core::UPDATED_AT;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn task(id: &str, status: &str, priority: i64, updated: &str) -> RawRecord {
        RawRecord::new(id)
            .with_field("status", status)
            .with_field("priority", priority)
            .with_field("tags", json!(["field", status]))
            .with_field(UPDATED_AT, updated)
    }

    fn seeded() -> InMemoryDocumentStore {
        let store = InMemoryDocumentStore::new();
        store.insert_all(
            "tasks",
            vec![
                task("t1", "open", 3, "2024-01-01T00:00:00Z"),
                task("t2", "done", 1, "2024-01-02T00:00:00Z"),
                task("t3", "open", 2, "2024-01-03T00:00:00Z"),
            ],
        );
        store
    }

    #[tokio::test]
    async fn test_filter_sort_limit() {
        let store = seeded();
        let query = QuerySpec::new()
            .filter(Filter::eq("status", "open"))
            .order_by("priority", Direction::Desc)
            .limit(5);
        let ids: Vec<String> = store
            .query("tasks", &query)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["t1", "t3"]);

        let query = QuerySpec::new().filter(Filter::is_in("priority", vec![json!(1.0), json!(2)]));
        assert_eq!(store.query("tasks", &query).await.unwrap().len(), 2);

        let query = QuerySpec::new().filter(Filter::array_contains("tags", "done"));
        assert_eq!(store.query("tasks", &query).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timestamp_comparison_and_probe_counting() {
        let store = seeded();
        let probe = QuerySpec::new()
            .filter(Filter::gt(UPDATED_AT, "2024-01-02T00:00:00.000000000Z"))
            .limit(1);
        assert!(is_probe(&probe));

        let found = store.query("tasks", &probe).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "t3");
        assert_eq!(store.probe_count(), 1);
        assert_eq!(store.query_count(), 0);

        let by_id = QuerySpec::new().filter(Filter::document_id("t2"));
        assert_eq!(store.query("tasks", &by_id).await.unwrap()[0].id, "t2");
        assert_eq!(store.query_count(), 1);
    }

    #[tokio::test]
    async fn test_faults() {
        let store = seeded();
        store.fail_queries(true);
        assert!(store.query("tasks", &QuerySpec::new()).await.is_err());
        store.fail_get_one(true);
        assert!(store.get_one("tasks", "t1").await.is_err());
        store.fail_get_one(false);
        assert!(store.get_one("tasks", "t1").await.unwrap().is_some());
        assert!(store.get_one("tasks", "nope").await.unwrap().is_none());
    }

    #[test]
    fn test_subscription_delivers_initial_and_changes() {
        let store = seeded();
        let deliveries = Arc::new(AtomicUsize::new(0));
        let last_len = Arc::new(AtomicUsize::new(0));

        let (d, l) = (deliveries.clone(), last_len.clone());
        let subscription = store
            .subscribe(
                "tasks",
                &QuerySpec::new().filter(Filter::eq("status", "open")),
                Arc::new(move |records: Vec<RawRecord>| {
                    d.fetch_add(1, AtomicOrdering::SeqCst);
                    l.store(records.len(), AtomicOrdering::SeqCst);
                }),
                Arc::new(|_: StoreError| {}),
            )
            .unwrap();
        assert_eq!(deliveries.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(last_len.load(AtomicOrdering::SeqCst), 2);

        store.insert("tasks", task("t4", "open", 5, "2024-01-04T00:00:00Z"));
        assert_eq!(deliveries.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(last_len.load(AtomicOrdering::SeqCst), 3);

        subscription.unsubscribe();
        assert_eq!(store.active_subscriptions(), 0);
        store.insert("tasks", task("t5", "open", 5, "2024-01-05T00:00:00Z"));
        assert_eq!(deliveries.load(AtomicOrdering::SeqCst), 2);
    }
}
