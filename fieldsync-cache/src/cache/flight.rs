//! Per-key single-flight for full fetches.
//!
//! Concurrent callers that need a full fetch for the same [`QueryKey`] share
//! one future: the first caller starts it, later callers join it, and every
//! caller receives a clone of the same result. The entry removes itself from
//! the table when the fetch completes, so the next miss starts a new fetch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use fieldsync_core::{FieldsyncError, FieldsyncResult};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::trace;

use super::key::QueryKey;

/// A fetch shared between every caller waiting on the same key.
pub type SharedFetch<V> = Shared<BoxFuture<'static, FieldsyncResult<V>>>;

/// Handle returned by [`FlightTable::join_or_start`].
pub struct Flight<V: Clone> {
    fetch: SharedFetch<V>,
    joined: bool,
}

impl<V> Flight<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// True when another caller started this fetch.
    pub fn joined(&self) -> bool {
        self.joined
    }

    pub async fn wait(self) -> FieldsyncResult<V> {
        self.fetch.await
    }
}

/// Table of in-flight fetches keyed like the cache.
pub struct FlightTable<V: Clone> {
    flights: Arc<Mutex<HashMap<QueryKey, SharedFetch<V>>>>,
}

impl<V> FlightTable<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Join the fetch in flight for `key`, or start one with `start`.
    ///
    /// `start` is only invoked when no fetch is in flight. The table lock is
    /// never held across an await.
    pub fn join_or_start<F>(&self, key: &QueryKey, start: F) -> FieldsyncResult<Flight<V>>
    where
        F: FnOnce() -> BoxFuture<'static, FieldsyncResult<V>>,
    {
        let mut flights = self.flights.lock().map_err(|_| FieldsyncError::LockPoisoned)?;

        if let Some(existing) = flights.get(key) {
            trace!(key = %key, "joining in-flight fetch");
            return Ok(Flight {
                fetch: existing.clone(),
                joined: true,
            });
        }

        let table = Arc::clone(&self.flights);
        let own_key = key.clone();
        let fetch = start();
        let shared = async move {
            let result = fetch.await;
            if let Ok(mut flights) = table.lock() {
                flights.remove(&own_key);
            }
            result
        }
        .boxed()
        .shared();

        flights.insert(key.clone(), shared.clone());
        Ok(Flight {
            fetch: shared,
            joined: false,
        })
    }

    /// Number of fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.flights.lock().map(|f| f.len()).unwrap_or(0)
    }
}

impl<V> Default for FlightTable<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> Clone for FlightTable<V> {
    fn clone(&self) -> Self {
        Self {
            flights: Arc::clone(&self.flights),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_caller_joins() {
        let table: FlightTable<u32> = FlightTable::new();
        let key = QueryKey::collection("tasks", None);
        let starts = Arc::new(AtomicUsize::new(0));

        let start = |starts: Arc<AtomicUsize>| {
            move || {
                starts.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<u32, FieldsyncError>(7)
                }
                .boxed()
            }
        };

        let first = table.join_or_start(&key, start(starts.clone())).unwrap();
        let second = table.join_or_start(&key, start(starts.clone())).unwrap();
        assert!(!first.joined());
        assert!(second.joined());
        assert_eq!(table.in_flight(), 1);

        let (a, b) = tokio::join!(first.wait(), second.wait());
        assert_eq!(a, Ok(7));
        assert_eq!(b, Ok(7));
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(table.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_completed_flight_is_not_reused() {
        let table: FlightTable<u32> = FlightTable::new();
        let key = QueryKey::collection("tasks", None);

        let first = table
            .join_or_start(&key, || async { Ok(1) }.boxed())
            .unwrap();
        assert_eq!(first.wait().await, Ok(1));

        let second = table
            .join_or_start(&key, || async { Ok(2) }.boxed())
            .unwrap();
        assert!(!second.joined());
        assert_eq!(second.wait().await, Ok(2));
    }

    #[tokio::test]
    async fn test_errors_are_shared() {
        let table: FlightTable<u32> = FlightTable::new();
        let key = QueryKey::document("tasks", "t-1");

        let first = table
            .join_or_start(&key, || async { Err(FieldsyncError::LockPoisoned) }.boxed())
            .unwrap();
        let second = table
            .join_or_start(&key, || async { Ok(0) }.boxed())
            .unwrap();

        let (a, b) = tokio::join!(first.wait(), second.wait());
        assert_eq!(a, Err(FieldsyncError::LockPoisoned));
        assert_eq!(b, Err(FieldsyncError::LockPoisoned));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_join() {
        let table: FlightTable<u32> = FlightTable::new();
        let a = table
            .join_or_start(&QueryKey::collection("a", None), || async { Ok(1) }.boxed())
            .unwrap();
        let b = table
            .join_or_start(&QueryKey::collection("b", None), || async { Ok(2) }.boxed())
            .unwrap();
        assert!(!b.joined());
        assert_eq!(tokio::join!(a.wait(), b.wait()), (Ok(1), Ok(2)));
    }
}
