//! Concurrency tests: overlapping reads of one key share a single remote
//! fetch, and invalidation racing a fetch keeps the cache empty.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;

use fieldsync_cache::{
    CacheConfig, CacheService, FieldsyncError, Filter, ManualClock, QuerySpec, ReadSource,
};
use fieldsync_core::StoreError;
use fieldsync_test_utils::fixtures::{manual_clock, t, three_task_store, Task, TASKS};
use fieldsync_test_utils::{init_test_tracing, InMemoryDocumentStore};

const LATENCY: Duration = Duration::from_millis(30);

fn setup() -> (Arc<InMemoryDocumentStore>, Arc<ManualClock>, CacheService<InMemoryDocumentStore>) {
    init_test_tracing();
    let store = Arc::new(three_task_store(t(0)));
    store.set_latency(Some(LATENCY));
    let clock = manual_clock();
    let cache = CacheService::with_clock(Arc::clone(&store), CacheConfig::default(), clock.clone())
        .expect("default config is valid");
    (store, clock, cache)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reads_share_one_fetch() {
    let (store, _clock, cache) = setup();

    let reads = join_all((0..8).map(|_| cache.read_collection::<Task>(TASKS, None, None))).await;
    let reads: Vec<_> = reads.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(store.query_count(), 1);
    assert!(reads
        .iter()
        .all(|read| Arc::ptr_eq(read.value(), reads[0].value())));
    assert_eq!(
        reads.iter().filter(|r| r.source() == ReadSource::Remote).count(),
        1
    );
    assert_eq!(
        reads.iter().filter(|r| r.source() == ReadSource::Joined).count(),
        7
    );

    let stats = cache.stats();
    assert_eq!(stats.misses, 8);
    assert_eq!(stats.coalesced, 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_document_reads_share_one_fetch() {
    let (store, _clock, cache) = setup();

    let reads = join_all((0..5).map(|_| cache.get_cached_document::<Task>(TASKS, "t2", None))).await;

    for read in &reads {
        assert_eq!(read.as_ref().unwrap().as_ref().unwrap().id, "t2");
    }
    assert_eq!(store.get_one_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shared_failure_reaches_every_caller() {
    let (store, _clock, cache) = setup();
    store.fail_queries(true);

    let reads = join_all((0..4).map(|_| cache.get_cached_collection::<Task>(TASKS, None, None))).await;

    for read in reads {
        assert!(matches!(
            read,
            Err(FieldsyncError::Store(StoreError::QueryFailed { .. }))
        ));
    }
    assert_eq!(store.query_count(), 1);
    assert_eq!(cache.stats().fetch_failures, 1);
    assert_eq!(cache.stats().entry_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_keys_fetch_independently() {
    let (store, _clock, cache) = setup();
    let open = QuerySpec::new().filter(Filter::eq("status", "open"));

    let (all, filtered) = tokio::join!(
        cache.read_collection::<Task>(TASKS, None, None),
        cache.read_collection::<Task>(TASKS, Some(&open), None),
    );

    assert_eq!(all.unwrap().source(), ReadSource::Remote);
    assert_eq!(filtered.unwrap().source(), ReadSource::Remote);
    assert_eq!(store.query_count(), 2);
    assert_eq!(cache.stats().coalesced, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_finished_flight_is_not_reused() {
    let (store, _clock, cache) = setup();

    cache.read_collection::<Task>(TASKS, None, None).await.unwrap();
    cache.clear_all_cache().unwrap();
    let read = cache.read_collection::<Task>(TASKS, None, None).await.unwrap();

    assert_eq!(read.source(), ReadSource::Remote);
    assert_eq!(store.query_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalidation_during_fetch_keeps_cache_empty() {
    let (store, _clock, cache) = setup();

    let (read, cleared) = tokio::join!(cache.read_collection::<Task>(TASKS, None, None), async {
        tokio::time::sleep(LATENCY / 3).await;
        cache.clear_collection_cache(TASKS)
    });

    // The caller gets its data; the slot stays cleared.
    assert_eq!(read.unwrap().value().len(), 3);
    assert_eq!(cleared.unwrap(), 0);
    assert_eq!(cache.stats().entry_count, 0);

    let again = cache.read_collection::<Task>(TASKS, None, None).await.unwrap();
    assert_eq!(again.source(), ReadSource::Remote);
    assert_eq!(store.query_count(), 2);
}
