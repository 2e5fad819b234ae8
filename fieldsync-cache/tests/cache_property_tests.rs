//! Property-Based Tests for the Read-Through Cache
//!
//! **Property 1: Verified reads are never stale.** With probing enabled, a
//! read issued after any sequence of remote writes returns the current
//! remote result set.
//!
//! **Property 2: Watermarks never move backwards** across successive reads
//! of one slot.
//!
//! **Property 3: Filter order is irrelevant.** A query and its reversed
//! filter list share one slot.

use std::sync::Arc;
use std::time::Duration;

use fieldsync_cache::{
    CacheConfig, CacheService, CachedRecord, Clock, DocumentStore, QuerySpec, ReadOptions, Watermark,
};
use fieldsync_test_utils::fixtures::{
    created_task_record, manual_clock, task_record, t, three_task_store, Task, TASKS,
};
use fieldsync_test_utils::generators::arb_query_spec;
use fieldsync_test_utils::InMemoryDocumentStore;
use proptest::prelude::*;
use tokio::runtime::Runtime;

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

fn test_runtime() -> Result<Runtime, TestCaseError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

/// One remote mutation between reads.
#[derive(Debug, Clone)]
enum Mutation {
    /// Insert a new task stamped with the current time.
    Insert,
    /// Insert a new task carrying only a creation time.
    Create,
    /// Re-stamp an existing task.
    Touch(usize),
    /// Nothing changes remotely.
    Idle,
}

fn mutation_strategy() -> impl Strategy<Value = Mutation> {
    prop_oneof![
        2 => Just(Mutation::Insert),
        2 => Just(Mutation::Create),
        2 => (0usize..8).prop_map(Mutation::Touch),
        1 => Just(Mutation::Idle),
    ]
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// **Property 1: Verified reads are never stale**
    #[test]
    fn prop_verified_reads_track_remote(
        steps in prop::collection::vec((1u64..120, mutation_strategy()), 1..12),
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let store = Arc::new(three_task_store(t(0)));
            let clock = manual_clock();
            let cache = CacheService::with_clock(Arc::clone(&store), CacheConfig::default(), clock.clone())
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            cache.read_collection::<Task>(TASKS, None, None).await
                .map_err(|e| TestCaseError::fail(e.to_string()))?;

            let mut inserted = 0usize;
            for (advance, mutation) in steps {
                clock.advance(Duration::from_secs(advance));
                let now = clock.now();
                match mutation {
                    Mutation::Insert => {
                        inserted += 1;
                        store.insert(TASKS, task_record(&format!("n{inserted}"), "New task", now));
                    }
                    Mutation::Create => {
                        inserted += 1;
                        store.insert(TASKS, created_task_record(&format!("n{inserted}"), "Created task", now));
                    }
                    Mutation::Touch(n) => {
                        let id = format!("t{}", n % 3 + 1);
                        store.update(TASKS, &id, |record| {
                            record.set("title", format!("Touched at {advance}"));
                            record.set(fieldsync_core::UPDATED_AT, fieldsync_core::format_timestamp(now));
                        });
                    }
                    Mutation::Idle => {}
                }

                let read = cache.read_collection::<Task>(TASKS, None, None).await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                let remote: Vec<Task> = store
                    .query(TASKS, &QuerySpec::new())
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?
                    .into_iter()
                    .map(Task::from_raw)
                    .collect::<Result<_, _>>()
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                prop_assert_eq!(read.value().as_ref(), &remote);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }

    /// **Property 2: Watermarks never move backwards**
    #[test]
    fn prop_watermark_is_monotonic(
        offsets in prop::collection::vec(-3_600i64..3_600, 1..10),
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let store = Arc::new(InMemoryDocumentStore::new());
            let clock = manual_clock();
            let cache = CacheService::with_clock(Arc::clone(&store), CacheConfig::default(), clock.clone())
                .map_err(|e| TestCaseError::fail(e.to_string()))?;

            let mut previous: Option<Watermark> = None;
            for (i, offset) in offsets.into_iter().enumerate() {
                store.insert(TASKS, task_record(&format!("w{i}"), "Stamped", t(offset)));
                cache.clear_collection_cache(TASKS)
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                let read = cache.read_collection::<Task>(TASKS, None, None).await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                let watermark = read.watermark();
                prop_assert!(watermark >= previous);
                previous = watermark;
            }
            Ok::<(), TestCaseError>(())
        })?;
    }

    /// **Property 3: Filter order is irrelevant**
    #[test]
    fn prop_filter_order_shares_slot(spec in arb_query_spec()) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let store = Arc::new(three_task_store(t(0)));
            let cache = CacheService::with_clock(Arc::clone(&store), CacheConfig::default(), manual_clock())
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            let options = Some(ReadOptions::unchecked(Duration::from_secs(60)));

            let mut reversed = spec.clone();
            reversed.filters.reverse();
            let reversed: QuerySpec = reversed;

            let first = cache.get_cached_collection::<Task>(TASKS, Some(&spec), options).await
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            let second = cache.get_cached_collection::<Task>(TASKS, Some(&reversed), options).await
                .map_err(|e| TestCaseError::fail(e.to_string()))?;

            prop_assert!(Arc::ptr_eq(&first, &second));
            prop_assert_eq!(store.counts().total(), 1);
            Ok::<(), TestCaseError>(())
        })?;
    }
}
