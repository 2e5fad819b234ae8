//! Fieldsync Test Utilities
//!
//! Centralized test infrastructure for the Fieldsync workspace:
//! - An in-memory document store with call accounting and fault injection
//! - Proptest generators for filters and query specifications
//! - Test fixtures for task collections
//! - Custom assertions for Fieldsync errors

pub mod mock_store;

pub use mock_store::{is_probe, CallCounts, InMemoryDocumentStore};

// Re-export core types for convenience
pub use fieldsync_core::{
    CachedRecord, Direction, FieldsyncError, FieldsyncResult, Filter, FilterOperator, ManualClock,
    QueryError, QuerySpec, RawRecord, RecordError, StoreError, Timestamp, CREATED_AT, UPDATED_AT,
};

use chrono::Utc;

/// Install a `tracing` subscriber for tests, filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for query specifications and records.

    use super::*;
    use proptest::prelude::*;
    use serde_json::Value;

    /// Generate a Timestamp (DateTime<Utc>).
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        // Generate timestamps within a reasonable range (2020-2030)
        (1577836800i64..1893456000i64, 0u32..1_000_000_000u32).prop_map(|(secs, nanos)| {
            chrono::DateTime::from_timestamp(secs, nanos).unwrap_or_else(Utc::now)
        })
    }

    /// Generate a plausible field name.
    pub fn arb_field_name() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("status".to_string()),
            Just("assignee".to_string()),
            Just("priority".to_string()),
            Just("dueDate".to_string()),
            Just("site".to_string()),
            "[a-z][a-zA-Z0-9_]{0,12}",
        ]
    }

    /// Generate a scalar operand usable with every comparison operator.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i64>().prop_map(Value::from),
            (-1.0e6f64..1.0e6f64).prop_map(Value::from),
            "[a-z0-9-]{0,10}".prop_map(Value::from),
            arb_timestamp().prop_map(fieldsync_core::format_timestamp),
        ]
    }

    /// Generate a valid filter.
    pub fn arb_filter() -> impl Strategy<Value = Filter> {
        let scalar_op = prop_oneof![
            Just(FilterOperator::Eq),
            Just(FilterOperator::Ne),
            Just(FilterOperator::Lt),
            Just(FilterOperator::Lte),
            Just(FilterOperator::Gt),
            Just(FilterOperator::Gte),
            Just(FilterOperator::ArrayContains),
        ];
        let list_op = prop_oneof![
            Just(FilterOperator::In),
            Just(FilterOperator::NotIn),
            Just(FilterOperator::ArrayContainsAny),
        ];

        prop_oneof![
            (arb_field_name(), scalar_op, arb_scalar())
                .prop_map(|(field, op, value)| Filter::new(field, op, value)),
            (arb_field_name(), any::<bool>())
                .prop_map(|(field, flag)| Filter::eq(field, flag)),
            (
                arb_field_name(),
                list_op,
                prop::collection::vec(arb_scalar(), 1..5)
            )
                .prop_map(|(field, op, values)| Filter::new(field, op, Value::Array(values))),
        ]
    }

    pub fn arb_direction() -> impl Strategy<Value = Direction> {
        prop_oneof![Just(Direction::Asc), Just(Direction::Desc)]
    }

    /// Generate a valid query specification.
    pub fn arb_query_spec() -> impl Strategy<Value = QuerySpec> {
        (
            prop::collection::vec(arb_filter(), 0..5),
            prop::option::of((arb_field_name(), arb_direction())),
            prop::option::of(1usize..500),
        )
            .prop_map(|(filters, order, limit)| {
                let mut spec = QuerySpec {
                    filters,
                    ..QuerySpec::default()
                };
                if let Some((field, direction)) = order {
                    spec = spec.order_by(field, direction);
                }
                spec.limit = limit;
                spec
            })
    }

    /// Generate a task-shaped raw record.
    pub fn arb_task_record() -> impl Strategy<Value = RawRecord> {
        (
            "t-[a-z0-9]{6}",
            "[A-Za-z ]{1,24}",
            prop_oneof![Just("open"), Just("in_progress"), Just("done")],
            0i64..5,
            arb_timestamp(),
        )
            .prop_map(|(id, title, status, priority, updated)| {
                RawRecord::new(id)
                    .with_field("title", title)
                    .with_field("status", status)
                    .with_field("priority", priority)
                    .with_timestamp(UPDATED_AT, updated)
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use std::sync::Arc;

    use super::*;
    use chrono::TimeZone;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    pub const TASKS: &str = "tasks";
    pub const PAYMENTS: &str = "payments";

    /// A field-service task as an application would model it.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Task {
        pub id: String,
        pub title: String,
        pub status: String,
        #[serde(default)]
        pub assignee: Option<String>,
        #[serde(default)]
        pub priority: i64,
        #[serde(rename = "updatedAt", default)]
        pub updated_at: Option<Timestamp>,
        #[serde(rename = "createdAt", default)]
        pub created_at: Option<Timestamp>,
    }

    impl CachedRecord for Task {
        fn from_raw(raw: RawRecord) -> Result<Self, RecordError> {
            raw.decode()
        }

        fn last_modified(&self) -> Option<Timestamp> {
            self.updated_at.or(self.created_at)
        }
    }

    /// A record type that declares no last-modified field and is never checked for staleness.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Payment {
        pub id: String,
        pub amount_cents: i64,
    }

    impl CachedRecord for Payment {
        fn from_raw(raw: RawRecord) -> Result<Self, RecordError> {
            raw.decode()
        }

        fn last_modified(&self) -> Option<Timestamp> {
            None
        }

        fn last_modified_fields() -> &'static [&'static str] {
            &[]
        }
    }

    /// Fixed reference instant: 2024-01-01T00:00:00Z.
    pub fn base_time() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// `base_time()` plus `secs` seconds.
    pub fn t(secs: i64) -> Timestamp {
        base_time() + chrono::Duration::seconds(secs)
    }

    /// Manual clock starting at `base_time()`.
    pub fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(base_time()))
    }

    /// Open task updated at `updated_at`, timestamp in RFC 3339 form.
    pub fn task_record(id: &str, title: &str, updated_at: Timestamp) -> RawRecord {
        RawRecord::new(id)
            .with_field("title", title)
            .with_field("status", "open")
            .with_field("priority", 1)
            .with_timestamp(CREATED_AT, updated_at)
            .with_timestamp(UPDATED_AT, updated_at)
    }

    /// Open task that was created at `created_at` and never updated.
    pub fn created_task_record(id: &str, title: &str, created_at: Timestamp) -> RawRecord {
        RawRecord::new(id)
            .with_field("title", title)
            .with_field("status", "open")
            .with_field("priority", 1)
            .with_timestamp(CREATED_AT, created_at)
    }

    /// Task whose `updatedAt` uses the store-native `{seconds, nanoseconds}` form.
    pub fn task_record_native(id: &str, title: &str, updated_at: Timestamp) -> RawRecord {
        RawRecord::new(id)
            .with_field("title", title)
            .with_field("status", "open")
            .with_field(
                UPDATED_AT,
                json!({
                    "seconds": updated_at.timestamp(),
                    "nanoseconds": updated_at.timestamp_subsec_nanos(),
                }),
            )
    }

    /// Task with a random id, updated at `updated_at`.
    pub fn random_task(updated_at: Timestamp) -> RawRecord {
        let id = format!("t-{}", uuid::Uuid::now_v7().simple());
        task_record(&id, "Generated task", updated_at)
    }

    pub fn payment_record(id: &str, amount_cents: i64) -> RawRecord {
        RawRecord::new(id).with_field("amount_cents", amount_cents)
    }

    /// Store holding three open tasks, two of them last updated at `t0`.
    pub fn three_task_store(t0: Timestamp) -> InMemoryDocumentStore {
        let store = InMemoryDocumentStore::new();
        store.insert_all(
            TASKS,
            vec![
                task_record("t1", "Inspect pump", t0 - chrono::Duration::hours(1)),
                task_record("t2", "Replace filter", t0),
                task_record("t3", "Log readings", t0),
            ],
        );
        store
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for Fieldsync-specific validation.

    use super::*;

    /// Assert that a FieldsyncResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &FieldsyncResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a FieldsyncResult is a Store error.
    #[track_caller]
    pub fn assert_store_error<T: std::fmt::Debug>(result: &FieldsyncResult<T>) {
        match result {
            Err(FieldsyncError::Store(_)) => {}
            other => panic!("Expected Store error, got: {:?}", other),
        }
    }

    /// Assert that a FieldsyncResult is a Query validation error.
    #[track_caller]
    pub fn assert_query_error<T: std::fmt::Debug>(result: &FieldsyncResult<T>) {
        match result {
            Err(FieldsyncError::Query(_)) => {}
            other => panic!("Expected Query error, got: {:?}", other),
        }
    }

    /// Assert that a FieldsyncResult is a Record mapping error.
    #[track_caller]
    pub fn assert_record_error<T: std::fmt::Debug>(result: &FieldsyncResult<T>) {
        match result {
            Err(FieldsyncError::Record(_)) => {}
            other => panic!("Expected Record error, got: {:?}", other),
        }
    }

    /// Assert that the store saw exactly the given numbers of full queries
    /// and probes.
    #[track_caller]
    pub fn assert_calls(store: &InMemoryDocumentStore, queries: usize, probes: usize) {
        let counts = store.counts();
        assert_eq!(
            (counts.queries, counts.probes),
            (queries, probes),
            "Unexpected remote calls: {:?}",
            counts
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================
