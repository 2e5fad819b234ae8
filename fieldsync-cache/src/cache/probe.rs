//! Staleness probe: "has anything changed since watermark W?"
//!
//! The probe is one single-row remote query per last-modified field. It is
//! far cheaper than a full refetch and proves a cached slot current when
//! every query comes back empty.

use std::sync::Arc;

use fieldsync_core::{DocumentStore, Filter, QuerySpec, StoreError};
use tracing::{debug, warn};

use super::watermark::Watermark;

/// Result of probing one slot.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// No record modified after the watermark.
    Unchanged,
    /// At least one record modified after the watermark.
    Changed,
    /// The probe itself failed; callers treat the slot as stale.
    Failed(StoreError),
}

impl ProbeOutcome {
    /// Whether the slot must be refetched.
    pub fn is_stale(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Probe query for a collection slot.
///
/// The probe spans the whole collection rather than the slot's own filters:
/// a record that moved out of the filtered set must also invalidate it.
pub fn collection_probe(field: &str, watermark: Watermark) -> QuerySpec {
    QuerySpec::new()
        .filter(Filter::gt(field, watermark.as_filter_value()))
        .limit(1)
}

/// Probe query for a single-document slot.
pub fn document_probe(id: &str, field: &str, watermark: Watermark) -> QuerySpec {
    collection_probe(field, watermark).filter(Filter::document_id(id))
}

/// Issues staleness probes against a [`DocumentStore`].
pub struct StalenessProber<S: DocumentStore> {
    store: Arc<S>,
}

impl<S: DocumentStore> StalenessProber<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Probe a collection slot on each of `fields` in turn.
    pub async fn probe_collection(
        &self,
        collection: &str,
        fields: &[&str],
        watermark: Watermark,
    ) -> ProbeOutcome {
        for field in fields {
            let query = collection_probe(field, watermark);
            let outcome = self.run(collection, field, &query, watermark).await;
            if outcome.is_stale() {
                return outcome;
            }
        }
        ProbeOutcome::Unchanged
    }

    /// Probe a single-document slot on each of `fields` in turn.
    pub async fn probe_document(
        &self,
        collection: &str,
        id: &str,
        fields: &[&str],
        watermark: Watermark,
    ) -> ProbeOutcome {
        for field in fields {
            let query = document_probe(id, field, watermark);
            let outcome = self.run(collection, field, &query, watermark).await;
            if outcome.is_stale() {
                return outcome;
            }
        }
        ProbeOutcome::Unchanged
    }

    async fn run(
        &self,
        collection: &str,
        field: &str,
        query: &QuerySpec,
        watermark: Watermark,
    ) -> ProbeOutcome {
        match self.store.query(collection, query).await {
            Ok(records) if records.is_empty() => {
                debug!(collection, field, %watermark, "probe: unchanged");
                ProbeOutcome::Unchanged
            }
            Ok(_) => {
                debug!(collection, field, %watermark, "probe: newer records found");
                ProbeOutcome::Changed
            }
            Err(e) => {
                warn!(collection, field, %watermark, error = %e, "probe failed, assuming stale");
                ProbeOutcome::Failed(e)
            }
        }
    }
}

impl<S: DocumentStore> Clone for StalenessProber<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}
