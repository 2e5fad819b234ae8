//! Watermarks for staleness probing.
//!
//! A watermark is the newest last-modified timestamp observed across the
//! records held in a cache slot. The staleness probe asks the remote store
//! for anything modified after it; an empty answer proves the slot current.

use std::fmt;

use fieldsync_core::{format_timestamp, CachedRecord, Timestamp};
use serde_json::Value;

/// Newest last-modified instant observed in a cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(Timestamp);

impl Watermark {
    pub fn new(at: Timestamp) -> Self {
        Self(at)
    }

    pub fn timestamp(&self) -> Timestamp {
        self.0
    }

    /// Probe operand in the store's normalized timestamp form.
    pub fn as_filter_value(&self) -> Value {
        format_timestamp(self.0)
    }

    /// Watermark for a freshly fetched or pushed result set.
    ///
    /// - Types that declare no last-modified fields get `None` and are never
    ///   probed.
    /// - Otherwise the maximum `last_modified` across `records`.
    /// - If no record carries a value (including an empty result set), `now`.
    ///   Anything written after this fetch is then still caught by the probe.
    pub fn from_records<T: CachedRecord>(records: &[T], now: Timestamp) -> Option<Self> {
        if T::last_modified_fields().is_empty() {
            return None;
        }
        let newest = records.iter().filter_map(CachedRecord::last_modified).max();
        Some(Self(newest.unwrap_or(now)))
    }

    /// Watermark for a single fetched document.
    pub fn from_record<T: CachedRecord>(record: &T, now: Timestamp) -> Option<Self> {
        Self::from_records(std::slice::from_ref(record), now)
    }

    /// Never move a live slot's watermark backwards.
    pub fn advance(current: Option<Self>, next: Option<Self>) -> Option<Self> {
        match (current, next) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (None, next) => next,
            (current, None) => current,
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl From<Timestamp> for Watermark {
    fn from(at: Timestamp) -> Self {
        Self(at)
    }
}
