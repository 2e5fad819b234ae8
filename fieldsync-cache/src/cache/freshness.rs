//! Freshness metadata for cache reads.
//!
//! Every read through [`CacheService`](crate::CacheService) can be observed
//! as a [`CacheRead<T>`], which says where the value came from and how old it
//! is. The plain `get_cached_*` calls discard this and hand back the value.

use std::sync::Arc;
use std::time::Duration;

use fieldsync_core::{elapsed_since, Timestamp};

use super::watermark::Watermark;

/// Where a read's value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadSource {
    /// Reused within max-age without a probe.
    Cache,
    /// Reused within max-age after the probe reported no newer records.
    Verified,
    /// Served from a slot kept current by an open realtime listener.
    Live,
    /// Fetched from the remote store by this caller.
    Remote,
    /// Received from a full fetch another caller already had in flight.
    Joined,
}

impl ReadSource {
    /// True when no full fetch was needed.
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Cache | Self::Verified | Self::Live)
    }
}

/// Result of a cache read, carrying staleness metadata.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: Arc<T>,
    cached_at: Timestamp,
    watermark: Option<Watermark>,
    source: ReadSource,
}

impl<T> CacheRead<T> {
    pub fn new(
        value: Arc<T>,
        cached_at: Timestamp,
        watermark: Option<Watermark>,
        source: ReadSource,
    ) -> Self {
        Self {
            value,
            cached_at,
            watermark,
            source,
        }
    }

    /// Shared handle to the cached value.
    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    pub fn into_value(self) -> Arc<T> {
        self.value
    }

    /// When the slot holding this value was written.
    pub fn cached_at(&self) -> Timestamp {
        self.cached_at
    }

    pub fn watermark(&self) -> Option<Watermark> {
        self.watermark
    }

    pub fn source(&self) -> ReadSource {
        self.source
    }

    pub fn was_cache_hit(&self) -> bool {
        self.source.is_hit()
    }

    /// Age of the value as of `now`.
    pub fn age_at(&self, now: Timestamp) -> Duration {
        elapsed_since(self.cached_at, now)
    }

    /// Check if the data was written at or after `timestamp`.
    pub fn is_fresh_as_of(&self, timestamp: Timestamp) -> bool {
        self.cached_at >= timestamp
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(Arc<T>) -> Arc<U>,
    {
        CacheRead {
            value: f(self.value),
            cached_at: self.cached_at,
            watermark: self.watermark,
            source: self.source,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    #[test]
    fn test_read_source_hits() {
        assert!(ReadSource::Cache.is_hit());
        assert!(ReadSource::Verified.is_hit());
        assert!(ReadSource::Live.is_hit());
        assert!(!ReadSource::Remote.is_hit());
        assert!(!ReadSource::Joined.is_hit());
    }

    #[test]
    fn test_cache_read_accessors() {
        let mark = Some(Watermark::new(at(5)));
        let read = CacheRead::new(Arc::new("tasks"), at(10), mark, ReadSource::Verified);

        assert!(read.was_cache_hit());
        assert_eq!(read.cached_at(), at(10));
        assert_eq!(read.watermark(), mark);
        assert_eq!(read.as_ref(), &"tasks");
    }

    #[test]
    fn test_cache_read_age() {
        let read = CacheRead::new(Arc::new(1u8), at(100), None, ReadSource::Remote);
        assert_eq!(read.age_at(at(130)), Duration::from_secs(30));
        // Clock skew never yields a negative age.
        assert_eq!(read.age_at(at(90)), Duration::ZERO);
    }

    #[test]
    fn test_cache_read_is_fresh_as_of() {
        let read = CacheRead::new(Arc::new(()), at(100), None, ReadSource::Cache);
        assert!(read.is_fresh_as_of(at(90)));
        assert!(read.is_fresh_as_of(at(100)));
        assert!(!read.is_fresh_as_of(at(110)));
    }

    #[test]
    fn test_cache_read_map() {
        let read = CacheRead::new(Arc::new(vec![1, 2, 3]), at(1), None, ReadSource::Remote);
        let mapped = read.map(|v| Arc::new(v.len()));
        assert_eq!(*mapped.into_value(), 3);
    }
}
