//! Cache usage counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Hits reused within max-age without a probe.
    pub hits: u64,
    /// Hits confirmed current by a probe.
    pub verified_hits: u64,
    /// Hits served from a slot kept current by a realtime listener.
    pub live_hits: u64,
    /// Reads that found no usable slot (absent, expired or wrong type).
    pub misses: u64,
    /// Hits the probe reported stale (or failed on), followed by a refetch.
    pub stale_refetches: u64,
    /// Staleness checks run. A check queries each last-modified field until one reports a change.
    pub probes: u64,
    /// Probes that failed and were treated as stale.
    pub probe_failures: u64,
    /// Full fetches that failed.
    pub fetch_failures: u64,
    /// Callers that joined a fetch another caller already had in flight.
    pub coalesced: u64,
    /// Snapshots written by realtime listeners.
    pub push_updates: u64,
    /// Slots currently held.
    pub entry_count: u64,
    /// Realtime listeners currently open.
    pub active_listeners: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0). Every hit kind counts.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits + self.verified_hits + self.live_hits;
        let total = hits + self.misses + self.stale_refetches;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Live counters; [`CacheStats`] is a snapshot of these.
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    pub hits: AtomicU64,
    pub verified_hits: AtomicU64,
    pub live_hits: AtomicU64,
    pub misses: AtomicU64,
    pub stale_refetches: AtomicU64,
    pub probes: AtomicU64,
    pub probe_failures: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub coalesced: AtomicU64,
    pub push_updates: AtomicU64,
}

impl StatsRecorder {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, entry_count: u64, active_listeners: u64) -> CacheStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStats {
            hits: load(&self.hits),
            verified_hits: load(&self.verified_hits),
            live_hits: load(&self.live_hits),
            misses: load(&self.misses),
            stale_refetches: load(&self.stale_refetches),
            probes: load(&self.probes),
            probe_failures: load(&self.probe_failures),
            fetch_failures: load(&self.fetch_failures),
            coalesced: load(&self.coalesced),
            push_updates: load(&self.push_updates),
            entry_count,
            active_listeners,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 50,
            verified_hits: 20,
            live_hits: 10,
            misses: 15,
            stale_refetches: 5,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_recorder_snapshot() {
        let recorder = StatsRecorder::default();
        StatsRecorder::bump(&recorder.hits);
        StatsRecorder::bump(&recorder.hits);
        StatsRecorder::bump(&recorder.probes);

        let stats = recorder.snapshot(3, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.probes, 1);
        assert_eq!(stats.entry_count, 3);
        assert_eq!(stats.active_listeners, 1);
    }
}
