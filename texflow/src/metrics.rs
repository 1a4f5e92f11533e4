//! Fetch metrics sink.
//!
//! The engine reports a handful of counters; where they go (logs, a
//! stats bar, an exporter) is the embedder's choice. [`FetchStats`] is a
//! cheap atomic implementation good enough for most uses and for tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Receiver for fetch pipeline observations.
pub trait MetricsSink: Send + Sync + 'static {
    /// Bytes of asset data received over HTTP, drained once per tick.
    fn asset_bytes(&self, bytes: u64);

    /// A cache probe concluded; `hit` when the cache satisfied the
    /// desired size.
    fn cache_probe(&self, hit: bool);

    /// Latency of one cache read.
    fn cache_read_latency(&self, elapsed: Duration);

    /// An inbound UDP packet was processed; `bad` when it was rejected.
    fn packet(&self, bad: bool);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn asset_bytes(&self, _bytes: u64) {}
    fn cache_probe(&self, _hit: bool) {}
    fn cache_read_latency(&self, _elapsed: Duration) {}
    fn packet(&self, _bad: bool) {}
}

/// Atomic counters implementing [`MetricsSink`].
#[derive(Debug, Default)]
pub struct FetchStats {
    asset_bytes: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_read_micros: AtomicU64,
    packets: AtomicU64,
    bad_packets: AtomicU64,
}

impl FetchStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total asset bytes received over HTTP.
    pub fn total_asset_bytes(&self) -> u64 {
        self.asset_bytes.load(Ordering::Relaxed)
    }

    /// Cache hit rate over all probes, in `[0, 1]`; zero before any probe.
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let total = hits + self.cache_misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Cumulative cache read time.
    pub fn cache_read_time(&self) -> Duration {
        Duration::from_micros(self.cache_read_micros.load(Ordering::Relaxed))
    }

    /// Packets processed, total and rejected.
    pub fn packet_counts(&self) -> (u64, u64) {
        (
            self.packets.load(Ordering::Relaxed),
            self.bad_packets.load(Ordering::Relaxed),
        )
    }
}

impl MetricsSink for FetchStats {
    fn asset_bytes(&self, bytes: u64) {
        self.asset_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn cache_probe(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn cache_read_latency(&self, elapsed: Duration) {
        self.cache_read_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    fn packet(&self, bad: bool) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        if bad {
            self.bad_packets.fetch_add(1, Ordering::Relaxed);
        }
    }
}
