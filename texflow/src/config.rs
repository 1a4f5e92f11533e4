//! Fetch pipeline tunables.
//!
//! A plain typed struct consumed by the engine. Loading these from a
//! settings store is the embedder's job; the defaults here are the
//! shipped values.

use std::time::Duration;

/// Tunables for the fetch engine and its admission control.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Hard cap on concurrent HTTP requests across all services.
    pub http_max_requests: usize,

    /// Floor under which HTTP requests are always admitted, even when
    /// the bandwidth throttle is engaged.
    pub http_min_requests: usize,

    /// Bandwidth above which new HTTP requests are throttled, in kbit/s.
    pub http_throttle_kbps: f32,

    /// Whole-request HTTP timeout. A worker whose request has been
    /// outstanding this long gives up on the asset.
    pub http_timeout: Duration,

    /// Retries allowed for HTTP errors other than 404/499/503.
    pub max_http_retries: u32,

    /// How long a 499 keeps a service on the deny list.
    pub blacklist_timeout: Duration,

    /// Whether HTTP fetching is enabled at all.
    pub use_http: bool,

    /// Initial (and maximum) concurrent connections per service.
    pub connections_per_service: u32,

    /// Minimum interval between UDP request sweeps.
    pub sweep_interval: Duration,

    /// A UDP request is not repeated within this interval unless the
    /// desired discard changed.
    pub min_request_time: Duration,

    /// Priority change that justifies re-requesting before the lazy
    /// flush timeout.
    pub min_delta_priority: f32,

    /// A pending UDP request older than this is re-sent regardless.
    pub lazy_flush_timeout: Duration,

    /// Largest value the UI priority source produces; scales priorities
    /// into the work-queue's integer range.
    pub max_image_priority: f32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            http_max_requests: 8,
            http_min_requests: 2,
            http_throttle_kbps: 2000.0,
            http_timeout: Duration::from_secs(15),
            max_http_retries: 3,
            blacklist_timeout: Duration::from_secs(60),
            use_http: true,
            connections_per_service: 4,
            sweep_interval: Duration::from_millis(100),
            min_request_time: Duration::from_secs(1),
            min_delta_priority: 1000.0,
            lazy_flush_timeout: Duration::from_secs(10),
            max_image_priority: 10_000_000.0,
        }
    }
}
