//! Short-term deny list for misbehaving HTTP asset services.
//!
//! Entries are keyed by the URL prefix up to (but not including) the last
//! `/`, so every asset URL under the same service path shares one entry.
//! An entry only denies requests once its error count crosses
//! [`MAX_ERROR_COUNT`], and then only until its expiry; expired entries
//! are swept opportunistically on lookup.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Error count a prefix must exceed before it is actually denied.
pub const MAX_ERROR_COUNT: u32 = 20;

#[derive(Debug, Clone)]
struct Entry {
    prefix: String,
    expires_at: Instant,
    reason: u16,
    error_count: u32,
}

/// Transient per-service deny list for the HTTP transport.
///
/// A handful of entries at most, so storage is a flat vector.
#[derive(Debug, Default)]
pub struct HostBlacklist {
    entries: Mutex<Vec<Entry>>,
}

impl HostBlacklist {
    /// Creates an empty blacklist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure for the service prefix of `url`, refreshing the
    /// expiry. The first report creates the entry at error count zero;
    /// each subsequent report increments it.
    pub fn add(&self, url: &str, timeout: Duration, reason: u16) {
        let Some(prefix) = service_prefix(url) else {
            return;
        };
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.iter_mut().find(|e| e.prefix == prefix) {
            entry.error_count += 1;
            entry.expires_at = now + timeout;
            entry.reason = reason;
            if entry.error_count > MAX_ERROR_COUNT {
                warn!(
                    prefix = %entry.prefix,
                    errors = entry.error_count,
                    reason,
                    timeout_secs = timeout.as_secs(),
                    "service denied after repeated failures"
                );
            }
        } else {
            entries.push(Entry {
                prefix: prefix.to_string(),
                expires_at: now + timeout,
                reason,
                error_count: 0,
            });
        }
    }

    /// True when `url` falls under a prefix whose error count has crossed
    /// the threshold and whose entry has not yet expired.
    pub fn is_blacklisted(&self, url: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|e| e.expires_at > now);
        entries
            .iter()
            .any(|e| url.starts_with(e.prefix.as_str()) && e.error_count > MAX_ERROR_COUNT)
    }

    /// Current error count for the service prefix of `url`, if tracked.
    pub fn error_count(&self, url: &str) -> Option<u32> {
        let prefix = service_prefix(url)?;
        self.entries
            .lock()
            .iter()
            .find(|e| e.prefix == prefix)
            .map(|e| e.error_count)
    }

    /// Last recorded reason code for the service prefix of `url`.
    pub fn reason(&self, url: &str) -> Option<u16> {
        let prefix = service_prefix(url)?;
        self.entries
            .lock()
            .iter()
            .find(|e| e.prefix == prefix)
            .map(|e| e.reason)
    }

    /// Number of tracked entries, including not-yet-denied ones.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn service_prefix(url: &str) -> Option<&str> {
    match url.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&url[..idx]),
    }
}
