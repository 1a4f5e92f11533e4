//! Failure taxonomy for asset fetches.
//!
//! These never cross the engine boundary as `Err` values: each failure
//! steers the state machine (fall back, retry, or terminate) and the
//! terminal ones surface to callers as an aborted poll. They are kept as
//! data for logs and the introspection surface.

use thiserror::Error;

/// Why a fetch attempt failed or changed course.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The cache did not hold enough of the asset.
    #[error("not in cache")]
    NotInCache,

    /// Cached bytes failed to decode; the entry was dropped.
    #[error("cache entry corrupt")]
    CacheCorrupt,

    /// The service answered 404.
    #[error("asset not found (404)")]
    HttpNotFound,

    /// The service did not answer (499).
    #[error("service unreachable (499)")]
    HttpUnreachable,

    /// The service answered 503; retried indefinitely.
    #[error("service busy (503)")]
    HttpBusy,

    /// Any other HTTP error; bounded retries.
    #[error("HTTP error {0}")]
    HttpOther(u16),

    /// No HTTP response within the timeout.
    #[error("HTTP timeout")]
    HttpTimeout,

    /// The codec could not decode the assembled bytes.
    #[error("decode failed")]
    DecodeFailed,

    /// A UDP packet violated the framing rules.
    #[error("protocol violation")]
    ProtocolViolation,

    /// The caller cancelled the fetch. Not an error for reporting
    /// purposes; surfaces as an aborted poll.
    #[error("cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(FetchError::HttpOther(418).to_string(), "HTTP error 418");
        assert_eq!(FetchError::DecodeFailed.to_string(), "decode failed");
    }
}
