//! HTTP client abstraction for testability.
//!
//! The pipeline never folds HTTP status codes into transport errors: the
//! fetch state machine dispatches on 404/499/503 individually, so a
//! completed exchange always surfaces as `Ok(HttpResponse)` carrying the
//! status. `Err(HttpError)` is reserved for failures where no response
//! arrived at all (connect, timeout, body truncation).

use bytes::Bytes;
use std::future::Future;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Half-open byte range `[offset, offset + length)` for a partial GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte requested.
    pub offset: usize,
    /// Number of bytes requested.
    pub length: usize,
}

impl ByteRange {
    /// Renders the inclusive `Range` header value.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.offset, self.offset + self.length - 1)
    }
}

/// A completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code, e.g. 200, 206, 404.
    pub status: u16,
    /// Reason phrase or transport diagnostic, for logs.
    pub reason: String,
    /// Response body.
    pub body: Bytes,
}

impl HttpResponse {
    /// True for any 2xx status.
    #[inline]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// True for 206 Partial Content.
    #[inline]
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }
}

/// Errors where no HTTP response was received.
#[derive(Debug, Clone, Error)]
pub enum HttpError {
    /// Could not connect or the connection broke mid-exchange.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The transport-level timeout elapsed.
    #[error("request timed out")]
    Timeout,

    /// Response headers arrived but the body could not be read.
    #[error("failed to read response body: {0}")]
    Body(String),

    /// The URL could not be parsed or used.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

/// Trait for the HTTP transport.
///
/// Implementations must follow redirects; the caller supplies all other
/// headers, including `Range` via the `range` argument.
pub trait HttpTransport: Send + Sync + 'static {
    /// Performs a GET, returning the final response after redirects.
    fn get(
        &self,
        url: &str,
        range: Option<ByteRange>,
        headers: &[(&str, &str)],
    ) -> impl Future<Output = Result<HttpResponse, HttpError>> + Send;
}

/// Real HTTP transport implementation using reqwest.
///
/// Tuned for many small range requests against a handful of asset
/// services: pooled warm connections, TCP keepalive and nodelay.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a transport with the given whole-request timeout.
    pub fn new(timeout: std::time::Duration) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| HttpError::Connect(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        range: Option<ByteRange>,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse, HttpError> {
        trace!(url, ?range, "HTTP GET starting");

        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        if let Some(range) = range {
            request = request.header("Range", range.header_value());
        }

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                warn!(url, "HTTP request timed out");
                return Err(HttpError::Timeout);
            }
            Err(e) => {
                warn!(url, error = %e, "HTTP request failed");
                return Err(HttpError::Connect(e.to_string()));
            }
        };

        let status = response.status().as_u16();
        let reason = response
            .status()
            .canonical_reason()
            .unwrap_or("")
            .to_string();
        debug!(url, status, "HTTP response received");

        let body = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) if e.is_timeout() => return Err(HttpError::Timeout),
            Err(e) => {
                warn!(url, error = %e, "failed to read response body");
                return Err(HttpError::Body(e.to_string()));
            }
        };

        trace!(url, status, bytes = body.len(), "HTTP body read");
        Ok(HttpResponse {
            status,
            reason,
            body,
        })
    }
}
