//! HTTP transport seam and the per-host failure blacklist.

mod blacklist;
mod client;

pub use blacklist::{HostBlacklist, MAX_ERROR_COUNT};
pub use client::{ByteRange, HttpError, HttpResponse, HttpTransport, ReqwestTransport};
