//! texflow - progressive image asset fetching
//!
//! This library is the client-side core of an asset delivery pipeline:
//! large compressed image assets (JPEG-2000 texture streams) are pulled
//! from a local blob cache, an HTTP range-GET service, or a legacy UDP
//! packet protocol, decoded progressively, and handed to the renderer
//! as raw pixels.
//!
//! # High-level API
//!
//! The [`fetch::FetchEngine`] is the entry point. Collaborators (codec,
//! cache, transports, region directory) are supplied as trait
//! implementations:
//!
//! ```ignore
//! use texflow::fetch::{FetchEngine, FetchPoll, RequestParams};
//!
//! let engine = FetchEngine::new(codec, cache, http, sim, regions,
//!                               metrics, config, session);
//! engine.create_request(RequestParams { .. });
//!
//! loop {
//!     engine.tick().await;
//!     if let FetchPoll::Ready { raw, .. } = engine.poll_finished(id) {
//!         // hand pixels to the renderer
//!         break;
//!     }
//! }
//! ```

pub mod asset;
pub mod cache;
pub mod codec;
pub mod config;
pub mod fetch;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod region;
pub mod scheduler;
pub mod udp;

/// Version of the texflow library.
///
/// Defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
