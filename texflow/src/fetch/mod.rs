//! The asset fetch pipeline core.
//!
//! Each requested asset gets a worker that runs the fetch state machine:
//!
//! ```text
//! Init → LoadFromCache → CachePost ─┬→ Decode → WaitDecode → WriteToCache → Done
//!                                   ├→ SendHttp → WaitHttp ──┘
//!                                   └→ LoadFromNetwork → LoadFromSim ──┘
//! ```
//!
//! The [`FetchEngine`] owns the workers and everything they share, and
//! is the whole public surface: create a request, feed it priority and
//! desired-detail updates, poll for pixels.
//!
//! # Key components
//!
//! - [`FetchEngine`] - process-wide dispatcher and public API
//! - [`RequestParams`] - everything a new request needs
//! - [`FetchPoll`] - what polling a request yields
//! - [`FetchState`] - the worker states, visible through [`FetchStatus`]

mod engine;
mod error;
mod priority;
mod state;
mod worker;

pub use engine::{FetchEngine, FetchPoll, FetchStatus, RequestParams};
pub use error::FetchError;
pub use priority::{
    exceeds_hysteresis, work_priority, PRIORITY_HYSTERESIS, PRIORITY_IMMEDIATE, PRIORITY_LOW_BITS,
};
pub use state::{FetchState, SentRequest, WritePolicy};
