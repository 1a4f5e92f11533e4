//! Per-service request scheduling.
//!
//! Remote asset services are identified by canonical `host[:port]` names.
//! Each service gets one [`PerServiceQueue`] holding pending fetches in
//! four [`CapabilityClass`] buckets; the [`ServiceRegistry`] owns the
//! name-to-queue map and the process-wide accounting.

mod class;
mod queue;
mod registry;
mod service_name;

pub use class::CapabilityClass;
pub use queue::{ClassFlags, Dispatch, PerServiceQueue, QueueTotals, QueuedFetch, SharedTotals};
pub use registry::ServiceRegistry;
pub use service_name::canonical_service_name;
