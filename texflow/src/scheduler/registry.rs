//! Process-wide map of per-service queues.
//!
//! Queues are created lazily on first lookup and shared by `Arc`: the
//! registry holds one reference, and every worker currently attached to
//! the service holds another. [`ServiceRegistry::release`] collapses an
//! entry once the caller's reference is the last one outside the map and
//! the queues are empty, rechecking under the map lock to defend against
//! a concurrent re-lookup.
//!
//! Lock order: registry map, then a queue's own lock, then the shared
//! totals cell.

use crate::scheduler::queue::{PerServiceQueue, QueueTotals, SharedTotals};
use crate::scheduler::service_name::canonical_service_name;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Registry of [`PerServiceQueue`] instances, keyed by canonical
/// service name.
#[derive(Debug)]
pub struct ServiceRegistry {
    map: Mutex<BTreeMap<String, Arc<PerServiceQueue>>>,
    totals: SharedTotals,
    /// Initial per-service concurrency cap, and the ceiling
    /// [`Self::adjust_concurrent_connections`] clamps to.
    limit_ceiling: u32,
}

impl ServiceRegistry {
    /// Creates an empty registry with the given per-service cap.
    pub fn new(limit_ceiling: u32) -> Self {
        Self {
            map: Mutex::new(BTreeMap::new()),
            totals: Arc::new(Mutex::new(QueueTotals::default())),
            limit_ceiling: limit_ceiling.max(1),
        }
    }

    /// Looks up or creates the queue for `name`.
    pub fn instance(&self, name: &str) -> Arc<PerServiceQueue> {
        debug_assert!(!name.is_empty());
        let mut map = self.map.lock();
        if let Some(existing) = map.get(name) {
            return Arc::clone(existing);
        }
        let queue = Arc::new(PerServiceQueue::new(
            name,
            self.limit_ceiling,
            Arc::clone(&self.totals),
        ));
        map.insert(name.to_string(), Arc::clone(&queue));
        debug!(service = name, "service queue created");
        queue
    }

    /// Looks up or creates the queue for the service addressed by `url`.
    pub fn instance_for_url(&self, url: &str) -> Arc<PerServiceQueue> {
        self.instance(&canonical_service_name(url))
    }

    /// Releases a caller's reference, collapsing the registry entry when
    /// it was the last one outside the map and the queue is empty.
    pub fn release(&self, handle: Arc<PerServiceQueue>) {
        // Cheap pre-check outside the lock: this handle plus the map's.
        if Arc::strong_count(&handle) != 2 {
            return;
        }
        let mut map = self.map.lock();
        // Another thread may have looked the service up in the meantime.
        if Arc::strong_count(&handle) != 2 {
            return;
        }
        if !handle.is_idle() {
            return;
        }
        if let Some(entry) = map.get(handle.name()) {
            if Arc::ptr_eq(entry, &handle) {
                map.remove(handle.name());
                debug!(service = handle.name(), "service queue collapsed");
            }
        }
    }

    /// Walks every service except `name`, in map order.
    pub(crate) fn for_each_other(&self, name: &str, mut f: impl FnMut(&Arc<PerServiceQueue>)) {
        let map = self.map.lock();
        for (key, queue) in map.iter() {
            if key != name {
                f(queue);
            }
        }
    }

    /// Adjusts every service's concurrency cap by `increment`, clamped to
    /// `[1, ceiling]`; the effective per-service delta propagates to each
    /// class's pipelining cap.
    pub fn adjust_concurrent_connections(&self, increment: i32) {
        let map = self.map.lock();
        for queue in map.values() {
            queue.adjust_concurrent_limit(increment, self.limit_ceiling);
        }
    }

    /// Empties every queue and resets the global count.
    pub fn purge(&self) {
        let map = self.map.lock();
        for (name, queue) in map.iter() {
            let cleared = queue.clear_queues();
            if cleared > 0 {
                debug!(service = %name, cleared, "purged service queue");
            }
        }
    }

    /// Sum of pending-queue lengths across all services.
    pub fn total_queued(&self) -> usize {
        self.totals.lock().count
    }

    /// Copy of the global accounting cell.
    pub fn totals_snapshot(&self) -> QueueTotals {
        *self.totals.lock()
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// True when no service is registered.
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    /// True when `name` has a live entry.
    pub fn contains(&self, name: &str) -> bool {
        self.map.lock().contains_key(name)
    }
}
