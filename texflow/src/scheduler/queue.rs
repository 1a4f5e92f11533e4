//! Per-service request queue with weighted-fair dispatch.
//!
//! One [`PerServiceQueue`] exists per canonical service name. It holds
//! four FIFO queues of pending fetches (one per [`CapabilityClass`]),
//! counts how many requests for the service are currently attached to the
//! HTTP transport, and enforces the per-service concurrency cap.
//!
//! # Dispatch order
//!
//! [`PerServiceQueue::add_queued_to`] offers at most one pending fetch to
//! the transport per call. The visit order over classes is:
//!
//! 1. The two approved classes, longer queue first; on a tie the
//!    `approved_first` cursor alternates which goes first.
//! 2. The two unapproved classes, strictly round-robin via the
//!    `unapproved_first` cursor. The cursor advances on every order
//!    build, dispatched or not.
//!
//! The first non-empty queue in that order is offered; a rejection stops
//! the walk, because whatever throttled this request throttles the rest
//! of the service too. If nothing in this service could be dispatched the
//! sweep spills over into every other registered service once.

use crate::asset::AssetId;
use crate::scheduler::class::CapabilityClass;
use crate::scheduler::registry::ServiceRegistry;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

/// A pending fetch waiting for a transport slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedFetch {
    /// Asset the fetch is for.
    pub id: AssetId,
    /// Fairness bucket it was queued under.
    pub class: CapabilityClass,
}

/// Receiver side of a dispatch attempt.
///
/// `add` returns true when the request was accepted onto the transport
/// and false when it was throttled. Implementations must not call back
/// into the offering queue: the queue's lock is held across the call.
pub trait Dispatch {
    /// Offers one pending fetch. True = accepted, false = throttled.
    fn add(&mut self, request: &QueuedFetch) -> bool;
}

/// Process-wide queue accounting, shared by every service.
///
/// Guarded by its own lock, always acquired after the owning queue's
/// lock. The flags are edge-triggered observations consumed by admission
/// control.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueTotals {
    /// Sum of all pending-queue lengths across services.
    pub count: usize,
    /// A pop left every queue empty.
    pub empty: bool,
    /// A pop left work still pending somewhere.
    pub full: bool,
    /// A dispatch sweep found every queue already empty.
    pub starvation: bool,
}

/// Shared handle to the global queue totals.
pub type SharedTotals = Arc<Mutex<QueueTotals>>;

/// Per-class event flags, consumed by admission control.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClassFlags {
    /// A pop left this class's queue empty.
    pub empty: bool,
    /// A pop left this class's queue non-empty.
    pub full: bool,
    /// A sweep visited this class and found nothing queued.
    pub starvation: bool,
}

#[derive(Debug, Default)]
struct ClassState {
    queued: VecDeque<QueuedFetch>,
    added: u32,
    downloading: u32,
    max_pipelined: u32,
    flags: ClassFlags,
}

#[derive(Debug)]
struct ServiceState {
    classes: [ClassState; CapabilityClass::COUNT],
    concurrent_limit: u32,
    total_added: u32,
    approved_first: usize,
    unapproved_first: usize,
}

/// Request queue and concurrency accounting for one service endpoint.
#[derive(Debug)]
pub struct PerServiceQueue {
    name: String,
    totals: SharedTotals,
    inner: Mutex<ServiceState>,
}

impl PerServiceQueue {
    /// Creates a queue for `name` with the given concurrency cap.
    pub fn new(name: impl Into<String>, concurrent_limit: u32, totals: SharedTotals) -> Self {
        let classes = std::array::from_fn(|_| ClassState {
            max_pipelined: concurrent_limit,
            ..ClassState::default()
        });
        Self {
            name: name.into(),
            totals,
            inner: Mutex::new(ServiceState {
                classes,
                concurrent_limit,
                total_added: 0,
                approved_first: 0,
                unapproved_first: 0,
            }),
        }
    }

    /// Canonical service name this queue is keyed by.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends a fetch to its class queue.
    pub fn enqueue(&self, request: QueuedFetch) {
        let mut inner = self.inner.lock();
        inner.classes[request.class.index()].queued.push_back(request);
        self.totals.lock().count += 1;
        trace!(service = %self.name, id = %request.id, class = ?request.class, "fetch queued");
    }

    /// Removes a pending fetch, preserving the order of the remaining
    /// entries. Returns false if it was not queued.
    pub fn cancel(&self, request: &QueuedFetch) -> bool {
        let mut inner = self.inner.lock();
        let queue = &mut inner.classes[request.class.index()].queued;
        let Some(pos) = queue.iter().position(|q| q.id == request.id) else {
            return false;
        };
        // Walk the entry to the tail with pairwise swaps and pop it there;
        // erase-by-assignment would move entries under concurrent readers
        // holding the old order.
        for i in pos..queue.len() - 1 {
            queue.swap(i, i + 1);
        }
        queue.pop_back();

        let mut totals = self.totals.lock();
        debug_assert!(totals.count > 0);
        totals.count = totals.count.saturating_sub(1);
        true
    }

    /// True when the service has reached its concurrency cap.
    pub fn throttled(&self) -> bool {
        let inner = self.inner.lock();
        inner.total_added >= inner.concurrent_limit
    }

    /// Records a request for `class` attaching to the HTTP transport.
    pub fn added_to_active(&self, class: CapabilityClass) {
        let mut inner = self.inner.lock();
        inner.classes[class.index()].added += 1;
        inner.total_added += 1;
    }

    /// Records a request for `class` starting to receive body data.
    pub fn note_downloading(&self, class: CapabilityClass) {
        self.inner.lock().classes[class.index()].downloading += 1;
    }

    /// Records a request for `class` detaching from the HTTP transport.
    pub fn removed_from_active(&self, class: CapabilityClass, downloaded_something: bool) {
        let mut inner = self.inner.lock();
        let ct = &mut inner.classes[class.index()];
        debug_assert!(ct.added > 0);
        ct.added = ct.added.saturating_sub(1);
        if downloaded_something {
            debug_assert!(ct.downloading > 0);
            ct.downloading = ct.downloading.saturating_sub(1);
        }
        debug_assert!(inner.total_added > 0);
        inner.total_added = inner.total_added.saturating_sub(1);
    }

    /// Number of requests currently attached to the transport.
    pub fn active_count(&self) -> u32 {
        self.inner.lock().total_added
    }

    /// Per-class attached-request count.
    pub fn active_count_for(&self, class: CapabilityClass) -> u32 {
        self.inner.lock().classes[class.index()].added
    }

    /// Pending-queue length for `class`.
    pub fn queued_len(&self, class: CapabilityClass) -> usize {
        self.inner.lock().classes[class.index()].queued.len()
    }

    /// Queued plus attached requests for `class`.
    pub fn pipelined_requests(&self, class: CapabilityClass) -> usize {
        let inner = self.inner.lock();
        let ct = &inner.classes[class.index()];
        ct.queued.len() + ct.added as usize
    }

    /// Current per-service concurrency cap.
    pub fn concurrent_limit(&self) -> u32 {
        self.inner.lock().concurrent_limit
    }

    /// True when no class has anything queued.
    pub fn is_idle(&self) -> bool {
        self.inner.lock().classes.iter().all(|c| c.queued.is_empty())
    }

    /// Takes and clears the event flags for `class`.
    pub fn take_class_flags(&self, class: CapabilityClass) -> ClassFlags {
        std::mem::take(&mut self.inner.lock().classes[class.index()].flags)
    }

    /// Adjusts the concurrency cap by `increment`, clamped to
    /// `[1, ceiling]`, propagating the effective delta to each class's
    /// pipelining cap.
    pub(crate) fn adjust_concurrent_limit(&self, increment: i32, ceiling: u32) {
        let mut inner = self.inner.lock();
        let old = inner.concurrent_limit as i64;
        let new = (old + increment as i64).clamp(1, ceiling.max(1) as i64) as u32;
        let effective = new as i64 - old;
        inner.concurrent_limit = new;
        for ct in inner.classes.iter_mut() {
            ct.max_pipelined = (ct.max_pipelined as i64 + effective).max(0) as u32;
        }
    }

    /// Drops every pending entry, updating the global count. Returns how
    /// many entries were dropped.
    pub(crate) fn clear_queues(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut cleared = 0;
        for ct in inner.classes.iter_mut() {
            cleared += ct.queued.len();
            ct.queued.clear();
        }
        if cleared > 0 {
            let mut totals = self.totals.lock();
            totals.count = totals.count.saturating_sub(cleared);
        }
        cleared
    }

    /// Tries to dispatch one pending fetch from this service; if nothing
    /// here can go out and `recursive` is false, sweeps every other
    /// registered service once. See the module docs for the visit order.
    pub fn add_queued_to(&self, multi: &mut dyn Dispatch, recursive: bool, registry: &ServiceRegistry) {
        enum Sweep {
            Dispatched,
            AllIdle,
            Blocked,
        }

        let outcome = {
            let mut inner = self.inner.lock();

            let mut order = [0usize; CapabilityClass::COUNT];
            let s0 = inner.classes[0].queued.len();
            let s1 = inner.classes[1].queued.len();
            if s0 == s1 {
                order[0] = inner.approved_first;
                inner.approved_first = 1 - inner.approved_first;
                order[1] = inner.approved_first;
            } else if s0 > s1 {
                order[0] = 0;
                order[1] = 1;
            } else {
                order[0] = 1;
                order[1] = 0;
            }
            let unapproved = CapabilityClass::COUNT - CapabilityClass::APPROVED;
            let mut n = inner.unapproved_first;
            for slot in order.iter_mut().skip(CapabilityClass::APPROVED) {
                *slot = CapabilityClass::APPROVED + n;
                n = (n + 1) % unapproved;
            }
            inner.unapproved_first = (inner.unapproved_first + 1) % unapproved;

            let throttled = inner.total_added >= inner.concurrent_limit;
            let mut outcome = Sweep::Blocked;
            for (i, &ci) in order.iter().enumerate() {
                let front = inner.classes[ci].queued.front().copied();
                match front {
                    Some(request) => {
                        if throttled || !multi.add(&request) {
                            // Whatever throttled this request throttles
                            // every class of this service.
                            break;
                        }
                        let ct = &mut inner.classes[ci];
                        ct.queued.pop_front();
                        if ct.queued.is_empty() {
                            ct.flags.empty = true;
                        } else {
                            ct.flags.full = true;
                        }
                        let mut totals = self.totals.lock();
                        debug_assert!(totals.count > 0);
                        totals.count = totals.count.saturating_sub(1);
                        if totals.count == 0 {
                            totals.empty = true;
                        } else {
                            totals.full = true;
                        }
                        trace!(service = %self.name, id = %request.id, "fetch dispatched");
                        outcome = Sweep::Dispatched;
                        break;
                    }
                    None => {
                        inner.classes[ci].flags.starvation = true;
                        if i == CapabilityClass::COUNT - 1 {
                            let mut totals = self.totals.lock();
                            if totals.count == 0 {
                                totals.starvation = true;
                                outcome = Sweep::AllIdle;
                            }
                        }
                    }
                }
            }
            outcome
        };

        match outcome {
            Sweep::Dispatched | Sweep::AllIdle => {}
            Sweep::Blocked => {
                if !recursive {
                    // This service may be blocked on its own cap alone;
                    // give every other service a chance.
                    registry.for_each_other(&self.name, |peer| {
                        peer.add_queued_to(multi, true, registry);
                    });
                }
            }
        }
    }
}
