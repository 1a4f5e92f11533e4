//! Process-wide fetch dispatcher.
//!
//! The engine owns the worker map and everything the workers share: the
//! work-priority ready queue, the UDP network and cancel queues, the
//! HTTP active set and byte counter, the per-service scheduler and the
//! host blacklist. Collaborators (codec, cache, HTTP, UDP, region
//! directory) are generic parameters so tests can substitute mocks.
//!
//! # Execution model
//!
//! [`FetchEngine::tick`] advances ready workers in priority order and
//! runs the periodic UDP request sweep. Worker I/O is spawned as tasks;
//! each completion locks the worker, applies itself, and re-advances the
//! worker immediately, so a fetch chain keeps moving between ticks.
//! `FetchEngine` is a cheap handle (`Clone`) around shared state.

use crate::asset::{AssetId, CACHE_ENTRY_SIZE, MAX_ASSET_DATA_SIZE, MAX_DISCARD_LEVEL};
use crate::cache::BlobCache;
use crate::codec::{clamp_discard, Codec, CodecKind, RawImage};
use crate::config::FetchConfig;
use crate::fetch::error::FetchError;
use crate::fetch::priority::PRIORITY_IMMEDIATE;
use crate::fetch::state::{FetchState, SentRequest};
use crate::fetch::worker::{
    AdvanceCtx, FetchWorker, IoAction, ReadSource, StepAction, WorkerEvent,
};
use crate::http::{HostBlacklist, HttpError, HttpTransport};
use crate::metrics::MetricsSink;
use crate::region::RegionDirectory;
use crate::scheduler::{
    CapabilityClass, Dispatch, PerServiceQueue, QueuedFetch, ServiceRegistry,
};
use crate::udp::{
    AgentSession, AssetRequest, SimTransport, FIRST_PACKET_SIZE, IMAGES_PER_REQUEST,
    MAX_IMG_PACKET_SIZE,
};
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Parameters for [`FetchEngine::create_request`].
#[derive(Debug, Clone)]
pub struct RequestParams {
    /// Asset to fetch.
    pub id: AssetId,
    /// Explicit URL (`http://` or `file://`); `None` means the region
    /// directory supplies one, with UDP as fallback.
    pub url: Option<String>,
    /// Simulator host the asset lives on, when known.
    pub host: Option<SocketAddr>,
    /// Scheduler fairness bucket.
    pub class: CapabilityClass,
    /// Initial image priority.
    pub priority: f32,
    /// Known image width, or 0.
    pub width: u32,
    /// Known image height, or 0.
    pub height: u32,
    /// Known component count, or 0.
    pub components: u8,
    /// Desired discard level.
    pub desired_discard: u8,
    /// Whether the auxiliary channel is wanted.
    pub needs_aux: bool,
    /// Whether HTTP may be used for this asset.
    pub can_use_http: bool,
}

/// Result of [`FetchEngine::poll_finished`].
#[derive(Debug, Clone)]
pub enum FetchPoll {
    /// Decoded pixels are available.
    Ready {
        /// Discard level of the decoded image.
        discard: u8,
        /// The image.
        raw: Arc<RawImage>,
        /// Auxiliary channel, when requested and present.
        aux: Option<Arc<RawImage>>,
        /// False when the worker is still writing back to cache and may
        /// produce finer data later.
        complete: bool,
    },
    /// Still working.
    NotReady,
    /// Terminally failed or unknown; a fresh `create_request` is needed.
    Aborted,
}

/// Introspection snapshot of one fetch.
#[derive(Debug, Clone)]
pub struct FetchStatus {
    /// Current state.
    pub state: FetchState,
    /// Fraction of the asset received, when the total is known.
    pub data_progress: f32,
    /// Current image priority.
    pub image_priority: f32,
    /// Priority last sent to the UDP service.
    pub requested_priority: f32,
    /// Integer work priority.
    pub work_priority: u32,
    /// Time since the worker last advanced.
    pub fetch_age: Duration,
    /// Time since the last network request went out.
    pub request_age: Duration,
    /// Whether HTTP is still permitted for this asset.
    pub can_use_http: bool,
    /// Most recent failure, if any.
    pub last_error: Option<FetchError>,
}

struct WorkerSlot {
    worker: Mutex<FetchWorker>,
    /// Bumped on every wake; stale ready-queue entries are skipped.
    epoch: AtomicU64,
    /// Mirror of the worker's work priority, readable without the lock.
    work_priority: AtomicU32,
    /// Per-service queue the worker is currently attached to.
    service: Mutex<Option<Arc<PerServiceQueue>>>,
}

#[derive(Debug, PartialEq, Eq)]
struct ReadyEntry {
    priority: u32,
    seq: u64,
    epoch: u64,
    id: AssetId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap on priority; earlier wakes first on ties.
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct BandwidthMeter {
    last: Instant,
    kbps: f32,
}

struct Inner<C, B, H, U, R> {
    codec: Arc<C>,
    cache: Arc<B>,
    http: Arc<H>,
    sim: Arc<U>,
    regions: Arc<R>,
    metrics: Arc<dyn MetricsSink>,
    config: FetchConfig,
    session: AgentSession,

    registry: ServiceRegistry,
    blacklist: HostBlacklist,
    static_blacklist: Mutex<HashSet<AssetId>>,

    workers: DashMap<AssetId, Arc<WorkerSlot>>,
    ready: Mutex<BinaryHeap<ReadyEntry>>,
    seq: AtomicU64,

    network_queue: Mutex<HashSet<AssetId>>,
    cancel_queue: Mutex<HashMap<SocketAddr, HashSet<AssetId>>>,

    http_active: Mutex<HashSet<AssetId>>,
    total_http_requests: AtomicU32,
    http_bits: AtomicU64,
    bandwidth: Mutex<BandwidthMeter>,

    last_sweep: Mutex<Option<Instant>>,
    sim_enabled: AtomicBool,
    doomed: Mutex<Vec<Arc<WorkerSlot>>>,
    shutdown: CancellationToken,
}

/// The fetch pipeline's public surface. Cheap to clone.
pub struct FetchEngine<C, B, H, U, R> {
    inner: Arc<Inner<C, B, H, U, R>>,
}

impl<C, B, H, U, R> Clone for FetchEngine<C, B, H, U, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C, B, H, U, R> FetchEngine<C, B, H, U, R>
where
    C: Codec,
    B: BlobCache,
    H: HttpTransport,
    U: SimTransport,
    R: RegionDirectory,
{
    /// Creates an engine over the given collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        codec: Arc<C>,
        cache: Arc<B>,
        http: Arc<H>,
        sim: Arc<U>,
        regions: Arc<R>,
        metrics: Arc<dyn MetricsSink>,
        config: FetchConfig,
        session: AgentSession,
    ) -> Self {
        let registry = ServiceRegistry::new(config.connections_per_service);
        Self {
            inner: Arc::new(Inner {
                codec,
                cache,
                http,
                sim,
                regions,
                metrics,
                config,
                session,
                registry,
                blacklist: HostBlacklist::new(),
                static_blacklist: Mutex::new(HashSet::new()),
                workers: DashMap::new(),
                ready: Mutex::new(BinaryHeap::new()),
                seq: AtomicU64::new(0),
                network_queue: Mutex::new(HashSet::new()),
                cancel_queue: Mutex::new(HashMap::new()),
                http_active: Mutex::new(HashSet::new()),
                total_http_requests: AtomicU32::new(0),
                http_bits: AtomicU64::new(0),
                bandwidth: Mutex::new(BandwidthMeter {
                    last: Instant::now(),
                    kbps: 0.0,
                }),
                last_sweep: Mutex::new(None),
                sim_enabled: AtomicBool::new(false),
                doomed: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &FetchConfig {
        &self.inner.config
    }

    /// The per-service scheduler registry.
    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    /// The HTTP service deny list.
    pub fn blacklist(&self) -> &HostBlacklist {
        &self.inner.blacklist
    }

    /// Marks an asset as never fetchable.
    pub fn add_static_blacklist(&self, id: AssetId) {
        self.inner.static_blacklist.lock().insert(id);
    }

    /// Enables or disables UDP request sweeps (off until the session
    /// handshake has completed).
    pub fn set_sim_enabled(&self, enabled: bool) {
        self.inner.sim_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Token cancelled on [`Self::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Requests shutdown: drops all requests and wakes waiters.
    pub fn shutdown(&self) {
        self.delete_all_requests();
        self.inner.registry.purge();
        self.inner.shutdown.cancel();
    }

    // ----- request lifecycle -------------------------------------------

    /// Creates a fetch request, or refreshes the existing one for `id`.
    ///
    /// Returns false when the request conflicts with an existing worker
    /// for the same asset on a different host (the stale worker is
    /// removed; the caller may retry).
    pub fn create_request(&self, params: RequestParams) -> bool {
        if let Some(slot) = self.slot(params.id) {
            let host_mismatch = {
                let w = slot.worker.lock();
                w.host != params.host
            };
            if host_mismatch {
                warn!(id = %params.id, "request names a different host; dropping worker");
                self.delete_request(params.id, true);
                return false;
            }
            let (discard, size) = self.desired_for(&params);
            {
                let mut w = slot.worker.lock();
                w.needs_aux = params.needs_aux;
                w.can_use_http = params.can_use_http;
                w.set_image_priority(params.priority, self.inner.config.max_image_priority);
                w.set_desired(discard, size);
                if w.finished {
                    w.state = FetchState::Init;
                    w.finished = false;
                }
                slot.work_priority.store(w.work_priority, Ordering::Relaxed);
            }
            self.wake(params.id, true);
            return true;
        }

        let (discard, size) = self.desired_for(&params);
        let mut worker = FetchWorker::new(
            params.id,
            params.url.clone(),
            params.host,
            params.class,
            params.priority,
            discard,
            size,
            self.inner.config.max_image_priority,
        );
        worker.needs_aux = params.needs_aux;
        worker.can_use_http = params.can_use_http;
        let work_priority = worker.work_priority;
        let slot = Arc::new(WorkerSlot {
            worker: Mutex::new(worker),
            epoch: AtomicU64::new(0),
            work_priority: AtomicU32::new(work_priority),
            service: Mutex::new(None),
        });
        self.inner.workers.insert(params.id, slot);
        debug!(id = %params.id, discard, size, "fetch request created");
        self.wake(params.id, true);
        true
    }

    /// Computes the byte budget for a request, and the effective discard.
    fn desired_for(&self, params: &RequestParams) -> (u8, usize) {
        let mut discard = clamp_discard(params.desired_discard);
        let url_codec = params.url.as_deref().and_then(CodecKind::from_url);
        let size = if url_codec.is_some_and(|k| !k.is_progressive()) {
            // Partial requests only make sense for progressive streams.
            discard = 0;
            MAX_ASSET_DATA_SIZE
        } else if discard == 0 {
            MAX_ASSET_DATA_SIZE
        } else if params.width as usize * params.height as usize * params.components as usize > 0 {
            self.inner
                .codec
                .encoded_size(params.width, params.height, params.components, discard)
        } else {
            discard = MAX_DISCARD_LEVEL;
            CACHE_ENTRY_SIZE
        };
        (discard, size)
    }

    /// Updates an asset's priority. Returns false for unknown assets.
    pub fn update_priority(&self, id: AssetId, priority: f32) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let resort = {
            let mut w = slot.worker.lock();
            let changed = w.set_image_priority(priority, self.inner.config.max_image_priority);
            slot.work_priority.store(w.work_priority, Ordering::Relaxed);
            changed
        };
        if resort {
            self.wake(id, false);
        }
        true
    }

    /// Updates the desired discard and byte budget for an asset.
    pub fn update_desired(&self, id: AssetId, discard: u8, size: usize) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let wake = {
            let mut w = slot.worker.lock();
            w.set_desired(clamp_discard(discard), size)
        };
        if wake {
            self.wake(id, true);
        }
        true
    }

    /// Removes the request for `id`. With `cancel`, a UDP cancel is sent
    /// if the asset had been requested from a simulator. The worker is
    /// destroyed once its outstanding I/O handles drain.
    pub fn delete_request(&self, id: AssetId, cancel: bool) {
        let Some((_, slot)) = self.inner.workers.remove(&id) else {
            return;
        };
        let (host, class) = {
            let mut w = slot.worker.lock();
            w.deletion_requested = true;
            (w.host, w.class)
        };
        self.remove_from_network_queue(id, host, cancel);
        let service = slot.service.lock().take();
        if let Some(service) = service {
            service.cancel(&QueuedFetch { id, class });
            self.inner.registry.release(service);
        }
        debug!(id = %id, cancel, "fetch request deleted");
        self.inner.doomed.lock().push(slot);
    }

    /// Removes every request.
    pub fn delete_all_requests(&self) {
        let ids: Vec<AssetId> = self.inner.workers.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.delete_request(id, true);
        }
    }

    /// Polls for the decoded result of `id`.
    pub fn poll_finished(&self, id: AssetId) -> FetchPoll {
        let Some(slot) = self.slot(id) else {
            return FetchPoll::Aborted;
        };
        let w = slot.worker.lock();
        if w.finished {
            return match (&w.raw, w.decoded_discard) {
                (Some(raw), Some(discard)) => FetchPoll::Ready {
                    discard,
                    raw: Arc::clone(raw),
                    aux: w.aux.clone(),
                    complete: true,
                },
                _ => FetchPoll::Aborted,
            };
        }
        // Data decoded but the write-back is still in flight: hand the
        // pixels out early.
        if w.state >= FetchState::WaitOnWrite {
            if let (Some(raw), Some(discard)) = (&w.raw, w.decoded_discard) {
                return FetchPoll::Ready {
                    discard,
                    raw: Arc::clone(raw),
                    aux: w.aux.clone(),
                    complete: false,
                };
            }
        }
        FetchPoll::NotReady
    }

    // ----- introspection -----------------------------------------------

    /// Snapshot of a fetch's progress, for debug surfaces.
    pub fn fetch_state(&self, id: AssetId) -> Option<FetchStatus> {
        let slot = self.slot(id)?;
        let w = slot.worker.lock();
        let data_progress = if w.state == FetchState::LoadFromSim {
            match (w.file_size, w.assembler.last_packet()) {
                (Some(total), Some(last)) if total > 0 => {
                    // The header alone counts for nothing; progress starts
                    // with the first body packet.
                    let bytes = (FIRST_PACKET_SIZE as i64
                        + (last as i64 - 1) * MAX_IMG_PACKET_SIZE as i64)
                        .max(0) as usize;
                    (bytes as f32 / total as f32).min(1.0)
                }
                _ => 0.0,
            }
        } else {
            w.data_progress()
        };
        Some(FetchStatus {
            state: w.state,
            data_progress,
            image_priority: w.image_priority,
            requested_priority: w.requested_priority,
            work_priority: w.work_priority,
            fetch_age: w.fetch_timer.elapsed(),
            request_age: w.request_timer.elapsed(),
            can_use_http: w.can_use_http,
            last_error: w.last_error,
        })
    }

    /// True when the asset was served by a local, read-only store.
    pub fn is_from_local_cache(&self, id: AssetId) -> bool {
        self.slot(id)
            .map(|slot| slot.worker.lock().in_local_cache)
            .unwrap_or(false)
    }

    /// Number of live fetch requests.
    pub fn request_count(&self) -> usize {
        self.inner.workers.len()
    }

    /// HTTP requests currently in flight.
    pub fn http_request_count(&self) -> usize {
        self.inner.http_active.lock().len()
    }

    /// HTTP requests issued over the engine's lifetime.
    pub fn total_http_requests(&self) -> u32 {
        self.inner.total_http_requests.load(Ordering::Relaxed)
    }

    /// Current HTTP bandwidth estimate, kbit/s.
    pub fn bandwidth_kbps(&self) -> f32 {
        self.inner.bandwidth.lock().kbps
    }

    // ----- inbound UDP -------------------------------------------------

    /// Accepts an inbound image header packet. Returns false (and
    /// schedules a cancel toward `host`) when the packet is rejected.
    pub fn receive_image_header(
        &self,
        host: SocketAddr,
        id: AssetId,
        codec_tag: u8,
        total_packets: u16,
        total_bytes: u32,
        payload: Bytes,
    ) -> bool {
        let slot = self.slot(id);
        let acceptable = slot.as_ref().is_some_and(|slot| {
            let w = slot.worker.lock();
            w.state == FetchState::LoadFromNetwork
                && w.sent_request == SentRequest::SentSim
                && !w.assembler.has_header()
        }) && !payload.is_empty()
            && total_bytes > 0
            && (payload.len() == FIRST_PACKET_SIZE || payload.len() == total_bytes as usize);

        if !acceptable {
            self.inner.metrics.packet(true);
            self.queue_cancel(host, id);
            return false;
        }
        let slot = slot.expect("checked above");
        let result = {
            let mut w = slot.worker.lock();
            w.codec_kind = CodecKind::from_tag(codec_tag).or(Some(CodecKind::J2c));
            w.file_size = Some(total_bytes as usize);
            w.request_timer = Instant::now();
            let result = w.assembler.insert_header(total_packets, payload);
            if result.is_ok() {
                w.state = FetchState::LoadFromSim;
            }
            result
        };
        self.inner.metrics.packet(result.is_err());
        match result {
            Ok(()) => {
                self.wake(id, true);
                true
            }
            Err(error) => {
                warn!(id = %id, %error, "rejected image header");
                self.queue_cancel(host, id);
                false
            }
        }
    }

    /// Accepts an inbound image data packet. Returns false (and
    /// schedules a cancel toward `host`) when the packet is rejected.
    pub fn receive_image_packet(
        &self,
        host: SocketAddr,
        id: AssetId,
        packet_num: u16,
        payload: Bytes,
    ) -> bool {
        let Some(slot) = self.slot(id) else {
            self.inner.metrics.packet(true);
            self.queue_cancel(host, id);
            return false;
        };
        let (result, state_ok, worker_host) = {
            let mut w = slot.worker.lock();
            if !w.assembler.has_header() || payload.is_empty() {
                (Err(()), false, w.host)
            } else {
                let result = w
                    .assembler
                    .insert(packet_num as usize, payload)
                    .map_err(|error| {
                        warn!(id = %id, %error, "rejected image packet");
                    });
                w.request_timer = Instant::now();
                let state_ok = matches!(
                    w.state,
                    FetchState::LoadFromSim | FetchState::LoadFromNetwork
                );
                if result.is_ok() && state_ok {
                    w.state = FetchState::LoadFromSim;
                }
                (result, state_ok, w.host)
            }
        };

        self.inner.metrics.packet(result.is_err());
        if result.is_err() {
            self.queue_cancel(host, id);
            return false;
        }
        if state_ok {
            self.wake(id, true);
        } else {
            // Data for a worker that moved on; stop the flow.
            self.remove_from_network_queue(id, worker_host, true);
        }
        true
    }

    // ----- the tick ----------------------------------------------------

    /// One scheduling pass: drain byte counters, run the UDP sweep,
    /// advance ready workers, reap deleted ones.
    pub async fn tick(&self) {
        let bits = self.inner.http_bits.swap(0, Ordering::Relaxed);
        if bits > 0 {
            self.inner.metrics.asset_bytes(bits / 8);
        }
        self.update_bandwidth(bits);

        if self.inner.sim_enabled.load(Ordering::Relaxed) {
            self.send_request_batches().await;
        }

        let batch: Vec<AssetId> = {
            let mut ready = self.inner.ready.lock();
            let mut batch = Vec::with_capacity(ready.len());
            while let Some(entry) = ready.pop() {
                if let Some(slot) = self.slot(entry.id) {
                    if slot.epoch.load(Ordering::Relaxed) == entry.epoch {
                        batch.push(entry.id);
                    }
                }
            }
            batch
        };
        for id in batch {
            if let Some(slot) = self.slot(id) {
                self.step_worker(&slot, id);
            }
        }

        self.reap();
    }

    fn update_bandwidth(&self, bits: u64) {
        let mut meter = self.inner.bandwidth.lock();
        let elapsed = meter.last.elapsed().as_secs_f32();
        if elapsed < 0.001 {
            return;
        }
        let instant_kbps = bits as f32 / 1000.0 / elapsed;
        meter.kbps = meter.kbps * 0.5 + instant_kbps * 0.5;
        meter.last = Instant::now();
    }

    fn reap(&self) {
        self.inner
            .doomed
            .lock()
            .retain(|slot| !slot.worker.lock().delete_ok());
    }

    /// Builds and sends UDP request and cancel batches, at most once per
    /// sweep interval.
    async fn send_request_batches(&self) {
        {
            let mut last = self.inner.last_sweep.lock();
            if last.is_some_and(|t| t.elapsed() < self.inner.config.sweep_interval) {
                return;
            }
            *last = Some(Instant::now());
        }

        let queued: Vec<AssetId> = self.inner.network_queue.lock().iter().copied().collect();
        let mut planned: HashMap<SocketAddr, Vec<AssetRequest>> = HashMap::new();
        for id in queued {
            let Some(slot) = self.slot(id) else {
                // Removed in a race with queue insertion.
                self.inner.network_queue.lock().remove(&id);
                continue;
            };
            let mut corrupt_cache = false;
            {
                let mut w = slot.worker.lock();
                if !matches!(
                    w.state,
                    FetchState::LoadFromNetwork | FetchState::LoadFromSim
                ) {
                    warn!(id = %id, state = %w.state, "worker queued for UDP in wrong state");
                    self.inner.network_queue.lock().remove(&id);
                    continue;
                }
                if w.sent_request == SentRequest::SentSim && w.assembler.have_all() {
                    // Everything already arrived; nothing to re-request.
                    continue;
                }
                let elapsed = w.request_timer.elapsed();
                let delta_priority = (w.requested_priority - w.image_priority).abs();
                let resend = w.sim_requested_discard != Some(w.desired_discard)
                    || (delta_priority > self.inner.config.min_delta_priority
                        && elapsed >= self.inner.config.min_request_time)
                    || elapsed >= self.inner.config.lazy_flush_timeout;
                if !resend {
                    continue;
                }
                let Some(host) = w.host.or_else(|| self.inner.regions.default_host()) else {
                    continue;
                };

                if w.sent_request != SentRequest::SentSim {
                    // Resume after whatever the cache already held.
                    use crate::udp::SeedOutcome;
                    let cached_len = w.formatted.len();
                    let file_size = w.file_size;
                    match w.assembler.seed_from_cached(cached_len, file_size) {
                        SeedOutcome::Seeded => {}
                        SeedOutcome::CorruptCache => {
                            warn!(id = %id, bytes = w.formatted.len(), "cached prefix off packet boundary, dropping entry");
                            corrupt_cache = true;
                            w.formatted.clear();
                            w.have_all = false;
                            w.assembler.clear();
                        }
                        SeedOutcome::UnknownTotal => {
                            w.formatted.clear();
                            w.have_all = false;
                            w.assembler.clear();
                        }
                    }
                }

                planned.entry(host).or_default().push(AssetRequest {
                    id,
                    discard: w.desired_discard as i8,
                    priority: w.image_priority,
                    next_packet: w.assembler.next_packet(),
                    kind: w.asset_type,
                });
                w.sent_request = SentRequest::SentSim;
                w.sim_requested_discard = Some(w.desired_discard);
                w.requested_priority = w.image_priority;
                w.request_timer = Instant::now();
            }
            if corrupt_cache {
                let cache = Arc::clone(&self.inner.cache);
                tokio::spawn(async move {
                    cache.remove(id).await;
                });
            }
        }

        let sim = &self.inner.sim;
        let session = &self.inner.session;
        join_all(planned.into_iter().map(|(host, mut requests)| async move {
            requests.sort_by(|a, b| b.priority.total_cmp(&a.priority));
            for chunk in requests.chunks(IMAGES_PER_REQUEST) {
                sim.send_request_batch(host, session, chunk).await;
            }
        }))
        .await;

        let cancels: Vec<(SocketAddr, Vec<AssetId>)> = {
            let mut queue = self.inner.cancel_queue.lock();
            queue
                .drain()
                .map(|(host, ids)| (host, ids.into_iter().collect()))
                .collect()
        };
        join_all(cancels.into_iter().map(|(host, ids)| async move {
            for chunk in ids.chunks(IMAGES_PER_REQUEST) {
                sim.send_cancel_batch(host, session, chunk).await;
            }
        }))
        .await;
    }

    // ----- worker advancement ------------------------------------------

    fn slot(&self, id: AssetId) -> Option<Arc<WorkerSlot>> {
        self.inner.workers.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// Pushes a (re)wake for `id` into the ready queue. Stale entries for
    /// earlier wakes are invalidated by the epoch bump, so a worker is
    /// never runnable twice.
    fn wake(&self, id: AssetId, immediate: bool) {
        let Some(slot) = self.slot(id) else {
            return;
        };
        let epoch = slot.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let mut priority = slot.work_priority.load(Ordering::Relaxed);
        if immediate {
            priority |= PRIORITY_IMMEDIATE;
        }
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        self.inner.ready.lock().push(ReadyEntry {
            priority,
            seq,
            epoch,
            id,
        });
    }

    /// Advances one worker until it suspends, performing any I/O it
    /// submits.
    fn step_worker(&self, slot: &Arc<WorkerSlot>, id: AssetId) {
        loop {
            let (url, host, state) = {
                let w = slot.worker.lock();
                (w.url.clone(), w.host, w.state)
            };

            let candidate_url = if url.is_none() && state <= FetchState::LoadFromNetwork {
                self.inner
                    .regions
                    .asset_url_for(host)
                    .map(|base| format!("{}/?asset_id={}", base, id))
            } else {
                None
            };
            let check_url = url.as_deref().or(candidate_url.as_deref());
            let url_blacklisted = check_url
                .map(|u| self.inner.blacklist.is_blacklisted(u))
                .unwrap_or(false);
            let service_throttled = if state <= FetchState::SendHttp {
                check_url
                    .map(|u| {
                        let service = self.inner.registry.instance_for_url(u);
                        let throttled = service.throttled();
                        self.inner.registry.release(service);
                        throttled
                    })
                    .unwrap_or(false)
            } else {
                false
            };

            let ctx = AdvanceCtx {
                cfg: &self.inner.config,
                http_active: self.inner.http_active.lock().len(),
                bandwidth_kbps: self.bandwidth_kbps(),
                service_throttled,
                candidate_url,
                url_blacklisted,
                asset_blacklisted: self.inner.static_blacklist.lock().contains(&id),
            };

            let (action, events) = {
                let mut w = slot.worker.lock();
                let action = w.advance(&ctx);
                slot.work_priority.store(w.work_priority, Ordering::Relaxed);
                (action, w.take_events())
            };
            self.apply_events(id, host, events);

            match action {
                StepAction::Yield | StepAction::Finished => return,
                StepAction::QueueUdp => {
                    self.add_to_network_queue(id);
                    return;
                }
                StepAction::QueueHttp(class) => {
                    self.enqueue_http(slot, id, class);
                    return;
                }
                StepAction::Submit(IoAction::CacheRemove) => {
                    let cache = Arc::clone(&self.inner.cache);
                    tokio::spawn(async move {
                        cache.remove(id).await;
                    });
                    // The worker already restarted; keep advancing.
                }
                StepAction::Submit(io) => {
                    self.spawn_io(slot, id, io);
                    return;
                }
            }
        }
    }

    fn apply_events(&self, id: AssetId, host: Option<SocketAddr>, events: Vec<WorkerEvent>) {
        for event in events {
            match event {
                WorkerEvent::CacheProbe { hit } => self.inner.metrics.cache_probe(hit),
                WorkerEvent::LeftNetworkQueue => {
                    self.remove_from_network_queue(id, host, false);
                }
                WorkerEvent::BlacklistService { url } => {
                    self.inner
                        .blacklist
                        .add(&url, self.inner.config.blacklist_timeout, 499);
                }
                WorkerEvent::PrioritizeWrite => self.inner.cache.prioritize_write(id),
            }
        }
    }

    fn add_to_network_queue(&self, id: AssetId) {
        if self.inner.workers.contains_key(&id) {
            self.inner.network_queue.lock().insert(id);
        }
        // An enqueue supersedes any pending cancel for the asset.
        let mut cancels = self.inner.cancel_queue.lock();
        for ids in cancels.values_mut() {
            ids.remove(&id);
        }
    }

    fn remove_from_network_queue(&self, id: AssetId, host: Option<SocketAddr>, cancel: bool) {
        let erased = self.inner.network_queue.lock().remove(&id);
        if cancel && erased {
            if let Some(host) = host.or_else(|| self.inner.regions.default_host()) {
                self.queue_cancel(host, id);
            }
        }
    }

    fn queue_cancel(&self, host: SocketAddr, id: AssetId) {
        self.inner
            .cancel_queue
            .lock()
            .entry(host)
            .or_default()
            .insert(id);
    }

    /// Parks a worker in its service's pending queue until the scheduler
    /// dispatches it.
    fn enqueue_http(&self, slot: &Arc<WorkerSlot>, id: AssetId, class: CapabilityClass) {
        let url = {
            let w = slot.worker.lock();
            if w.http_queued {
                return;
            }
            match &w.url {
                Some(url) => url.clone(),
                None => return,
            }
        };
        let service = self.inner.registry.instance_for_url(&url);
        service.enqueue(QueuedFetch { id, class });
        slot.worker.lock().http_queued = true;
        let previous = slot.service.lock().replace(service);
        if let Some(previous) = previous {
            self.inner.registry.release(previous);
        }
    }

    fn spawn_io(&self, slot: &Arc<WorkerSlot>, id: AssetId, io: IoAction) {
        let engine = self.clone();
        let slot = Arc::clone(slot);
        match io {
            IoAction::CacheRead {
                source,
                offset,
                size,
            } => {
                tokio::spawn(async move {
                    let started = Instant::now();
                    let result = match source {
                        ReadSource::Cache(id) => engine.inner.cache.read(id, offset, size).await,
                        ReadSource::LocalFile(path) => {
                            engine.inner.cache.read_local(&path, offset, size).await
                        }
                    };
                    engine.inner.metrics.cache_read_latency(started.elapsed());
                    let hit = match result {
                        Ok(hit) => hit,
                        Err(error) => {
                            warn!(id = %id, %error, "cache read failed");
                            None
                        }
                    };
                    slot.worker.lock().complete_cache_read(hit);
                    engine.step_worker(&slot, id);
                });
            }

            IoAction::HttpGet { url, offset, size } => {
                self.inner.http_active.lock().insert(id);
                self.inner
                    .total_http_requests
                    .fetch_add(1, Ordering::Relaxed);
                let class = slot.worker.lock().class;
                let service = self.inner.registry.instance_for_url(&url);
                service.added_to_active(class);
                let previous = slot.service.lock().replace(service);
                if let Some(previous) = previous {
                    self.inner.registry.release(previous);
                }

                tokio::spawn(async move {
                    let range = (offset > 0 || size > 0).then_some(crate::http::ByteRange {
                        offset,
                        length: size,
                    });
                    let result = engine
                        .inner
                        .http
                        .get(&url, range, &[("Accept", "image/x-j2c")])
                        .await;
                    let received = {
                        let mut w = slot.worker.lock();
                        match result {
                            Ok(response) => {
                                let success = response.is_success();
                                w.complete_http(
                                    success,
                                    response.status,
                                    &response.reason,
                                    response.body,
                                )
                            }
                            Err(error) => {
                                // No response at all maps onto the
                                // unreachable-service status.
                                let status = match error {
                                    HttpError::Connect(_) | HttpError::Timeout => 499,
                                    HttpError::Body(_) | HttpError::InvalidUrl(_) => 0,
                                };
                                w.complete_http(false, status, &error.to_string(), Bytes::new())
                            }
                        }
                    };
                    engine.finish_http(&slot, id, received);
                    engine.step_worker(&slot, id);
                });
            }

            IoAction::Decode {
                data,
                kind,
                discard,
                need_aux,
                token,
            } => {
                tokio::spawn(async move {
                    let result = engine.inner.codec.decode(data, kind, discard, need_aux).await;
                    let image = match result {
                        Ok(image) => Some(image),
                        Err(error) => {
                            debug!(id = %id, %error, "decode failed");
                            None
                        }
                    };
                    slot.worker.lock().complete_decode(token, image);
                    engine.step_worker(&slot, id);
                });
            }

            IoAction::CacheWrite { data, file_size } => {
                tokio::spawn(async move {
                    let ok = match engine.inner.cache.write(id, data, file_size).await {
                        Ok(()) => true,
                        Err(error) => {
                            warn!(id = %id, %error, "cache write failed");
                            false
                        }
                    };
                    slot.worker.lock().complete_cache_write(ok);
                    engine.step_worker(&slot, id);
                });
            }

            IoAction::CacheRemove => unreachable!("handled in step_worker"),
        }
    }

    /// Detaches a completed HTTP request from the accounting and gives
    /// the service's queues a chance to dispatch.
    fn finish_http(&self, slot: &Arc<WorkerSlot>, id: AssetId, received: usize) {
        self.inner.http_active.lock().remove(&id);
        self.inner
            .http_bits
            .fetch_add(received as u64 * 8, Ordering::Relaxed);

        let class = slot.worker.lock().class;
        let service = slot.service.lock().take();
        if let Some(service) = service {
            if received > 0 {
                service.note_downloading(class);
            }
            service.removed_from_active(class, received > 0);
            let mut dispatch = EngineDispatch { engine: self };
            service.add_queued_to(&mut dispatch, false, &self.inner.registry);
            self.inner.registry.release(service);
        }
    }
}

/// Scheduler-facing dispatcher: applies the global admission check and
/// wakes the dispatched worker.
struct EngineDispatch<'a, C, B, H, U, R> {
    engine: &'a FetchEngine<C, B, H, U, R>,
}

impl<C, B, H, U, R> Dispatch for EngineDispatch<'_, C, B, H, U, R>
where
    C: Codec,
    B: BlobCache,
    H: HttpTransport,
    U: SimTransport,
    R: RegionDirectory,
{
    fn add(&mut self, request: &QueuedFetch) -> bool {
        let inner = &self.engine.inner;
        let active = inner.http_active.lock().len();
        let denied = active >= inner.config.http_max_requests
            || (self.engine.bandwidth_kbps() > inner.config.http_throttle_kbps
                && active > inner.config.http_min_requests);
        if denied {
            return false;
        }
        let Some(slot) = self.engine.slot(request.id) else {
            // Worker vanished while queued; accept the pop to drop it.
            return true;
        };
        {
            let mut w = slot.worker.lock();
            w.http_queued = false;
            w.http_admitted = true;
        }
        self.engine.wake(request.id, true);
        true
    }
}
