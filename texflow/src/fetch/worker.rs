//! The per-asset fetch state machine.
//!
//! A [`FetchWorker`] drives one asset from creation to decoded pixels:
//! cache lookup, network acquisition over HTTP or UDP, decode, cache
//! write-back. [`FetchWorker::advance`] runs transitions until the
//! worker either needs external I/O (returned as a [`StepAction`] for
//! the engine to perform), deliberately stalls, or terminates.
//! Completions are applied by the `complete_*` methods under the
//! engine's per-worker lock and re-queue the worker.
//!
//! The worker never performs I/O itself and never takes locks, which
//! keeps every transition unit-testable without a runtime.

use crate::asset::{AssetId, CACHE_ENTRY_SIZE};
use crate::cache::{stored_file_size, CacheHit};
use crate::codec::{CodecKind, DecodedImage, RawImage};
use crate::config::FetchConfig;
use crate::fetch::error::FetchError;
use crate::fetch::priority::{exceeds_hysteresis, work_priority};
use crate::fetch::state::{FetchState, SentRequest, WritePolicy};
use crate::scheduler::CapabilityClass;
use crate::udp::{AssetType, PacketAssembler};
use bytes::Bytes;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Priorities below this are treated as "nobody wants this anymore".
const ALMOST_ZERO: f32 = 0.0001;

/// What a worker needs from the engine after advancing.
#[derive(Debug)]
pub(crate) enum StepAction {
    /// Waiting on an outstanding completion or external event.
    Yield,
    /// Perform this I/O, apply the completion, and re-advance.
    Submit(IoAction),
    /// Place the worker in the engine's UDP network queue and stall.
    QueueUdp,
    /// HTTP admission denied: queue under the per-service scheduler.
    QueueHttp(CapabilityClass),
    /// Terminal for this pass (success or failure; see `poll` fields).
    Finished,
}

/// I/O the engine performs on the worker's behalf.
#[derive(Debug)]
pub(crate) enum IoAction {
    /// Read a byte range from the cache or a local file.
    CacheRead {
        source: ReadSource,
        offset: usize,
        size: usize,
    },
    /// Write the accumulated prefix back to the cache.
    CacheWrite { data: Bytes, file_size: usize },
    /// Drop the (corrupt) cache entry; no completion expected.
    CacheRemove,
    /// Submit bytes to the codec.
    Decode {
        data: Bytes,
        kind: CodecKind,
        discard: u8,
        need_aux: bool,
        token: u64,
    },
    /// Issue an HTTP GET for `[offset, offset + size)`.
    HttpGet {
        url: String,
        offset: usize,
        size: usize,
    },
}

/// Where a cache read should come from.
#[derive(Debug)]
pub(crate) enum ReadSource {
    Cache(AssetId),
    LocalFile(PathBuf),
}

/// Side observations the engine applies after an advance.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WorkerEvent {
    /// A cache probe concluded; `hit` when the cache sufficed.
    CacheProbe { hit: bool },
    /// The worker no longer belongs in the UDP network queue.
    LeftNetworkQueue,
    /// The service behind `url` should be blacklisted for a while.
    BlacklistService { url: String },
    /// The pending cache write blocks finer data; bump its priority.
    PrioritizeWrite,
}

/// Engine-supplied inputs for one advance pass.
#[derive(Debug)]
pub(crate) struct AdvanceCtx<'a> {
    pub cfg: &'a FetchConfig,
    /// HTTP requests currently in flight, process-wide.
    pub http_active: usize,
    /// Current HTTP bandwidth estimate, kbit/s.
    pub bandwidth_kbps: f32,
    /// Per-service concurrency cap reached for this worker's service.
    pub service_throttled: bool,
    /// Asset URL derived from the region directory, when the worker has
    /// none of its own.
    pub candidate_url: Option<String>,
    /// The worker's (or candidate) URL is on the deny list.
    pub url_blacklisted: bool,
    /// The asset id is on the static never-fetch list.
    pub asset_blacklisted: bool,
}

/// Per-asset fetch state. One per [`AssetId`], owned by the engine.
#[derive(Debug)]
pub(crate) struct FetchWorker {
    pub(crate) id: AssetId,
    pub(crate) host: Option<SocketAddr>,
    pub(crate) url: Option<String>,
    pub(crate) class: CapabilityClass,
    pub(crate) asset_type: AssetType,

    pub(crate) state: FetchState,
    pub(crate) write_policy: WritePolicy,
    pub(crate) sent_request: SentRequest,

    /// Accumulated compressed prefix; survives re-entry into `Init`.
    pub(crate) formatted: Vec<u8>,
    pub(crate) codec_kind: Option<CodecKind>,
    pub(crate) have_all: bool,
    pub(crate) file_size: Option<usize>,

    pub(crate) raw: Option<Arc<RawImage>>,
    pub(crate) aux: Option<Arc<RawImage>>,

    pub(crate) image_priority: f32,
    pub(crate) work_priority: u32,
    pub(crate) requested_priority: f32,

    pub(crate) desired_discard: u8,
    pub(crate) sim_requested_discard: Option<u8>,
    pub(crate) requested_discard: Option<u8>,
    pub(crate) loaded_discard: Option<u8>,
    pub(crate) decoded_discard: Option<u8>,

    pub(crate) desired_size: usize,
    pub(crate) requested_size: usize,
    pub(crate) requested_offset: usize,
    pub(crate) cached_size: usize,

    pub(crate) needs_aux: bool,
    pub(crate) in_local_cache: bool,
    pub(crate) can_use_http: bool,
    pub(crate) can_use_udp: bool,

    pub(crate) http_fail_count: u32,
    pub(crate) retry_attempt: u32,
    pub(crate) http_queued: bool,
    pub(crate) http_admitted: bool,
    pub(crate) http_buffer: Vec<u8>,
    pub(crate) http_failed: bool,
    pub(crate) get_status: u16,
    pub(crate) get_reason: String,

    pub(crate) assembler: PacketAssembler,

    /// Reset when a network request goes out or a packet lands.
    pub(crate) request_timer: Instant,
    /// Reset on every advance that is not terminal.
    pub(crate) fetch_timer: Instant,

    pub(crate) loaded: bool,
    pub(crate) decoded: bool,
    pub(crate) written: bool,

    pub(crate) cache_read_active: bool,
    pub(crate) cache_write_active: bool,
    pub(crate) decode_token: u64,

    pub(crate) deletion_requested: bool,
    pub(crate) finished: bool,
    pub(crate) last_error: Option<FetchError>,

    events: Vec<WorkerEvent>,
}

impl FetchWorker {
    /// Creates a worker in `Init`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: AssetId,
        url: Option<String>,
        host: Option<SocketAddr>,
        class: CapabilityClass,
        priority: f32,
        desired_discard: u8,
        desired_size: usize,
        max_image_priority: f32,
    ) -> Self {
        let can_use_udp = url.is_none();
        let asset_type = if host.is_some() {
            AssetType::Baked
        } else {
            AssetType::Normal
        };
        let now = Instant::now();
        Self {
            id,
            host,
            url,
            class,
            asset_type,
            state: FetchState::Init,
            write_policy: WritePolicy::No,
            sent_request: SentRequest::Unsent,
            formatted: Vec::new(),
            codec_kind: None,
            have_all: false,
            file_size: None,
            raw: None,
            aux: None,
            image_priority: priority,
            work_priority: work_priority(priority, max_image_priority),
            requested_priority: 0.0,
            desired_discard,
            sim_requested_discard: None,
            requested_discard: None,
            loaded_discard: None,
            decoded_discard: None,
            desired_size: desired_size.max(CACHE_ENTRY_SIZE),
            requested_size: 0,
            requested_offset: 0,
            cached_size: 0,
            needs_aux: false,
            in_local_cache: false,
            can_use_http: true,
            can_use_udp,
            http_fail_count: 0,
            retry_attempt: 0,
            http_queued: false,
            http_admitted: false,
            http_buffer: Vec::new(),
            http_failed: false,
            get_status: 0,
            get_reason: String::new(),
            assembler: PacketAssembler::new(),
            request_timer: now,
            fetch_timer: now,
            loaded: false,
            decoded: false,
            written: false,
            cache_read_active: false,
            cache_write_active: false,
            decode_token: 0,
            deletion_requested: false,
            finished: false,
            last_error: None,
            events: Vec::new(),
        }
    }

    /// Drains observations recorded during the last advance.
    pub(crate) fn take_events(&mut self) -> Vec<WorkerEvent> {
        std::mem::take(&mut self.events)
    }

    /// Local filesystem path for `file://` assets.
    pub(crate) fn local_path(&self) -> Option<PathBuf> {
        self.url
            .as_deref()
            .and_then(|u| u.strip_prefix("file://"))
            .map(PathBuf::from)
    }

    fn is_local_file(&self) -> bool {
        self.url
            .as_deref()
            .is_some_and(|u| u.starts_with("file://"))
    }

    /// Updates the image priority with hysteresis. Returns true when the
    /// change was applied (the engine re-sorts the worker).
    pub(crate) fn set_image_priority(&mut self, priority: f32, max_image_priority: f32) -> bool {
        if exceeds_hysteresis(self.image_priority, priority) || self.state == FetchState::Done {
            self.image_priority = priority;
            self.work_priority = work_priority(priority, max_image_priority);
            true
        } else {
            false
        }
    }

    /// Updates the desired discard/size. Returns true when the worker
    /// needs a wake-up (it restarted or wants prompt attention).
    pub(crate) fn set_desired(&mut self, discard: u8, size: usize) -> bool {
        let mut prioritize = false;
        let mut changed = false;
        if self.desired_discard != discard {
            if discard < self.desired_discard {
                prioritize = true;
            }
            self.desired_discard = discard;
            self.desired_size = size;
            changed = true;
        } else if size > self.desired_size {
            self.desired_size = size;
            prioritize = true;
            changed = true;
        }
        self.desired_size = self.desired_size.max(CACHE_ENTRY_SIZE);

        if (prioritize && self.state == FetchState::Init) || self.state == FetchState::Done {
            self.state = FetchState::Init;
            self.finished = false;
            return true;
        }
        changed
    }

    /// True when no outstanding I/O handle prevents destruction.
    pub(crate) fn delete_ok(&self) -> bool {
        if self.cache_read_active || self.cache_write_active {
            return false;
        }
        // A write-back in progress must land before the worker goes away.
        if !self.finished
            && self.state >= FetchState::WriteToCache
            && self.state <= FetchState::WaitOnWrite
        {
            return false;
        }
        true
    }

    /// Fraction of the asset received so far, when the total is known.
    pub(crate) fn data_progress(&self) -> f32 {
        match self.file_size {
            Some(total) if total > 0 => (self.formatted.len() as f32 / total as f32).min(1.0),
            _ => 0.0,
        }
    }

    fn fail(&mut self, error: FetchError) -> StepAction {
        debug!(id = %self.id, state = %self.state, %error, "fetch failed");
        self.last_error = Some(error);
        self.state = FetchState::Done;
        self.finished = true;
        StepAction::Finished
    }

    fn reset_formatted(&mut self) {
        self.http_buffer = Vec::new();
        self.formatted.clear();
        self.have_all = false;
    }

    /// Runs state transitions until the worker suspends or terminates.
    pub(crate) fn advance(&mut self, ctx: &AdvanceCtx<'_>) -> StepAction {
        if self.deletion_requested && self.state < FetchState::Decode {
            return self.fail(FetchError::Cancelled);
        }
        if self.image_priority < ALMOST_ZERO
            && matches!(
                self.state,
                FetchState::Init | FetchState::LoadFromNetwork | FetchState::LoadFromSim
            )
        {
            return self.fail(FetchError::Cancelled);
        }
        if self.state > FetchState::CachePost
            && self.state < FetchState::Done
            && !self.can_use_udp
            && !self.can_use_http
        {
            // Nowhere left to get data from.
            return self.fail(self.last_error.unwrap_or(FetchError::NotInCache));
        }

        if self.state != FetchState::Done {
            self.fetch_timer = Instant::now();
        }

        loop {
            match self.state {
                FetchState::Init => {
                    if ctx.asset_blacklisted {
                        return self.fail(FetchError::Cancelled);
                    }
                    self.raw = None;
                    self.aux = None;
                    self.requested_discard = None;
                    self.loaded_discard = None;
                    self.decoded_discard = None;
                    self.requested_size = 0;
                    self.requested_offset = 0;
                    self.file_size = None;
                    self.cached_size = 0;
                    self.loaded = false;
                    self.decoded = false;
                    self.written = false;
                    self.sent_request = SentRequest::Unsent;
                    self.http_buffer = Vec::new();
                    self.have_all = false;
                    self.assembler.clear();
                    self.desired_size = self.desired_size.max(CACHE_ENTRY_SIZE);
                    self.state = FetchState::LoadFromCache;
                    debug!(
                        id = %self.id,
                        priority = self.image_priority,
                        desired_discard = self.desired_discard,
                        desired_size = self.desired_size,
                        "fetch starting"
                    );
                }

                FetchState::LoadFromCache => {
                    if !self.cache_read_active && !self.loaded {
                        let offset = self.formatted.len();
                        if self.desired_size <= offset {
                            self.state = FetchState::CachePost;
                            continue;
                        }
                        let size = self.desired_size - offset;
                        self.file_size = None;

                        if let Some(path) = self.local_path() {
                            self.cache_read_active = true;
                            return StepAction::Submit(IoAction::CacheRead {
                                source: ReadSource::LocalFile(path),
                                offset,
                                size,
                            });
                        } else if self.url.is_none() {
                            self.cache_read_active = true;
                            return StepAction::Submit(IoAction::CacheRead {
                                source: ReadSource::Cache(self.id),
                                offset,
                                size,
                            });
                        } else if self.can_use_http {
                            // Remote URL: nothing of ours in the cache.
                            self.state = FetchState::SendHttp;
                            continue;
                        } else {
                            self.state = FetchState::LoadFromNetwork;
                            continue;
                        }
                    }
                    if self.loaded {
                        self.state = FetchState::CachePost;
                        continue;
                    }
                    return StepAction::Yield;
                }

                FetchState::CachePost => {
                    self.cached_size = self.formatted.len();
                    let hit = self.cached_size >= self.desired_size || self.have_all;
                    self.events.push(WorkerEvent::CacheProbe { hit });
                    if hit {
                        self.loaded_discard = Some(self.desired_discard);
                        self.write_policy = WritePolicy::No;
                        self.state = FetchState::Decode;
                        debug!(id = %self.id, bytes = self.cached_size, "cache satisfied request");
                        continue;
                    }
                    if self.is_local_file() {
                        // Local file fell short; nothing else to try.
                        return self.fail(FetchError::NotInCache);
                    }
                    self.state = FetchState::LoadFromNetwork;
                }

                FetchState::LoadFromNetwork => {
                    if ctx.cfg.use_http && self.can_use_http && self.url.is_none() {
                        match &ctx.candidate_url {
                            Some(candidate) => {
                                self.url = Some(candidate.clone());
                                // Fixed asset id behind this URL, safe to cache.
                                self.write_policy = WritePolicy::Can;
                            }
                            None => {
                                self.can_use_http = false;
                            }
                        }
                    }
                    if self.url.is_some() && ctx.url_blacklisted {
                        self.can_use_http = false;
                    }

                    if self.can_use_http && self.url.is_some() {
                        if self.write_policy != WritePolicy::No {
                            self.write_policy = WritePolicy::Can;
                        }
                        self.state = FetchState::SendHttp;
                        continue;
                    }
                    if self.sent_request == SentRequest::Unsent && self.can_use_udp {
                        self.write_policy = WritePolicy::Can;
                        self.requested_size = self.desired_size;
                        self.requested_discard = Some(self.desired_discard);
                        self.sent_request = SentRequest::Queued;
                        return StepAction::QueueUdp;
                    }
                    return StepAction::Yield;
                }

                FetchState::LoadFromSim => {
                    if self.requested_size == 0 {
                        // A packet arrived for something never requested.
                        return self.fail(FetchError::ProtocolViolation);
                    }
                    match self
                        .assembler
                        .deliverable_prefix(&self.formatted, self.requested_size)
                    {
                        Some((bytes, all)) => {
                            self.events.push(WorkerEvent::LeftNetworkQueue);
                            if bytes.is_empty() {
                                return self.fail(FetchError::ProtocolViolation);
                            }
                            if all {
                                self.have_all = true;
                            }
                            self.formatted = bytes;
                            self.loaded_discard = self.requested_discard;
                            self.write_policy = WritePolicy::Should;
                            self.state = FetchState::Decode;
                            debug!(
                                id = %self.id,
                                bytes = self.formatted.len(),
                                have_all = self.have_all,
                                "assembled packet prefix"
                            );
                            continue;
                        }
                        // Not enough contiguous data yet; stay registered.
                        None => return StepAction::QueueUdp,
                    }
                }

                FetchState::SendHttp => {
                    if !self.can_use_http {
                        return self.fail(self.last_error.unwrap_or(FetchError::NotInCache));
                    }
                    if !self.http_admitted {
                        // Keep file descriptors bounded, and keep HTTP
                        // from crowding out the UDP path once bandwidth
                        // is saturated.
                        let denied = ctx.service_throttled
                            || ctx.http_active >= ctx.cfg.http_max_requests
                            || (ctx.bandwidth_kbps > ctx.cfg.http_throttle_kbps
                                && ctx.http_active > ctx.cfg.http_min_requests);
                        if denied {
                            return StepAction::QueueHttp(self.class);
                        }
                    }
                    self.http_admitted = false;
                    self.events.push(WorkerEvent::LeftNetworkQueue);

                    let cur_size = self.formatted.len();
                    if self.have_all {
                        if cur_size > 0 {
                            self.loaded_discard =
                                self.loaded_discard.or(Some(self.desired_discard));
                            self.state = FetchState::Decode;
                            continue;
                        }
                        return self.fail(FetchError::NotInCache);
                    }

                    self.requested_size = self.desired_size.saturating_sub(cur_size);
                    self.requested_discard = Some(self.desired_discard);
                    self.requested_offset = cur_size;
                    if self.requested_offset > 0 {
                        // Keep the range partially satisfiable: some
                        // intermediate caches answer a fully out-of-range
                        // request with 200 and the entire body instead of
                        // 416. The one-byte overlap is skipped on receipt.
                        self.requested_offset -= 1;
                        self.requested_size += 1;
                    }

                    self.request_timer = Instant::now();
                    self.loaded = false;
                    self.http_failed = false;
                    self.get_status = 0;
                    self.get_reason.clear();
                    self.state = FetchState::WaitHttp;
                    let url = self.url.clone().unwrap_or_default();
                    debug!(
                        id = %self.id,
                        url = %url,
                        offset = self.requested_offset,
                        size = self.requested_size,
                        "HTTP GET"
                    );
                    return StepAction::Submit(IoAction::HttpGet {
                        url,
                        offset: self.requested_offset,
                        size: self.requested_size,
                    });
                }

                FetchState::WaitHttp => {
                    if !self.loaded {
                        if self.request_timer.elapsed() > ctx.cfg.http_timeout {
                            return self.fail(FetchError::HttpTimeout);
                        }
                        return StepAction::Yield;
                    }

                    let cur_size = self.formatted.len();
                    if self.http_failed {
                        match self.get_status {
                            404 | 499 => {
                                self.http_fail_count = 1;
                                let error = if self.get_status == 404 {
                                    warn!(id = %self.id, url = ?self.url, "asset missing from service (404)");
                                    FetchError::HttpNotFound
                                } else {
                                    warn!(id = %self.id, url = ?self.url, "no response from service (499)");
                                    if let Some(url) = &self.url {
                                        self.events.push(WorkerEvent::BlacklistService {
                                            url: url.clone(),
                                        });
                                    }
                                    FetchError::HttpUnreachable
                                };
                                self.last_error = Some(error);
                                if self.can_use_udp {
                                    // Roll back and retry over UDP.
                                    self.reset_formatted();
                                    self.can_use_http = false;
                                    self.state = FetchState::Init;
                                    continue;
                                }
                                self.reset_formatted();
                                return self.fail(error);
                            }
                            503 => {
                                self.http_fail_count += 1;
                                self.last_error = Some(FetchError::HttpBusy);
                                debug!(id = %self.id, "service busy (503), retrying");
                                self.state = FetchState::SendHttp;
                                continue;
                            }
                            status => {
                                self.http_fail_count += 1;
                                let max_attempts = ctx.cfg.max_http_retries + 1;
                                debug!(
                                    id = %self.id,
                                    status,
                                    reason = %self.get_reason,
                                    attempt = self.http_fail_count,
                                    max_attempts,
                                    "HTTP GET failed"
                                );
                                if self.http_fail_count < max_attempts {
                                    self.state = FetchState::SendHttp;
                                    continue;
                                }
                                if cur_size > 0 && self.http_fail_count < max_attempts + 1 {
                                    // Out of retries; decode what we have.
                                    self.loaded_discard =
                                        self.loaded_discard.or(Some(self.desired_discard));
                                    self.state = FetchState::Decode;
                                    continue;
                                }
                                self.last_error = Some(FetchError::HttpOther(status));
                                if self.can_use_udp {
                                    self.reset_formatted();
                                    self.can_use_http = false;
                                    self.state = FetchState::Init;
                                    continue;
                                }
                                self.reset_formatted();
                                return self.fail(FetchError::HttpOther(status));
                            }
                        }
                    }

                    if self.http_buffer.is_empty() {
                        // Success reported but nothing ever arrived.
                        return self.fail(FetchError::HttpOther(self.get_status));
                    }

                    let mut src_offset = 0usize;
                    if self.requested_offset > 0 && self.requested_offset != cur_size {
                        if self.requested_offset > cur_size {
                            warn!(
                                id = %self.id,
                                offset = self.requested_offset,
                                held = cur_size,
                                "partial response leaves a gap in asset data"
                            );
                            return self.fail(FetchError::HttpOther(self.get_status));
                        }
                        // Overlapping response; skip the bytes we hold.
                        src_offset = cur_size - self.requested_offset;
                        self.requested_size -= src_offset;
                        self.requested_offset += src_offset;
                    }
                    let total_size = cur_size + self.requested_size;

                    if self.codec_kind.is_none() {
                        self.codec_kind = self
                            .url
                            .as_deref()
                            .and_then(CodecKind::from_url)
                            .or(Some(CodecKind::J2c));
                    }
                    self.file_size = if self.have_all && self.requested_discard == Some(0) {
                        Some(total_size)
                    } else {
                        None
                    };

                    self.formatted
                        .extend_from_slice(&self.http_buffer[src_offset..]);
                    debug_assert_eq!(self.formatted.len(), total_size);
                    self.http_buffer = Vec::new();
                    self.loaded_discard = self.requested_discard;
                    if self.write_policy != WritePolicy::No {
                        self.write_policy = WritePolicy::Should;
                    }
                    self.state = FetchState::Decode;
                }

                FetchState::Decode => {
                    if self.formatted.is_empty() {
                        return self.fail(FetchError::DecodeFailed);
                    }
                    let Some(loaded_discard) = self.loaded_discard else {
                        return self.fail(FetchError::DecodeFailed);
                    };
                    self.raw = None;
                    self.aux = None;
                    self.decoded = false;
                    self.decode_token += 1;
                    let discard = if self.have_all { 0 } else { loaded_discard };
                    self.state = FetchState::WaitDecode;
                    debug!(
                        id = %self.id,
                        bytes = self.formatted.len(),
                        discard,
                        have_all = self.have_all,
                        "decoding"
                    );
                    return StepAction::Submit(IoAction::Decode {
                        data: Bytes::from(self.formatted.clone()),
                        kind: self.codec_kind.unwrap_or(CodecKind::J2c),
                        discard,
                        need_aux: self.needs_aux,
                        token: self.decode_token,
                    });
                }

                FetchState::WaitDecode => {
                    if !self.decoded {
                        return StepAction::Yield;
                    }
                    if self.decoded_discard.is_none() {
                        if self.cached_size > 0 && !self.in_local_cache && self.retry_attempt == 0 {
                            // The cached prefix is bad: drop it and refetch.
                            warn!(id = %self.id, "decode of cached data failed, removing entry");
                            self.retry_attempt += 1;
                            self.last_error = Some(FetchError::CacheCorrupt);
                            self.reset_formatted();
                            self.codec_kind = None;
                            self.state = FetchState::Init;
                            return StepAction::Submit(IoAction::CacheRemove);
                        }
                        return self.fail(FetchError::DecodeFailed);
                    }
                    self.state = FetchState::WriteToCache;
                }

                FetchState::WriteToCache => {
                    if self.write_policy != WritePolicy::Should || self.formatted.is_empty() {
                        self.state = FetchState::Done;
                        continue;
                    }
                    let len = self.formatted.len();
                    let emit = match self.file_size {
                        Some(total) if total >= len => total,
                        _ => stored_file_size(len, self.have_all),
                    };
                    self.written = false;
                    self.cache_write_active = true;
                    self.state = FetchState::WaitOnWrite;
                    return StepAction::Submit(IoAction::CacheWrite {
                        data: Bytes::from(self.formatted.clone()),
                        file_size: emit,
                    });
                }

                FetchState::WaitOnWrite => {
                    if self.written {
                        self.state = FetchState::Done;
                        continue;
                    }
                    if self
                        .decoded_discard
                        .is_some_and(|dd| self.desired_discard < dd)
                    {
                        // Finer data is already wanted; the buffer cannot
                        // be touched until this write lands.
                        self.events.push(WorkerEvent::PrioritizeWrite);
                    }
                    return StepAction::Yield;
                }

                FetchState::Done => {
                    if self
                        .decoded_discard
                        .is_some_and(|dd| self.desired_discard < dd)
                    {
                        // Finer detail was requested; go around again.
                        self.state = FetchState::Init;
                        self.finished = false;
                        continue;
                    }
                    self.finished = true;
                    return StepAction::Finished;
                }
            }
        }
    }

    /// Applies a cache read completion.
    pub(crate) fn complete_cache_read(&mut self, result: Option<CacheHit>) {
        self.cache_read_active = false;
        if self.state != FetchState::LoadFromCache {
            warn!(id = %self.id, state = %self.state, "late cache read completion");
            return;
        }
        if let Some(hit) = result {
            self.in_local_cache = hit.local;
            self.formatted.extend_from_slice(&hit.bytes);
            self.file_size = hit.file_size;
            if hit
                .file_size
                .is_some_and(|total| total > 0 && self.formatted.len() >= total)
            {
                self.have_all = true;
            }
        }
        self.loaded = true;
    }

    /// Applies an HTTP completion. Returns the body size for byte
    /// accounting; a duplicate or late completion counts zero.
    pub(crate) fn complete_http(
        &mut self,
        success: bool,
        status: u16,
        reason: &str,
        body: Bytes,
    ) -> usize {
        if self.state != FetchState::WaitHttp {
            warn!(id = %self.id, state = %self.state, "late HTTP completion");
            return 0;
        }
        if self.loaded {
            warn!(id = %self.id, "duplicate HTTP completion");
            return 0;
        }
        let mut data_size = 0;
        if success {
            data_size = body.len();
            if data_size > 0 {
                self.http_buffer = body.to_vec();
                if data_size < self.requested_size && self.requested_discard == Some(0) {
                    // Short full-asset response: that was everything.
                    self.have_all = true;
                } else if data_size > self.requested_size {
                    // Whole body instead of our range; start over with it.
                    warn!(
                        id = %self.id,
                        received = data_size,
                        requested = self.requested_size,
                        "oversized HTTP response, adopting whole body"
                    );
                    self.have_all = true;
                    self.requested_offset = 0;
                    self.formatted.clear();
                }
            } else {
                // Asked for data and got an empty success: nothing more
                // exists past what we hold.
                self.have_all = true;
            }
            self.requested_size = data_size;
            self.http_failed = false;
        } else {
            self.http_failed = true;
            self.get_status = status;
            self.get_reason = reason.to_string();
        }
        self.loaded = true;
        data_size
    }

    /// Applies a decode completion. Stale tokens are ignored.
    pub(crate) fn complete_decode(&mut self, token: u64, result: Option<DecodedImage>) {
        if token != self.decode_token {
            return;
        }
        if self.state != FetchState::WaitDecode {
            warn!(id = %self.id, state = %self.state, "late decode completion");
            return;
        }
        match result {
            Some(image) => {
                self.raw = Some(image.raw);
                self.aux = image.aux;
                self.decoded_discard = Some(image.discard);
                debug!(id = %self.id, discard = image.discard, "decode finished");
            }
            None => {
                self.decoded_discard = None;
            }
        }
        self.decoded = true;
    }

    /// Applies a cache write completion.
    pub(crate) fn complete_cache_write(&mut self, _success: bool) {
        self.cache_write_active = false;
        if self.state != FetchState::WaitOnWrite {
            warn!(id = %self.id, state = %self.state, "late cache write completion");
            return;
        }
        self.written = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_PRIORITY: f32 = 10_000_000.0;

    fn config() -> FetchConfig {
        FetchConfig::default()
    }

    fn ctx<'a>(cfg: &'a FetchConfig) -> AdvanceCtx<'a> {
        AdvanceCtx {
            cfg,
            http_active: 0,
            bandwidth_kbps: 0.0,
            service_throttled: false,
            candidate_url: None,
            url_blacklisted: false,
            asset_blacklisted: false,
        }
    }

    fn worker() -> FetchWorker {
        FetchWorker::new(
            AssetId::new(1),
            None,
            None,
            CapabilityClass::Texture,
            1000.0,
            2,
            4096,
            MAX_PRIORITY,
        )
    }

    fn hit(bytes: &[u8], file_size: Option<usize>) -> CacheHit {
        CacheHit {
            bytes: Bytes::copy_from_slice(bytes),
            file_size,
            local: false,
        }
    }

    fn decoded(discard: u8) -> DecodedImage {
        DecodedImage {
            raw: Arc::new(RawImage::new(1, 1, 3, Bytes::from_static(&[0, 0, 0]))),
            aux: None,
            discard,
        }
    }

    #[test]
    fn test_init_submits_cache_read() {
        let cfg = config();
        let mut w = worker();
        match w.advance(&ctx(&cfg)) {
            StepAction::Submit(IoAction::CacheRead {
                source: ReadSource::Cache(id),
                offset,
                size,
            }) => {
                assert_eq!(id, AssetId::new(1));
                assert_eq!(offset, 0);
                assert_eq!(size, 4096);
            }
            other => panic!("expected cache read, got {:?}", other),
        }
        assert_eq!(w.state, FetchState::LoadFromCache);
    }

    #[test]
    fn test_full_cache_hit_decodes_without_network() {
        let cfg = config();
        let mut w = worker();
        w.advance(&ctx(&cfg));
        w.complete_cache_read(Some(hit(&vec![7u8; 4096], Some(4096))));

        match w.advance(&ctx(&cfg)) {
            StepAction::Submit(IoAction::Decode { discard, .. }) => {
                // Everything arrived, so decode targets full resolution.
                assert_eq!(discard, 0);
            }
            other => panic!("expected decode, got {:?}", other),
        }
        assert!(w.have_all);
        assert_eq!(w.write_policy, WritePolicy::No);
        assert_eq!(
            w.take_events(),
            vec![WorkerEvent::CacheProbe { hit: true }]
        );

        w.complete_decode(w.decode_token, Some(decoded(0)));
        assert!(matches!(w.advance(&ctx(&cfg)), StepAction::Finished));
        assert!(w.finished);
        assert!(w.raw.is_some());
        assert_eq!(w.decoded_discard, Some(0));
    }

    #[test]
    fn test_cache_miss_without_url_queues_udp() {
        let cfg = config();
        let mut w = worker();
        w.advance(&ctx(&cfg));
        w.complete_cache_read(None);

        // No URL and no region candidate: HTTP is off, UDP is queued.
        assert!(matches!(w.advance(&ctx(&cfg)), StepAction::QueueUdp));
        assert_eq!(w.state, FetchState::LoadFromNetwork);
        assert_eq!(w.sent_request, SentRequest::Queued);
        assert!(!w.can_use_http);
        assert_eq!(w.write_policy, WritePolicy::Can);
    }

    #[test]
    fn test_partial_cache_plus_http_range_expansion() {
        let cfg = config();
        let mut w = worker();
        w.desired_size = 3980;
        w.advance(&ctx(&cfg));
        w.complete_cache_read(Some(hit(&vec![1u8; 1000], None)));

        let mut context = ctx(&cfg);
        context.candidate_url = Some("http://assets.example.com/?asset_id=1".into());
        match w.advance(&context) {
            StepAction::Submit(IoAction::HttpGet { offset, size, .. }) => {
                // 1000 held, 2980 wanted; the range widens by one byte to
                // stay partially satisfiable.
                assert_eq!(offset, 999);
                assert_eq!(size, 2981);
            }
            other => panic!("expected HTTP GET, got {:?}", other),
        }
        assert_eq!(w.state, FetchState::WaitHttp);
        assert_eq!(w.write_policy, WritePolicy::Can);
    }

    #[test]
    fn test_http_overlap_realignment() {
        let cfg = config();
        let mut w = worker();
        w.desired_size = 290;

        // Hold 90 bytes; the response covers [80, 280).
        w.formatted = vec![9u8; 90];
        w.state = FetchState::WaitHttp;
        w.requested_offset = 80;
        w.requested_size = 200;
        w.requested_discard = Some(2);
        w.write_policy = WritePolicy::Can;

        let received = w.complete_http(true, 206, "Partial Content", Bytes::from(vec![5u8; 200]));
        assert_eq!(received, 200);

        match w.advance(&ctx(&cfg)) {
            StepAction::Submit(IoAction::Decode { data, .. }) => {
                // 10 overlapping bytes skipped: 90 + 200 - 10 = 280.
                assert_eq!(data.len(), 280);
            }
            other => panic!("expected decode, got {:?}", other),
        }
        assert_eq!(w.formatted.len(), 280);
        assert_eq!(w.write_policy, WritePolicy::Should);
    }

    #[test]
    fn test_http_gap_aborts() {
        let cfg = config();
        let mut w = worker();
        w.formatted = vec![9u8; 90];
        w.state = FetchState::WaitHttp;
        w.requested_offset = 100;
        w.requested_size = 200;
        w.requested_discard = Some(2);

        w.complete_http(true, 206, "Partial Content", Bytes::from(vec![5u8; 200]));
        assert!(matches!(w.advance(&ctx(&cfg)), StepAction::Finished));
        assert!(w.raw.is_none());
    }

    #[test]
    fn test_404_falls_back_to_udp() {
        let cfg = config();
        let mut w = worker();
        w.url = Some("http://assets.example.com/?asset_id=1".into());
        w.can_use_udp = true;
        w.formatted = vec![1u8; 100];
        w.state = FetchState::WaitHttp;
        w.requested_size = 1000;
        w.complete_http(false, 404, "Not Found", Bytes::new());

        // Falls back: formatted reset, HTTP disabled, restarted clean,
        // and the worker registers for UDP.
        let action = w.advance(&ctx(&cfg));
        assert!(matches!(action, StepAction::QueueUdp));
        assert!(!w.can_use_http);
        assert!(w.can_use_udp);
        assert!(w.formatted.is_empty());
        assert_eq!(w.sent_request, SentRequest::Queued);
        assert_eq!(w.last_error, Some(FetchError::HttpNotFound));
    }

    #[test]
    fn test_404_without_udp_is_terminal() {
        let cfg = config();
        let mut w = worker();
        w.url = Some("http://assets.example.com/a.j2c".into());
        w.can_use_udp = false;
        w.state = FetchState::WaitHttp;
        w.requested_size = 1000;
        w.complete_http(false, 404, "Not Found", Bytes::new());

        assert!(matches!(w.advance(&ctx(&cfg)), StepAction::Finished));
        assert!(w.finished);
        assert!(w.raw.is_none());
    }

    #[test]
    fn test_499_blacklists_service() {
        let cfg = config();
        let mut w = worker();
        let url = "http://assets.example.com/?asset_id=1".to_string();
        w.url = Some(url.clone());
        w.state = FetchState::WaitHttp;
        w.requested_size = 1000;
        w.complete_http(false, 499, "", Bytes::new());

        w.advance(&ctx(&cfg));
        assert!(w
            .take_events()
            .contains(&WorkerEvent::BlacklistService { url }));
        assert_eq!(w.last_error, Some(FetchError::HttpUnreachable));
    }

    #[test]
    fn test_503_retries_without_bound() {
        let cfg = config();
        let mut w = worker();
        w.url = Some("http://assets.example.com/?asset_id=1".into());
        w.can_use_udp = false;
        for round in 1..=6u32 {
            w.state = FetchState::WaitHttp;
            w.loaded = false;
            w.complete_http(false, 503, "Service Unavailable", Bytes::new());
            let action = w.advance(&ctx(&cfg));
            // Straight back to SendHttp, which issues another request.
            assert!(
                matches!(action, StepAction::Submit(IoAction::HttpGet { .. })),
                "round {round}"
            );
            assert_eq!(w.http_fail_count, round);
        }
    }

    #[test]
    fn test_other_errors_bounded_then_decode_available() {
        let cfg = config();
        let mut w = worker();
        w.url = Some("http://assets.example.com/?asset_id=1".into());
        w.can_use_udp = false;
        w.formatted = vec![3u8; 500];
        w.loaded_discard = Some(3);
        w.codec_kind = Some(CodecKind::J2c);

        for _ in 0..3 {
            w.state = FetchState::WaitHttp;
            w.loaded = false;
            w.complete_http(false, 500, "Internal Server Error", Bytes::new());
            let action = w.advance(&ctx(&cfg));
            if w.http_fail_count < cfg.max_http_retries + 1 {
                assert!(matches!(
                    action,
                    StepAction::Submit(IoAction::HttpGet { .. })
                ));
            }
        }
        // Fourth failure exhausts the retry budget; the held bytes are
        // decoded instead of being thrown away.
        w.state = FetchState::WaitHttp;
        w.loaded = false;
        w.complete_http(false, 500, "Internal Server Error", Bytes::new());
        assert!(matches!(
            w.advance(&ctx(&cfg)),
            StepAction::Submit(IoAction::Decode { .. })
        ));
    }

    #[test]
    fn test_http_timeout_is_terminal() {
        let mut cfg = config();
        cfg.http_timeout = std::time::Duration::ZERO;
        let mut w = worker();
        w.state = FetchState::WaitHttp;
        // No completion ever arrives.
        assert!(matches!(w.advance(&ctx(&cfg)), StepAction::Finished));
        assert_eq!(w.last_error, Some(FetchError::HttpTimeout));
    }

    #[test]
    fn test_decode_failure_of_cached_data_retries_once() {
        let cfg = config();
        let mut w = worker();
        w.formatted = vec![1u8; 2048];
        w.cached_size = 2048;
        w.loaded_discard = Some(2);
        w.codec_kind = Some(CodecKind::J2c);
        w.state = FetchState::Decode;

        assert!(matches!(
            w.advance(&ctx(&cfg)),
            StepAction::Submit(IoAction::Decode { .. })
        ));
        w.complete_decode(w.decode_token, None);
        // First failure: remove the entry and restart.
        assert!(matches!(
            w.advance(&ctx(&cfg)),
            StepAction::Submit(IoAction::CacheRemove)
        ));
        assert_eq!(w.state, FetchState::Init);
        assert_eq!(w.retry_attempt, 1);
        assert!(w.formatted.is_empty());

        // Second failure is terminal.
        w.formatted = vec![1u8; 2048];
        w.cached_size = 2048;
        w.loaded_discard = Some(2);
        w.state = FetchState::Decode;
        w.advance(&ctx(&cfg));
        w.complete_decode(w.decode_token, None);
        assert!(matches!(w.advance(&ctx(&cfg)), StepAction::Finished));
        assert!(w.raw.is_none());
    }

    #[test]
    fn test_write_skipped_unless_should() {
        let cfg = config();
        let mut w = worker();
        w.formatted = vec![1u8; 100];
        w.write_policy = WritePolicy::Can;
        w.decoded_discard = Some(2);
        w.decoded = true;
        w.state = FetchState::WaitDecode;

        assert!(matches!(w.advance(&ctx(&cfg)), StepAction::Finished));
        assert_eq!(w.state, FetchState::Done);
    }

    #[test]
    fn test_write_emits_size_sentinel() {
        let cfg = config();
        let mut w = worker();
        w.formatted = vec![1u8; 100];
        w.write_policy = WritePolicy::Should;
        w.decoded_discard = Some(2);
        w.decoded = true;
        w.state = FetchState::WaitDecode;

        match w.advance(&ctx(&cfg)) {
            StepAction::Submit(IoAction::CacheWrite { data, file_size }) => {
                assert_eq!(data.len(), 100);
                // Partial prefix: stored size carries the +1 sentinel.
                assert_eq!(file_size, 101);
            }
            other => panic!("expected cache write, got {:?}", other),
        }
        w.complete_cache_write(true);
        assert!(matches!(w.advance(&ctx(&cfg)), StepAction::Finished));
    }

    #[test]
    fn test_pending_write_prioritized_when_finer_wanted() {
        let cfg = config();
        let mut w = worker();
        w.formatted = vec![1u8; 100];
        w.write_policy = WritePolicy::Should;
        w.decoded_discard = Some(2);
        w.decoded = true;
        w.state = FetchState::WaitDecode;
        w.advance(&ctx(&cfg));

        // The caller now wants finer data while the write is in flight.
        w.desired_discard = 0;
        assert!(matches!(w.advance(&ctx(&cfg)), StepAction::Yield));
        assert!(w.take_events().contains(&WorkerEvent::PrioritizeWrite));
        assert!(!w.delete_ok());
    }

    #[test]
    fn test_done_reenters_init_for_finer_detail() {
        let cfg = config();
        let mut w = worker();
        w.decoded_discard = Some(2);
        w.state = FetchState::Done;
        w.finished = true;

        assert!(w.set_desired(0, 16384));
        assert_eq!(w.state, FetchState::Init);
        assert!(!w.finished);
        assert!(matches!(
            w.advance(&ctx(&cfg)),
            StepAction::Submit(IoAction::CacheRead { .. })
        ));
    }

    #[test]
    fn test_priority_hysteresis_applies() {
        let mut w = worker();
        assert!(!w.set_image_priority(1040.0, MAX_PRIORITY));
        assert_eq!(w.image_priority, 1000.0);
        assert!(w.set_image_priority(2000.0, MAX_PRIORITY));
        assert_eq!(w.image_priority, 2000.0);
    }

    #[test]
    fn test_near_zero_priority_aborts_early_states() {
        let cfg = config();
        let mut w = worker();
        w.image_priority = 0.0;
        assert!(matches!(w.advance(&ctx(&cfg)), StepAction::Finished));
        assert_eq!(w.last_error, Some(FetchError::Cancelled));
    }

    #[test]
    fn test_deletion_blocked_by_outstanding_io() {
        let cfg = config();
        let mut w = worker();
        w.advance(&ctx(&cfg));
        assert!(w.cache_read_active);
        assert!(!w.delete_ok());
        w.complete_cache_read(None);
        assert!(w.delete_ok());
    }

    #[test]
    fn test_duplicate_http_completion_ignored() {
        let mut w = worker();
        w.state = FetchState::WaitHttp;
        w.requested_size = 100;
        assert_eq!(w.complete_http(true, 200, "OK", Bytes::from(vec![1u8; 100])), 100);
        assert_eq!(w.complete_http(true, 200, "OK", Bytes::from(vec![2u8; 50])), 0);
        assert_eq!(w.http_buffer.len(), 100);
    }

    #[test]
    fn test_oversized_response_adopts_whole_body() {
        let cfg = config();
        let mut w = worker();
        w.formatted = vec![9u8; 50];
        w.state = FetchState::WaitHttp;
        w.requested_offset = 50;
        w.requested_size = 100;
        w.requested_discard = Some(2);

        w.complete_http(true, 200, "OK", Bytes::from(vec![4u8; 500]));
        assert!(w.have_all);
        assert!(w.formatted.is_empty());

        match w.advance(&ctx(&cfg)) {
            StepAction::Submit(IoAction::Decode { data, .. }) => assert_eq!(data.len(), 500),
            other => panic!("expected decode, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_success_is_terminal() {
        let cfg = config();
        let mut w = worker();
        w.formatted = vec![9u8; 50];
        w.loaded_discard = Some(3);
        w.codec_kind = Some(CodecKind::J2c);
        w.state = FetchState::WaitHttp;
        w.requested_offset = 50;
        w.requested_size = 100;
        w.requested_discard = Some(3);

        // A 2xx with no body: nothing more exists, but nothing was
        // received either, so the attempt ends here.
        w.complete_http(true, 206, "Partial Content", Bytes::new());
        assert!(w.have_all);
        assert!(matches!(w.advance(&ctx(&cfg)), StepAction::Finished));
        assert!(w.raw.is_none());
    }

    #[test]
    fn test_sim_prefix_adoption() {
        let cfg = config();
        let mut w = worker();
        w.requested_size = 1000;
        w.requested_discard = Some(2);
        w.state = FetchState::LoadFromSim;
        w.assembler
            .insert_header(2, Bytes::from(vec![1u8; crate::udp::FIRST_PACKET_SIZE]))
            .unwrap();
        w.assembler
            .insert(1, Bytes::from(vec![2u8; 700]))
            .unwrap();

        match w.advance(&ctx(&cfg)) {
            StepAction::Submit(IoAction::Decode { data, discard, .. }) => {
                assert_eq!(data.len(), crate::udp::FIRST_PACKET_SIZE + 700);
                // All packets arrived, so full resolution is decodable.
                assert_eq!(discard, 0);
            }
            other => panic!("expected decode, got {:?}", other),
        }
        assert!(w.have_all);
        assert_eq!(w.write_policy, WritePolicy::Should);
        assert!(w
            .take_events()
            .contains(&WorkerEvent::LeftNetworkQueue));
    }
}
