//! End-to-end fetch scenarios against in-memory collaborators.
//!
//! Each test wires a [`FetchEngine`] to mock codec/cache/HTTP/UDP
//! implementations and drives it by ticking, the way the embedding
//! viewer would.

use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use texflow::asset::AssetId;
use texflow::cache::{known_file_size, BlobCache, CacheError, CacheHit};
use texflow::codec::{Codec, CodecKind, DecodeError, DecodedImage, RawImage};
use texflow::config::FetchConfig;
use texflow::fetch::{FetchEngine, FetchPoll, RequestParams};
use texflow::http::{ByteRange, HttpError, HttpResponse, HttpTransport};
use texflow::metrics::FetchStats;
use texflow::region::StaticRegionDirectory;
use texflow::scheduler::CapabilityClass;
use texflow::udp::{AgentSession, AssetRequest, SimTransport, FIRST_PACKET_SIZE};

// ----- mock collaborators ----------------------------------------------

/// Codec that decodes anything into a 2x2 image at the asked discard.
struct MockCodec {
    decodes: Mutex<Vec<(usize, u8)>>,
}

impl MockCodec {
    fn new() -> Self {
        Self {
            decodes: Mutex::new(Vec::new()),
        }
    }
}

impl Codec for MockCodec {
    async fn decode(
        &self,
        data: Bytes,
        _kind: CodecKind,
        discard: u8,
        need_aux: bool,
    ) -> Result<DecodedImage, DecodeError> {
        self.decodes.lock().push((data.len(), discard));
        let raw = Arc::new(RawImage::new(2, 2, 3, Bytes::from(vec![0u8; 12])));
        let aux = need_aux.then(|| Arc::new(RawImage::new(2, 2, 1, Bytes::from(vec![0u8; 4]))));
        Ok(DecodedImage { raw, aux, discard })
    }

    fn encoded_size(&self, width: u32, height: u32, components: u8, discard: u8) -> usize {
        (width as usize * height as usize * components as usize) >> (2 * discard as usize)
    }
}

/// In-memory blob cache recording every write.
struct MemCache {
    entries: Mutex<std::collections::HashMap<AssetId, (Vec<u8>, usize)>>,
    writes: Mutex<Vec<(AssetId, usize, usize)>>,
}

impl MemCache {
    fn new() -> Self {
        Self {
            entries: Mutex::new(std::collections::HashMap::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    fn seed(&self, id: AssetId, data: Vec<u8>, stored_size: usize) {
        self.entries.lock().insert(id, (data, stored_size));
    }
}

impl BlobCache for MemCache {
    async fn read(
        &self,
        id: AssetId,
        offset: usize,
        size: usize,
    ) -> Result<Option<CacheHit>, CacheError> {
        let entries = self.entries.lock();
        let Some((data, stored)) = entries.get(&id) else {
            return Ok(None);
        };
        if offset >= data.len() {
            return Ok(None);
        }
        let end = (offset + size).min(data.len());
        Ok(Some(CacheHit {
            bytes: Bytes::copy_from_slice(&data[offset..end]),
            file_size: known_file_size(*stored, data.len()),
            local: false,
        }))
    }

    async fn read_local(
        &self,
        _path: &Path,
        _offset: usize,
        _size: usize,
    ) -> Result<Option<CacheHit>, CacheError> {
        Ok(None)
    }

    async fn write(&self, id: AssetId, data: Bytes, file_size: usize) -> Result<(), CacheError> {
        self.writes.lock().push((id, data.len(), file_size));
        self.entries.lock().insert(id, (data.to_vec(), file_size));
        Ok(())
    }

    async fn remove(&self, id: AssetId) {
        self.entries.lock().remove(&id);
    }

    fn prioritize_write(&self, _id: AssetId) {}
}

/// How the mock HTTP service behaves.
enum HttpBehavior {
    /// Serve byte ranges of this asset with 206/200.
    ServeAsset(Vec<u8>),
    /// Always answer with this status and no body.
    Status(u16),
}

struct ScriptedHttp {
    behavior: HttpBehavior,
    calls: Mutex<Vec<(String, Option<ByteRange>)>>,
}

impl ScriptedHttp {
    fn new(behavior: HttpBehavior) -> Self {
        Self {
            behavior,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl HttpTransport for ScriptedHttp {
    async fn get(
        &self,
        url: &str,
        range: Option<ByteRange>,
        _headers: &[(&str, &str)],
    ) -> Result<HttpResponse, HttpError> {
        self.calls.lock().push((url.to_string(), range));
        match &self.behavior {
            HttpBehavior::ServeAsset(asset) => match range {
                Some(range) if range.offset < asset.len() => {
                    let end = (range.offset + range.length).min(asset.len());
                    let body = Bytes::copy_from_slice(&asset[range.offset..end]);
                    let status = if body.len() == asset.len() { 200 } else { 206 };
                    Ok(HttpResponse {
                        status,
                        reason: String::new(),
                        body,
                    })
                }
                Some(_) => Ok(HttpResponse {
                    status: 416,
                    reason: "Range Not Satisfiable".into(),
                    body: Bytes::new(),
                }),
                None => Ok(HttpResponse {
                    status: 200,
                    reason: "OK".into(),
                    body: Bytes::copy_from_slice(asset),
                }),
            },
            HttpBehavior::Status(status) => Ok(HttpResponse {
                status: *status,
                reason: String::new(),
                body: Bytes::new(),
            }),
        }
    }
}

/// UDP transport that records outbound batches.
#[derive(Default)]
struct RecordingSim {
    requests: Mutex<Vec<(SocketAddr, Vec<AssetRequest>)>>,
    cancels: Mutex<Vec<(SocketAddr, Vec<AssetId>)>>,
}

impl SimTransport for RecordingSim {
    async fn send_request_batch(
        &self,
        host: SocketAddr,
        _session: &AgentSession,
        batch: &[AssetRequest],
    ) {
        self.requests.lock().push((host, batch.to_vec()));
    }

    async fn send_cancel_batch(&self, host: SocketAddr, _session: &AgentSession, ids: &[AssetId]) {
        self.cancels.lock().push((host, ids.to_vec()));
    }
}

// ----- harness ---------------------------------------------------------

struct Rig {
    engine: FetchEngine<MockCodec, MemCache, ScriptedHttp, RecordingSim, StaticRegionDirectory>,
    codec: Arc<MockCodec>,
    cache: Arc<MemCache>,
    http: Arc<ScriptedHttp>,
    sim: Arc<RecordingSim>,
    stats: Arc<FetchStats>,
}

fn sim_host() -> SocketAddr {
    "10.1.2.3:13000".parse().unwrap()
}

fn rig(http_behavior: HttpBehavior) -> Rig {
    let codec = Arc::new(MockCodec::new());
    let cache = Arc::new(MemCache::new());
    let http = Arc::new(ScriptedHttp::new(http_behavior));
    let sim = Arc::new(RecordingSim::default());
    let stats = Arc::new(FetchStats::new());
    let regions = Arc::new(StaticRegionDirectory::new());
    regions.set_default(
        Some(sim_host()),
        Some("http://assets.example.com/caps/assets".to_string()),
    );
    let config = FetchConfig {
        // Tests tick far faster than the shipped sweep cadence.
        sweep_interval: std::time::Duration::ZERO,
        ..FetchConfig::default()
    };
    let engine = FetchEngine::new(
        Arc::clone(&codec),
        Arc::clone(&cache),
        Arc::clone(&http),
        Arc::clone(&sim),
        regions,
        stats.clone(),
        config,
        AgentSession {
            agent_id: AssetId::new(0xA6E27),
            session_id: AssetId::new(0x5E5510),
        },
    );
    Rig {
        engine,
        codec,
        cache,
        http,
        sim,
        stats,
    }
}

fn request(id: AssetId, desired_discard: u8) -> RequestParams {
    RequestParams {
        id,
        url: None,
        host: None,
        class: CapabilityClass::Texture,
        priority: 5000.0,
        width: 0,
        height: 0,
        components: 0,
        desired_discard,
        needs_aux: false,
        can_use_http: true,
    }
}

async fn drive_until_done(rig: &Rig, id: AssetId, rounds: usize) -> FetchPoll {
    for _ in 0..rounds {
        rig.engine.tick().await;
        tokio::task::yield_now().await;
        match rig.engine.poll_finished(id) {
            // Interim results while the write-back is in flight don't
            // end the drive; wait for the terminal state.
            FetchPoll::NotReady | FetchPoll::Ready { complete: false, .. } => continue,
            done => return done,
        }
    }
    FetchPoll::NotReady
}

// ----- scenarios -------------------------------------------------------

/// Full cache hit: no network traffic at all.
#[tokio::test]
async fn test_cache_hit_full() {
    let rig = rig(HttpBehavior::Status(500));
    let id = AssetId::new(0x11);
    rig.cache.seed(id, vec![0xAB; 3980], 3980);

    assert!(rig.engine.create_request(request(id, 0)));
    match drive_until_done(&rig, id, 100).await {
        FetchPoll::Ready {
            discard,
            raw,
            aux,
            complete,
        } => {
            assert_eq!(discard, 0);
            assert!(complete);
            assert!(aux.is_none());
            assert_eq!(raw.width, 2);
        }
        other => panic!("expected ready, got {:?}", other),
    }

    assert_eq!(rig.http.call_count(), 0, "no HTTP traffic expected");
    assert!(rig.sim.requests.lock().is_empty(), "no UDP traffic expected");
    // Fully cached data is not written back.
    assert!(rig.cache.writes.lock().is_empty());
    assert!(rig.stats.cache_hit_rate() > 0.99);
}

/// Cache holds a 1000-byte prefix of a 3980-byte asset; HTTP serves the
/// tail as a 206 and the full asset is written back.
#[tokio::test]
async fn test_http_206_tail() {
    let asset: Vec<u8> = (0..3980u32).map(|i| (i % 251) as u8).collect();
    let rig = rig(HttpBehavior::ServeAsset(asset.clone()));
    let id = AssetId::new(0x22);
    // Stored size carries the legacy +1 sentinel for a partial entry.
    rig.cache.seed(id, asset[..1000].to_vec(), 3981);

    assert!(rig.engine.create_request(request(id, 0)));
    match drive_until_done(&rig, id, 100).await {
        FetchPoll::Ready { discard, .. } => assert_eq!(discard, 0),
        other => panic!("expected ready, got {:?}", other),
    }

    // One ranged request, widened by one byte to stay partially
    // satisfiable: offset 999 instead of 1000.
    let calls = rig.http.calls.lock();
    assert_eq!(calls.len(), 1);
    let range = calls[0].1.expect("request must carry a Range");
    assert_eq!(range.offset, 999);

    // The complete asset went back to the cache with its exact size.
    let writes = rig.cache.writes.lock();
    assert_eq!(writes.len(), 1);
    let (write_id, len, file_size) = writes[0];
    assert_eq!(write_id, id);
    assert_eq!(len, 3980);
    assert_eq!(file_size, 3980);

    // The decode saw the full, correctly reassembled byte stream.
    let decodes = rig.codec.decodes.lock();
    assert_eq!(decodes.last(), Some(&(3980, 0)));
}

/// HTTP 404 falls back to the UDP path: request batches go out, packets
/// come back, and no further HTTP is attempted.
#[tokio::test]
async fn test_404_falls_back_to_udp() {
    let rig = rig(HttpBehavior::Status(404));
    rig.engine.set_sim_enabled(true);
    let id = AssetId::new(0x33);

    assert!(rig.engine.create_request(request(id, 0)));

    // Drive until the UDP request batch has gone out.
    let mut requested = false;
    for _ in 0..100 {
        rig.engine.tick().await;
        tokio::task::yield_now().await;
        if rig
            .sim
            .requests
            .lock()
            .iter()
            .any(|(_, batch)| batch.iter().any(|r| r.id == id))
        {
            requested = true;
            break;
        }
    }
    assert!(requested, "expected a UDP request batch naming the asset");
    assert_eq!(rig.http.call_count(), 1, "only the failed HTTP attempt");

    // The asset arrives as header + one data packet (937 bytes total).
    let total_bytes = (FIRST_PACKET_SIZE + 337) as u32;
    let header = Bytes::from(vec![0x5A; FIRST_PACKET_SIZE]);
    assert!(rig
        .engine
        .receive_image_header(sim_host(), id, CodecKind::J2c.tag(), 2, total_bytes, header));
    assert!(rig
        .engine
        .receive_image_packet(sim_host(), id, 1, Bytes::from(vec![0xA5; 337])));

    match drive_until_done(&rig, id, 100).await {
        FetchPoll::Ready { discard, .. } => assert_eq!(discard, 0),
        other => panic!("expected ready, got {:?}", other),
    }

    // Everything the simulator sent was written back, size known.
    let writes = rig.cache.writes.lock();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].1, total_bytes as usize);
    assert_eq!(writes[0].2, total_bytes as usize);

    assert_eq!(rig.http.call_count(), 1, "no HTTP retry after fallback");
}

/// A 499 (no response) blacklists the service prefix.
#[tokio::test]
async fn test_499_records_blacklist_entry() {
    let rig = rig(HttpBehavior::Status(499));
    let id = AssetId::new(0x44);

    assert!(rig.engine.create_request(request(id, 2)));
    for _ in 0..50 {
        rig.engine.tick().await;
        tokio::task::yield_now().await;
        if rig.engine.blacklist().len() > 0 {
            break;
        }
    }

    assert_eq!(rig.engine.blacklist().len(), 1);
    assert_eq!(
        rig.engine
            .blacklist()
            .reason("http://assets.example.com/caps/assets/anything"),
        Some(499)
    );
}

/// Duplicate and malformed packets are rejected and answered with a
/// cancel toward the sending host.
#[tokio::test]
async fn test_protocol_violations_schedule_cancels() {
    let rig = rig(HttpBehavior::Status(404));
    rig.engine.set_sim_enabled(true);
    let id = AssetId::new(0x55);

    assert!(rig.engine.create_request(request(id, 0)));
    for _ in 0..100 {
        rig.engine.tick().await;
        tokio::task::yield_now().await;
        if !rig.sim.requests.lock().is_empty() {
            break;
        }
    }

    let total_bytes = (FIRST_PACKET_SIZE + 2337) as u32;
    let header = Bytes::from(vec![1u8; FIRST_PACKET_SIZE]);
    assert!(rig
        .engine
        .receive_image_header(sim_host(), id, CodecKind::J2c.tag(), 4, total_bytes, header.clone()));

    // Second header: rejected.
    assert!(!rig
        .engine
        .receive_image_header(sim_host(), id, CodecKind::J2c.tag(), 4, total_bytes, header));
    // Index past the announced total: rejected.
    assert!(!rig
        .engine
        .receive_image_packet(sim_host(), id, 4, Bytes::from(vec![2u8; 1000])));
    // Wrong-size middle packet: rejected.
    assert!(!rig
        .engine
        .receive_image_packet(sim_host(), id, 1, Bytes::from(vec![2u8; 999])));

    let (total, bad) = rig.stats.packet_counts();
    assert_eq!(bad, 3);
    assert!(total >= 4);

    // The rejections queued cancels; the next sweep flushes them.
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    rig.engine.tick().await;
    tokio::task::yield_now().await;
    let cancels = rig.sim.cancels.lock();
    assert!(cancels.iter().any(|(host, ids)| *host == sim_host() && ids.contains(&id)));
}

/// Deleting a request mid-flight surfaces as an aborted poll and leaves
/// no worker behind.
#[tokio::test]
async fn test_delete_mid_flight_aborts() {
    let rig = rig(HttpBehavior::Status(503));
    let id = AssetId::new(0x66);

    assert!(rig.engine.create_request(request(id, 2)));
    rig.engine.tick().await;
    tokio::task::yield_now().await;

    rig.engine.delete_request(id, true);
    assert!(matches!(rig.engine.poll_finished(id), FetchPoll::Aborted));

    // Ticking on is harmless; stray completions find no worker.
    for _ in 0..10 {
        rig.engine.tick().await;
        tokio::task::yield_now().await;
    }
    assert_eq!(rig.engine.request_count(), 0);
}
