//! Fetch state machine vocabulary.

use std::fmt;

/// States a fetch worker moves through.
///
/// The order matters: comparisons like `state >= WriteToCache` gate
/// deletion and interim results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FetchState {
    /// Freshly created or restarted; per-attempt scratch is cleared here.
    Init,
    /// Async cache read outstanding.
    LoadFromCache,
    /// Cache read finished; decide whether it sufficed.
    CachePost,
    /// Choosing and entering a network transport.
    LoadFromNetwork,
    /// Receiving UDP packets; woken by inbound data.
    LoadFromSim,
    /// Waiting for HTTP admission, then issuing the request.
    SendHttp,
    /// HTTP request outstanding.
    WaitHttp,
    /// Submitting compressed bytes to the codec.
    Decode,
    /// Decode outstanding.
    WaitDecode,
    /// Submitting the cache write.
    WriteToCache,
    /// Cache write outstanding.
    WaitOnWrite,
    /// Terminal; may re-enter `Init` if finer detail is requested.
    Done,
}

impl fmt::Display for FetchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FetchState::Init => "init",
            FetchState::LoadFromCache => "load_from_cache",
            FetchState::CachePost => "cache_post",
            FetchState::LoadFromNetwork => "load_from_network",
            FetchState::LoadFromSim => "load_from_sim",
            FetchState::SendHttp => "send_http",
            FetchState::WaitHttp => "wait_http",
            FetchState::Decode => "decode",
            FetchState::WaitDecode => "wait_decode",
            FetchState::WriteToCache => "write_to_cache",
            FetchState::WaitOnWrite => "wait_on_write",
            FetchState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Whether the fetched bytes should go back into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritePolicy {
    /// Came from the cache (or a local file); nothing to write back.
    #[default]
    No,
    /// Fetching from the network; a write will be wanted if data arrives.
    Can,
    /// New data arrived; write it back when decoded.
    Should,
}

/// Progress of the worker's UDP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SentRequest {
    /// Nothing sent.
    #[default]
    Unsent,
    /// Sitting in the engine's network queue.
    Queued,
    /// A request batch naming this asset went out.
    SentSim,
}
