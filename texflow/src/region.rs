//! Region directory collaborator interface.
//!
//! The pipeline does not know which simulator the viewer is connected
//! to, nor which of them offer HTTP asset service. The region directory
//! answers both questions.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Maps simulator hosts to their HTTP asset service.
pub trait RegionDirectory: Send + Sync + 'static {
    /// Base URL of the HTTP asset service for `host`, or for the agent's
    /// current region when `host` is `None`. `None` means the region has
    /// no HTTP asset service and the UDP path must be used.
    fn asset_url_for(&self, host: Option<SocketAddr>) -> Option<String>;

    /// The agent's current region host, used for requests that did not
    /// name one.
    fn default_host(&self) -> Option<SocketAddr>;
}

/// Static in-memory directory, for tests and single-region embedders.
#[derive(Debug, Default)]
pub struct StaticRegionDirectory {
    inner: RwLock<StaticInner>,
}

#[derive(Debug, Default)]
struct StaticInner {
    urls: HashMap<SocketAddr, String>,
    default_url: Option<String>,
    default_host: Option<SocketAddr>,
}

impl StaticRegionDirectory {
    /// Creates an empty directory; lookups return `None` until populated.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the asset service URL for `host`.
    pub fn insert(&self, host: SocketAddr, url: impl Into<String>) {
        self.inner.write().urls.insert(host, url.into());
    }

    /// Sets the agent's current region and its asset service URL.
    pub fn set_default(&self, host: Option<SocketAddr>, url: Option<String>) {
        let mut inner = self.inner.write();
        inner.default_host = host;
        inner.default_url = url;
    }
}

impl RegionDirectory for StaticRegionDirectory {
    fn asset_url_for(&self, host: Option<SocketAddr>) -> Option<String> {
        let inner = self.inner.read();
        match host {
            Some(host) => inner.urls.get(&host).cloned(),
            None => inner.default_url.clone(),
        }
    }

    fn default_host(&self) -> Option<SocketAddr> {
        self.inner.read().default_host
    }
}
