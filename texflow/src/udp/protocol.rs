//! Framing types for the legacy UDP asset protocol.
//!
//! The transport below this crate owns the wire encoding; these types are
//! the framing level the pipeline produces and consumes. An asset arrives
//! as one header packet (index 0) followed by data packets; all data
//! packets except the last carry exactly [`MAX_IMG_PACKET_SIZE`] bytes of
//! payload.

use crate::asset::AssetId;
use std::future::Future;
use std::net::SocketAddr;

/// Payload bytes carried by the header packet when the asset does not
/// fit in it whole.
pub const FIRST_PACKET_SIZE: usize = 600;

/// Payload bytes carried by every data packet except the last.
pub const MAX_IMG_PACKET_SIZE: usize = 1000;

/// Maximum request entries per outbound message.
pub const IMAGES_PER_REQUEST: usize = 50;

/// Discard level encoding a cancel on the wire.
pub const CANCEL_DISCARD: i8 = -1;

/// Variant of asset being requested; affects server-side routing only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssetType {
    /// Ordinary asset addressed by id alone.
    #[default]
    Normal,
    /// Asset baked by (and fetched from) a specific simulator host.
    Baked,
}

impl AssetType {
    /// Wire value.
    pub fn tag(self) -> u8 {
        match self {
            AssetType::Normal => 0,
            AssetType::Baked => 1,
        }
    }
}

/// Identity block every outbound message opens with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentSession {
    /// Agent identifier.
    pub agent_id: AssetId,
    /// Session identifier.
    pub session_id: AssetId,
}

/// One entry of an outbound request batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssetRequest {
    /// Asset being requested.
    pub id: AssetId,
    /// Desired discard level; [`CANCEL_DISCARD`] encodes a cancel.
    pub discard: i8,
    /// Download priority hint for the server.
    pub priority: f32,
    /// First packet index the client still needs.
    pub next_packet: u32,
    /// Asset variant.
    pub kind: AssetType,
}

/// Interface to the UDP transport.
///
/// Batches are bounded by [`IMAGES_PER_REQUEST`]; the engine chunks
/// larger request sets before calling.
pub trait SimTransport: Send + Sync + 'static {
    /// Sends one request message to `host`.
    fn send_request_batch(
        &self,
        host: SocketAddr,
        session: &AgentSession,
        batch: &[AssetRequest],
    ) -> impl Future<Output = ()> + Send;

    /// Sends one cancel message to `host` covering `ids`.
    fn send_cancel_batch(
        &self,
        host: SocketAddr,
        session: &AgentSession,
        ids: &[AssetId],
    ) -> impl Future<Output = ()> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_type_tags() {
        assert_eq!(AssetType::Normal.tag(), 0);
        assert_eq!(AssetType::Baked.tag(), 1);
        assert_eq!(AssetType::default(), AssetType::Normal);
    }

    #[test]
    fn test_packet_geometry_constants() {
        // The header payload plus a whole number of data packets must be
        // able to tile any asset size.
        assert!(FIRST_PACKET_SIZE < MAX_IMG_PACKET_SIZE);
        assert!(IMAGES_PER_REQUEST > 0);
    }
}
