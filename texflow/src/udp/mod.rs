//! Legacy UDP transport seam: request framing and packet reassembly.

mod assembler;
mod protocol;

pub use assembler::{PacketAssembler, PacketError, SeedOutcome};
pub use protocol::{
    AgentSession, AssetRequest, AssetType, SimTransport, CANCEL_DISCARD, FIRST_PACKET_SIZE,
    IMAGES_PER_REQUEST, MAX_IMG_PACKET_SIZE,
};
