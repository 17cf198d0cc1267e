//! weft-core — shared data model, wire format, and configuration.
//! All other Weft crates depend on this one.

pub mod channel;
pub mod config;
pub mod frame;
pub mod peer;
pub mod wire;

pub use channel::{ChannelConfig, ChannelKind, PipeCapabilities, PipeConfiguration};
pub use config::MeshConfig;
pub use frame::{
    Acknowledgment, ChunkInfo, Compression, FrameId, FrameType, MessageFrame, NetworkMessage,
    RecoveryRequest,
};
pub use peer::PeerAddress;

/// Milliseconds since the Unix epoch. Used for wire timestamps.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
