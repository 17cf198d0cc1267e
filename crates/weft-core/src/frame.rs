//! Frame and message schema — the in-memory shapes of everything the
//! transport moves: frames, chunk descriptors, acknowledgments, recovery
//! requests, and routed network messages.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::peer::PeerAddress;

/// Unique id of one logical frame. Random per frame, never reused.
pub type FrameId = [u8; 16];

/// Generate a fresh frame id.
pub fn new_frame_id() -> FrameId {
    rand::random()
}

/// Frame type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    Data = 1,
    Control = 2,
    Heartbeat = 3,
    Error = 4,
    Ack = 5,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Data),
            2 => Some(Self::Control),
            3 => Some(Self::Heartbeat),
            4 => Some(Self::Error),
            5 => Some(Self::Ack),
            _ => None,
        }
    }
}

/// Payload compression tag. Carried on the wire; only `None` is produced
/// in this version — the other tags are reserved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Compression {
    #[default]
    None = 0,
    Gzip = 1,
    Lz4 = 2,
    Zstd = 3,
}

impl Compression {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Gzip),
            2 => Some(Self::Lz4),
            3 => Some(Self::Zstd),
            _ => None,
        }
    }
}

/// Descriptor of one chunk within a frame.
///
/// Invariant: `chunk_index < total_chunks`, and the indices of one frame are
/// contiguous `0..total_chunks` once reassembly completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub chunk_size: u32,

    /// BLAKE3 of this chunk's bytes.
    pub chunk_hash: [u8; 32],

    /// BLAKE3 of the whole reassembled payload. Present only on the final
    /// chunk; the end-to-end integrity check independent of per-chunk hashes.
    pub complete_hash: Option<[u8; 32]>,
}

/// One logical unit of reliable transfer, split into hash-verified chunks.
///
/// Invariant: the chunk payloads concatenated in index order equal `payload`.
#[derive(Debug, Clone)]
pub struct MessageFrame {
    pub frame_id: FrameId,
    pub frame_type: FrameType,
    pub payload: Bytes,

    /// Hop-local metadata. Not carried inside DATA records on the wire.
    pub headers: BTreeMap<String, String>,

    pub timestamp_ms: u64,
    pub compression: Compression,
    pub chunks: Vec<ChunkInfo>,

    /// Wire protocol version.
    pub version: u8,

    /// Per-sender-per-pipe, monotonically increasing.
    pub sequence: u64,
}

/// Receiver → sender: outcome of a frame, correlated by `frame_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acknowledgment {
    pub frame_id: FrameId,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp_ms: u64,

    /// Chunk indices that have arrived so far. Complete on success.
    pub received: Vec<u32>,
}

/// Receiver → sender: the final chunk was seen but these indices never
/// arrived within the grace window. The sender resends exactly these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRequest {
    pub frame_id: FrameId,
    pub missing: Vec<u32>,
    pub timestamp_ms: u64,
    pub session: String,
}

/// An addressed (or broadcast) application message moving through the mesh.
///
/// TTL is the hop budget: each forwarding hop decrements it and the message
/// is dropped, never retransmitted, once it reaches zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMessage {
    pub id: String,
    pub source: PeerAddress,
    pub destination: PeerAddress,
    pub payload: Bytes,
    pub ttl: u8,
    pub timestamp_ms: u64,
}

impl NetworkMessage {
    pub fn new(
        source: PeerAddress,
        destination: PeerAddress,
        payload: impl Into<Bytes>,
        ttl: u8,
    ) -> Self {
        Self {
            id: hex::encode(new_frame_id()),
            source,
            destination,
            payload: payload.into(),
            ttl,
            timestamp_ms: crate::now_millis(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        // NetworkMessage contains nothing a serializer can reject.
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_type_round_trip() {
        for t in [
            FrameType::Data,
            FrameType::Control,
            FrameType::Heartbeat,
            FrameType::Error,
            FrameType::Ack,
        ] {
            assert_eq!(FrameType::from_u8(t as u8), Some(t));
        }
        assert_eq!(FrameType::from_u8(0), None);
        assert_eq!(FrameType::from_u8(6), None);
    }

    #[test]
    fn compression_round_trip() {
        for c in [
            Compression::None,
            Compression::Gzip,
            Compression::Lz4,
            Compression::Zstd,
        ] {
            assert_eq!(Compression::from_u8(c as u8), Some(c));
        }
        assert_eq!(Compression::from_u8(4), None);
    }

    #[test]
    fn network_message_round_trip() {
        let msg = NetworkMessage::new(
            PeerAddress::new("a", "", 0),
            PeerAddress::new("b", "", 0),
            Bytes::from_static(b"hi"),
            8,
        );
        let back = NetworkMessage::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(back.id, msg.id);
        assert_eq!(back.source.id, "a");
        assert_eq!(back.destination.id, "b");
        assert_eq!(back.payload.as_ref(), b"hi");
        assert_eq!(back.ttl, 8);
    }

    #[test]
    fn frame_ids_are_distinct() {
        assert_ne!(new_frame_id(), new_frame_id());
    }
}
