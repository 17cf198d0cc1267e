//! Weft wire format — the on-wire shape of every record a pipe carries.
//!
//! These types ARE the protocol. Every field, every size, every reserved bit
//! is part of the compatibility contract; changing anything here is a
//! breaking change for every peer on the mesh.
//!
//! A record is one fixed-width `ChunkRecordHeader` followed by exactly
//! `payload_len` payload bytes. Stream pipes prepend a u32 big-endian length
//! per record; datagram-like media carry one record per medium unit.
//! Numeric header fields are stored in the header struct's native layout
//! (little-endian on all supported targets).
//!
//! The header is #[repr(C, packed)] with zerocopy derives for deterministic
//! layout and allocation-free serialization. No unsafe code in this module.

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::frame::{Compression, FrameId, FrameType};

/// Current wire format version. A record with an unknown version is
/// silently dropped by the receiver.
pub const WIRE_VERSION: u8 = 1;

/// Flag bit: this is the final chunk of its frame and `complete_hash` is
/// valid. All other bits are reserved and must be zero.
pub const FLAG_FINAL: u8 = 0b0000_0001;

/// Header size in bytes. The per-record overhead every chunk pays.
pub const HEADER_LEN: usize = 112;

/// Stream pipes add a 4-byte length prefix on top of the header.
pub const STREAM_PREFIX_LEN: usize = 4;

/// BLAKE3 content hash of arbitrary bytes. The digest used for chunk and
/// full-payload verification throughout the transport.
pub fn content_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Fixed-width header preceding every chunk payload.
///
/// Wire size: 112 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ChunkRecordHeader {
    /// Id of the logical frame this chunk belongs to.
    pub frame_id: [u8; 16],

    /// FrameType as u8. Unknown values drop the record.
    pub frame_type: u8,

    /// Compression as u8. Only 0 (none) is produced; the rest are reserved.
    pub compression: u8,

    /// Wire format version. Currently 0x01.
    pub version: u8,

    /// Bit 0: final chunk, complete_hash valid. Bits 1-7 reserved, zero.
    pub flags: u8,

    /// Per-sender-per-pipe monotonically increasing sequence number.
    pub sequence: u64,

    /// Sender clock, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,

    /// Index of this chunk within the frame.
    pub chunk_index: u32,

    /// Total chunks in the frame. Always >= 1.
    pub total_chunks: u32,

    /// Payload bytes following this header.
    pub payload_len: u32,

    /// BLAKE3 of this chunk's payload. A mismatch silently discards the
    /// chunk — no error is sent back.
    pub chunk_hash: [u8; 32],

    /// BLAKE3 of the whole reassembled frame payload. Zero unless FLAG_FINAL.
    pub complete_hash: [u8; 32],
}

// Compile-time size guard. If this fails, the wire format silently changed.
assert_eq_size!(ChunkRecordHeader, [u8; 112]);

/// A decoded record — the aligned, validated form of header + payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub frame_id: FrameId,
    pub frame_type: FrameType,
    pub compression: Compression,
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub chunk_hash: [u8; 32],
    /// Present when the record carried FLAG_FINAL.
    pub complete_hash: Option<[u8; 32]>,
    pub payload: Bytes,
}

impl ChunkRecord {
    /// Build a single-chunk record for control-plane traffic (acks,
    /// recovery requests, heartbeats). The payload is its own frame.
    pub fn single(
        frame_type: FrameType,
        frame_id: FrameId,
        sequence: u64,
        payload: Bytes,
    ) -> Self {
        let hash = content_hash(&payload);
        Self {
            frame_id,
            frame_type,
            compression: Compression::None,
            sequence,
            timestamp_ms: crate::now_millis(),
            chunk_index: 0,
            total_chunks: 1,
            chunk_hash: hash,
            complete_hash: Some(hash),
            payload,
        }
    }

    pub fn is_final(&self) -> bool {
        self.complete_hash.is_some()
    }

    /// Encode to the on-wire byte form: header immediately followed by payload.
    pub fn encode(&self) -> Bytes {
        let header = ChunkRecordHeader {
            frame_id: self.frame_id,
            frame_type: self.frame_type as u8,
            compression: self.compression as u8,
            version: WIRE_VERSION,
            flags: if self.complete_hash.is_some() {
                FLAG_FINAL
            } else {
                0
            },
            sequence: self.sequence,
            timestamp_ms: self.timestamp_ms,
            chunk_index: self.chunk_index,
            total_chunks: self.total_chunks,
            payload_len: self.payload.len() as u32,
            chunk_hash: self.chunk_hash,
            complete_hash: self.complete_hash.unwrap_or([0u8; 32]),
        };

        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.payload);
        Bytes::from(out)
    }

    /// Decode one record from raw bytes. The slice must contain exactly one
    /// record (header + payload); trailing bytes are a length mismatch.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HEADER_LEN {
            return Err(WireError::TooShort(data.len()));
        }

        let header = ChunkRecordHeader::read_from_prefix(&data[..HEADER_LEN])
            .ok_or(WireError::TooShort(data.len()))?;

        if header.version != WIRE_VERSION {
            return Err(WireError::UnknownVersion(header.version));
        }
        if header.flags & !FLAG_FINAL != 0 {
            return Err(WireError::ReservedFlagsSet(header.flags));
        }

        let frame_type =
            FrameType::from_u8(header.frame_type).ok_or(WireError::UnknownFrameType(header.frame_type))?;
        let compression = Compression::from_u8(header.compression)
            .ok_or(WireError::UnknownCompression(header.compression))?;

        // Copy packed fields to locals before use — avoids unaligned access.
        let payload_len = header.payload_len as usize;
        let chunk_index = header.chunk_index;
        let total_chunks = header.total_chunks;
        let sequence = header.sequence;
        let timestamp_ms = header.timestamp_ms;

        if data.len() - HEADER_LEN != payload_len {
            return Err(WireError::LengthMismatch {
                declared: payload_len,
                actual: data.len() - HEADER_LEN,
            });
        }
        if total_chunks == 0 || chunk_index >= total_chunks {
            return Err(WireError::BadChunkIndex {
                index: chunk_index,
                total: total_chunks,
            });
        }

        let complete_hash = if header.flags & FLAG_FINAL != 0 {
            Some(header.complete_hash)
        } else {
            None
        };

        Ok(Self {
            frame_id: header.frame_id,
            frame_type,
            compression,
            sequence,
            timestamp_ms,
            chunk_index,
            total_chunks,
            chunk_hash: header.chunk_hash,
            complete_hash,
            payload: Bytes::copy_from_slice(&data[HEADER_LEN..]),
        })
    }
}

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("record too short: {0} bytes")]
    TooShort(usize),

    #[error("unknown wire version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("unknown frame type: 0x{0:02x}")]
    UnknownFrameType(u8),

    #[error("unknown compression tag: 0x{0:02x}")]
    UnknownCompression(u8),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("payload length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("chunk index {index} out of range for {total} chunks")]
    BadChunkIndex { index: u32, total: u32 },
}
