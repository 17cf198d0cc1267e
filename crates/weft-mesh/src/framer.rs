//! Message framer — splits outbound payloads into size-bounded,
//! hash-verified chunks and reassembles inbound chunks into payloads.
//!
//! Reassembly buffers are bounded in count and age so frames that never
//! complete cannot grow memory without bound.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;

use weft_core::frame::{new_frame_id, ChunkInfo, Compression, FrameId, FrameType, MessageFrame};
use weft_core::wire::{content_hash, ChunkRecord, WIRE_VERSION};

/// Consecutive recovery requests for one frame before the receiver gives up
/// asking and lets age-based eviction reclaim the buffer.
pub const MAX_RECOVERY_ATTEMPTS: u8 = 3;

/// Integrity and shape errors raised during reassembly. Integrity failures
/// are silently discarded by the caller — never surfaced to the peer.
#[derive(Debug, thiserror::Error)]
pub enum FramerError {
    #[error("chunk {index} of frame {frame} fails its content hash")]
    ChunkHashMismatch { frame: String, index: u32 },

    #[error("frame {frame} reassembled payload fails the complete hash")]
    PayloadHashMismatch { frame: String },

    #[error("frame {frame} final chunk carried no complete hash")]
    MissingCompleteHash { frame: String },

    #[error("chunk shape conflict in frame {frame}: {reason}")]
    ChunkConflict { frame: String, reason: String },
}

/// Builds outbound frames. Owns the per-pipe sequence counter.
pub struct Framer {
    sequence: AtomicU64,
}

impl Framer {
    pub fn new() -> Self {
        Self {
            sequence: AtomicU64::new(0),
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Split `payload` into `ceil(len / max_chunk_bytes)` chunks. An empty
    /// payload still produces one (empty) chunk so the frame completes.
    pub fn frame(&self, payload: Bytes, max_chunk_bytes: usize) -> MessageFrame {
        assert!(max_chunk_bytes > 0, "chunk size must be positive");

        let total = if payload.is_empty() {
            1
        } else {
            payload.len().div_ceil(max_chunk_bytes)
        } as u32;

        let complete = content_hash(&payload);
        let mut chunks = Vec::with_capacity(total as usize);
        for index in 0..total {
            let start = index as usize * max_chunk_bytes;
            let end = (start + max_chunk_bytes).min(payload.len());
            let piece = &payload[start..end];
            chunks.push(ChunkInfo {
                chunk_index: index,
                total_chunks: total,
                chunk_size: piece.len() as u32,
                chunk_hash: content_hash(piece),
                complete_hash: (index == total - 1).then_some(complete),
            });
        }

        MessageFrame {
            frame_id: new_frame_id(),
            frame_type: FrameType::Data,
            payload,
            headers: BTreeMap::new(),
            timestamp_ms: weft_core::now_millis(),
            compression: Compression::None,
            chunks,
            version: WIRE_VERSION,
            sequence: self.next_sequence(),
        }
    }

    /// Encode every chunk of a frame as a wire record, in index order.
    pub fn records(frame: &MessageFrame) -> Vec<ChunkRecord> {
        let max = frame
            .chunks
            .first()
            .map(|c| c.chunk_size as usize)
            .unwrap_or(0);
        frame
            .chunks
            .iter()
            .map(|info| {
                let start = info.chunk_index as usize * max;
                let end = start + info.chunk_size as usize;
                ChunkRecord {
                    frame_id: frame.frame_id,
                    frame_type: frame.frame_type,
                    compression: frame.compression,
                    sequence: frame.sequence,
                    timestamp_ms: frame.timestamp_ms,
                    chunk_index: info.chunk_index,
                    total_chunks: info.total_chunks,
                    chunk_hash: info.chunk_hash,
                    complete_hash: info.complete_hash,
                    payload: frame.payload.slice(start..end),
                }
            })
            .collect()
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

/// A frame that completed reassembly with all hashes verified.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub frame_id: FrameId,
    pub frame_type: FrameType,
    pub compression: Compression,
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub chunk_count: u32,
    pub payload: Bytes,
}

struct Partial {
    frame_type: FrameType,
    compression: Compression,
    sequence: u64,
    timestamp_ms: u64,
    total_chunks: u32,
    received: BTreeMap<u32, Bytes>,
    complete_hash: Option<[u8; 32]>,
    first_seen: Instant,
    last_chunk_at: Instant,
    recovery_sent_at: Option<Instant>,
    recovery_attempts: u8,
}

/// A frame whose final chunk arrived but some indices are still missing.
pub struct StalledFrame {
    pub frame_id: FrameId,
    pub missing: Vec<u32>,
    pub attempt: u8,
}

/// Buffers chunks by frame id until each frame completes or is evicted.
pub struct Reassembler {
    buffers: HashMap<FrameId, Partial>,
    max_buffers: usize,
    max_age: Duration,
}

impl Reassembler {
    pub fn new(max_buffers: usize, max_age: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            max_buffers: max_buffers.max(1),
            max_age,
        }
    }

    /// Feed one verified-on-arrival chunk. Returns the completed frame once
    /// all chunks are present and the full-payload hash checks out.
    pub fn accept(&mut self, record: ChunkRecord) -> Result<Option<InboundFrame>, FramerError> {
        let frame_hex = hex::encode(record.frame_id);

        if content_hash(&record.payload) != record.chunk_hash {
            return Err(FramerError::ChunkHashMismatch {
                frame: frame_hex,
                index: record.chunk_index,
            });
        }

        if !self.buffers.contains_key(&record.frame_id) {
            self.evict_for_room();
        }
        let partial = self.buffers.entry(record.frame_id).or_insert_with(|| {
            let now = Instant::now();
            Partial {
                frame_type: record.frame_type,
                compression: record.compression,
                sequence: record.sequence,
                timestamp_ms: record.timestamp_ms,
                total_chunks: record.total_chunks,
                received: BTreeMap::new(),
                complete_hash: None,
                first_seen: now,
                last_chunk_at: now,
                recovery_sent_at: None,
                recovery_attempts: 0,
            }
        });

        if partial.total_chunks != record.total_chunks {
            let reason = format!(
                "total_chunks changed from {} to {}",
                partial.total_chunks, record.total_chunks
            );
            self.buffers.remove(&record.frame_id);
            return Err(FramerError::ChunkConflict {
                frame: frame_hex,
                reason,
            });
        }

        // Duplicate chunk: already verified identical content by hash.
        if partial.received.contains_key(&record.chunk_index) {
            return Ok(None);
        }

        partial.received.insert(record.chunk_index, record.payload);
        partial.last_chunk_at = Instant::now();
        if let Some(h) = record.complete_hash {
            partial.complete_hash = Some(h);
        }

        if partial.received.len() as u32 == partial.total_chunks {
            let Some(partial) = self.buffers.remove(&record.frame_id) else {
                return Ok(None);
            };

            let complete_hash = partial.complete_hash.ok_or(FramerError::MissingCompleteHash {
                frame: frame_hex.clone(),
            })?;

            // BTreeMap iteration is index order; indices are contiguous
            // 0..total once the count matches.
            let mut payload = Vec::new();
            for piece in partial.received.values() {
                payload.extend_from_slice(piece);
            }

            if content_hash(&payload) != complete_hash {
                return Err(FramerError::PayloadHashMismatch { frame: frame_hex });
            }

            return Ok(Some(InboundFrame {
                frame_id: record.frame_id,
                frame_type: partial.frame_type,
                compression: partial.compression,
                sequence: partial.sequence,
                timestamp_ms: partial.timestamp_ms,
                chunk_count: partial.total_chunks,
                payload: Bytes::from(payload),
            }));
        }

        Ok(None)
    }

    /// Frames with the final chunk seen, indices still missing, and no
    /// recent chunk or recovery activity within `grace`.
    pub fn stalled(&self, grace: Duration) -> Vec<StalledFrame> {
        self.buffers
            .iter()
            .filter(|(_, p)| p.complete_hash.is_some())
            .filter(|(_, p)| p.last_chunk_at.elapsed() > grace)
            .filter(|(_, p)| {
                p.recovery_sent_at
                    .map(|at| at.elapsed() > grace)
                    .unwrap_or(true)
            })
            .filter(|(_, p)| p.recovery_attempts < MAX_RECOVERY_ATTEMPTS)
            .map(|(id, p)| StalledFrame {
                frame_id: *id,
                missing: (0..p.total_chunks)
                    .filter(|i| !p.received.contains_key(i))
                    .collect(),
                attempt: p.recovery_attempts,
            })
            .filter(|s| !s.missing.is_empty())
            .collect()
    }

    /// Mark that a recovery request went out for this frame.
    pub fn note_recovery_sent(&mut self, frame_id: &FrameId) {
        if let Some(p) = self.buffers.get_mut(frame_id) {
            p.recovery_sent_at = Some(Instant::now());
            p.recovery_attempts += 1;
        }
    }

    /// Evict buffers older than the configured age. Returns evicted count.
    pub fn sweep(&mut self) -> usize {
        let max_age = self.max_age;
        let before = self.buffers.len();
        self.buffers.retain(|id, p| {
            let stale = p.first_seen.elapsed() > max_age;
            if stale {
                tracing::warn!(frame = hex::encode(id), "evicting stale reassembly buffer");
            }
            !stale
        });
        before - self.buffers.len()
    }

    pub fn in_progress(&self) -> usize {
        self.buffers.len()
    }

    /// Oldest buffer goes when a new frame needs room.
    fn evict_for_room(&mut self) {
        if self.buffers.len() < self.max_buffers {
            return;
        }
        if let Some(oldest) = self
            .buffers
            .iter()
            .min_by_key(|(_, p)| p.first_seen)
            .map(|(id, _)| *id)
        {
            tracing::warn!(
                frame = hex::encode(oldest),
                "reassembly buffer cap reached, evicting oldest"
            );
            self.buffers.remove(&oldest);
        }
    }
}
