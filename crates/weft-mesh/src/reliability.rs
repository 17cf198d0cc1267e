//! Reliability manager — ack/retry delivery over one pipe.
//!
//! One manager per pipe. Outbound frames are chunked, transmitted, and
//! retransmitted until acknowledged or the retry budget runs out. Inbound
//! records are reassembled, verified, delivered exactly once, and
//! acknowledged; missing chunks are chased with recovery requests instead
//! of full resends. Heartbeats cover idle periods so a dead channel is
//! noticed without application traffic; the peer acks them, and those
//! round trips feed the RTT estimate on otherwise quiet links.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};

use weft_core::config::TransportConfig;
use weft_core::frame::{new_frame_id, Acknowledgment, FrameId, FrameType, RecoveryRequest};
use weft_core::now_millis;
use weft_core::wire::{ChunkRecord, HEADER_LEN};

use crate::framer::{Framer, Reassembler};
use crate::pipe::{Pipe, PipeError, PipeStatus};
use crate::seen::SeenCache;

/// Frames remembered as already delivered, for duplicate re-acking.
const DELIVERED_CACHE: usize = 512;

#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    /// Retransmissions after the initial attempt.
    pub max_retries: u32,
    pub retry_timeout: Duration,
    pub recovery_grace: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reassembly_max_buffers: usize,
    pub reassembly_max_age: Duration,
    pub max_chunk_bytes: usize,
    pub delivery_queue: usize,
}

impl ReliabilityConfig {
    pub fn from_transport(t: &TransportConfig) -> Self {
        Self {
            max_retries: t.max_retries,
            retry_timeout: Duration::from_millis(t.retry_timeout_ms),
            recovery_grace: Duration::from_millis(t.recovery_grace_ms),
            heartbeat_interval: Duration::from_secs(t.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(t.heartbeat_timeout_secs),
            reassembly_max_buffers: t.reassembly_max_buffers,
            reassembly_max_age: Duration::from_secs(t.reassembly_max_age_secs),
            max_chunk_bytes: t.max_chunk_bytes,
            delivery_queue: t.delivery_queue,
        }
    }
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self::from_transport(&TransportConfig::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReliabilityError {
    #[error("frame {frame} not acknowledged after {attempts} attempts")]
    DeliveryTimeout { frame: String, attempts: u32 },

    #[error(transparent)]
    Pipe(#[from] PipeError),

    #[error("reliability manager closed")]
    Closed,
}

/// Feedback routed from the receive loop to a waiting send call.
enum ControlEvent {
    Ack(Acknowledgment),
    Recovery(RecoveryRequest),
}

struct Shared {
    pipe: Arc<dyn Pipe>,
    config: ReliabilityConfig,
    framer: Framer,
    pending: DashMap<FrameId, mpsc::Sender<ControlEvent>>,
    /// Heartbeats awaiting their ack, by frame id. Pruned on timeout.
    heartbeats: DashMap<FrameId, Instant>,
    last_send_ms: AtomicU64,
    last_heard_ms: AtomicU64,
    session: String,
    shutdown: broadcast::Sender<()>,
}

impl Shared {
    async fn transmit(&self, record: &ChunkRecord) -> Result<(), PipeError> {
        self.pipe.send(record.encode()).await?;
        self.last_send_ms.store(now_millis(), Ordering::Relaxed);
        Ok(())
    }

    /// Transmit a control record, logging instead of failing: control-plane
    /// losses are recovered by the peer's own timers.
    async fn transmit_control(&self, record: &ChunkRecord) {
        if let Err(e) = self.transmit(record).await {
            tracing::debug!(error = %e, "control record not sent");
        }
    }

    async fn send_ack(&self, frame_id: FrameId, received: Vec<u32>) {
        let ack = Acknowledgment {
            frame_id,
            success: true,
            error: None,
            timestamp_ms: now_millis(),
            received,
        };
        let payload = Bytes::from(serde_json::to_vec(&ack).unwrap_or_default());
        let record = ChunkRecord::single(
            FrameType::Ack,
            frame_id,
            self.framer.next_sequence(),
            payload,
        );
        self.transmit_control(&record).await;
    }
}

pub struct ReliabilityManager;

impl ReliabilityManager {
    /// Start a manager over `pipe`. Returns the send handle and the stream
    /// of fully verified inbound payloads. The stream ends when the pipe
    /// dies or the manager shuts down.
    pub fn spawn(
        pipe: Arc<dyn Pipe>,
        config: ReliabilityConfig,
    ) -> (ReliabilityHandle, mpsc::Receiver<Bytes>) {
        let (delivered_tx, delivered_rx) = mpsc::channel(config.delivery_queue.max(1));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let now = now_millis();
        let shared = Arc::new(Shared {
            pipe,
            config,
            framer: Framer::new(),
            pending: DashMap::new(),
            heartbeats: DashMap::new(),
            last_send_ms: AtomicU64::new(now),
            last_heard_ms: AtomicU64::new(now),
            session: hex::encode(rand::random::<[u8; 8]>()),
            shutdown: shutdown_tx,
        });

        tokio::spawn(run(shared.clone(), delivered_tx, shutdown_rx));

        (ReliabilityHandle { inner: shared }, delivered_rx)
    }
}

#[derive(Clone)]
pub struct ReliabilityHandle {
    inner: Arc<Shared>,
}

impl ReliabilityHandle {
    /// Deliver `payload` reliably. Resolves Ok once the peer acknowledged
    /// the complete frame, or with an error after the retry budget is spent.
    pub async fn send(&self, payload: Bytes) -> Result<(), ReliabilityError> {
        let shared = &self.inner;

        let caps = shared.pipe.capabilities();
        let record_budget = (caps.max_message_bytes as usize)
            .saturating_sub(HEADER_LEN)
            .max(1);
        // A misconfigured zero chunk size degrades to one-byte chunks
        // instead of taking the process down.
        let chunk_bytes = shared.config.max_chunk_bytes.min(record_budget).max(1);

        let frame = shared.framer.frame(payload, chunk_bytes);
        let records = Framer::records(&frame);
        let frame_hex = hex::encode(frame.frame_id);

        let (tx, mut rx) = mpsc::channel(8);
        shared.pending.insert(frame.frame_id, tx);
        let result = self.drive(&records, &mut rx, &frame_hex).await;
        shared.pending.remove(&frame.frame_id);
        result
    }

    /// Transmit-and-wait loop for one frame.
    async fn drive(
        &self,
        records: &[ChunkRecord],
        rx: &mut mpsc::Receiver<ControlEvent>,
        frame_hex: &str,
    ) -> Result<(), ReliabilityError> {
        let shared = &self.inner;
        let max_attempts = shared.config.max_retries + 1;
        let mut attempts: u32 = 1;

        for record in records {
            shared.transmit(record).await?;
        }
        let mut sent_at = Instant::now();

        loop {
            match tokio::time::timeout(shared.config.retry_timeout, rx.recv()).await {
                Ok(Some(ControlEvent::Ack(ack))) if ack.success => {
                    shared.pipe.observe_rtt(sent_at.elapsed());
                    tracing::debug!(frame = frame_hex, attempts, "frame acknowledged");
                    return Ok(());
                }
                Ok(Some(ControlEvent::Ack(ack))) => {
                    let have: HashSet<u32> = ack.received.iter().copied().collect();
                    let lacking: Vec<&ChunkRecord> = records
                        .iter()
                        .filter(|r| !have.contains(&r.chunk_index))
                        .collect();
                    if lacking.is_empty() {
                        continue;
                    }
                    attempts += 1;
                    if attempts > max_attempts {
                        return Err(self.timed_out(frame_hex, max_attempts));
                    }
                    tracing::debug!(
                        frame = frame_hex,
                        missing = lacking.len(),
                        attempt = attempts,
                        "partial acknowledgment, resending"
                    );
                    for record in lacking {
                        shared.transmit(record).await?;
                    }
                    sent_at = Instant::now();
                }
                Ok(Some(ControlEvent::Recovery(req))) => {
                    attempts += 1;
                    if attempts > max_attempts {
                        return Err(self.timed_out(frame_hex, max_attempts));
                    }
                    tracing::debug!(
                        frame = frame_hex,
                        missing = req.missing.len(),
                        attempt = attempts,
                        "recovery requested, resending chunks"
                    );
                    for index in req.missing {
                        if let Some(record) = records.get(index as usize) {
                            shared.transmit(record).await?;
                        }
                    }
                    sent_at = Instant::now();
                }
                Ok(None) => return Err(ReliabilityError::Closed),
                Err(_) => {
                    attempts += 1;
                    if attempts > max_attempts {
                        return Err(self.timed_out(frame_hex, max_attempts));
                    }
                    tracing::debug!(frame = frame_hex, attempt = attempts, "retransmitting");
                    for record in records {
                        shared.transmit(record).await?;
                    }
                    sent_at = Instant::now();
                }
            }
        }
    }

    fn timed_out(&self, frame_hex: &str, attempts: u32) -> ReliabilityError {
        tracing::warn!(frame = frame_hex, attempts, "delivery timed out");
        ReliabilityError::DeliveryTimeout {
            frame: frame_hex.to_string(),
            attempts,
        }
    }

    pub fn status(&self) -> PipeStatus {
        self.inner.pipe.status()
    }

    pub fn pipe(&self) -> Arc<dyn Pipe> {
        self.inner.pipe.clone()
    }

    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(());
        self.inner.pipe.shutdown().await;
    }
}

// ── Receive side ──────────────────────────────────────────────────────────────

async fn run(
    shared: Arc<Shared>,
    delivered: mpsc::Sender<Bytes>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut reassembler = Reassembler::new(
        shared.config.reassembly_max_buffers,
        shared.config.reassembly_max_age,
    );
    let mut recently = SeenCache::new(DELIVERED_CACHE);

    let tick = shared
        .config
        .recovery_grace
        .min(shared.config.heartbeat_interval)
        .max(Duration::from_millis(50));
    let mut housekeeping = tokio::time::interval(tick);
    housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            inbound = shared.pipe.recv() => {
                let Some(bytes) = inbound else {
                    tracing::info!("pipe receive stream ended");
                    break;
                };
                shared.last_heard_ms.store(now_millis(), Ordering::Relaxed);
                handle_record(&shared, &bytes, &mut reassembler, &mut recently, &delivered).await;
            }
            _ = housekeeping.tick() => {
                if !housekeep(&shared, &mut reassembler).await {
                    break;
                }
            }
        }
    }
    // Dropping `delivered` signals link-down to whoever consumes this pipe.
}

async fn handle_record(
    shared: &Shared,
    bytes: &[u8],
    reassembler: &mut Reassembler,
    recently: &mut SeenCache<FrameId>,
    delivered: &mpsc::Sender<Bytes>,
) {
    let record = match ChunkRecord::decode(bytes) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, len = bytes.len(), "dropping undecodable record");
            return;
        }
    };

    match record.frame_type {
        FrameType::Data => {
            // A duplicate of a delivered frame means the peer missed our
            // ack. Re-ack, never re-deliver.
            if recently.contains(&record.frame_id) {
                let total = record.total_chunks;
                shared
                    .send_ack(record.frame_id, (0..total).collect())
                    .await;
                return;
            }
            match reassembler.accept(record) {
                Ok(Some(frame)) => {
                    recently.insert(frame.frame_id);
                    shared
                        .send_ack(frame.frame_id, (0..frame.chunk_count).collect())
                        .await;
                    if let Err(mpsc::error::TrySendError::Full(_)) =
                        delivered.try_send(frame.payload)
                    {
                        tracing::warn!(
                            frame = hex::encode(frame.frame_id),
                            "delivery queue full, dropping frame"
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    // Integrity failures are silent on the wire: the sender's
                    // retry or our recovery request covers the gap.
                    tracing::warn!(error = %e, "discarding chunk");
                }
            }
        }
        FrameType::Ack => match serde_json::from_slice::<Acknowledgment>(&record.payload) {
            Ok(ack) => {
                if let Some((_, sent_at)) = shared.heartbeats.remove(&ack.frame_id) {
                    shared.pipe.observe_rtt(sent_at.elapsed());
                } else {
                    route_event(shared, ack.frame_id, ControlEvent::Ack(ack));
                }
            }
            Err(e) => tracing::warn!(error = %e, "malformed acknowledgment payload"),
        },
        FrameType::Control => match serde_json::from_slice::<RecoveryRequest>(&record.payload) {
            Ok(req) => route_event(shared, req.frame_id, ControlEvent::Recovery(req)),
            Err(e) => tracing::warn!(error = %e, "malformed recovery payload"),
        },
        FrameType::Heartbeat => {
            tracing::trace!(session = %shared.session, "heartbeat received");
            // The ack closes the loop: the sender times the round trip.
            shared.send_ack(record.frame_id, vec![0]).await;
        }
        FrameType::Error => {
            tracing::warn!(
                detail = %String::from_utf8_lossy(&record.payload),
                "peer reported an error"
            );
        }
    }
}

fn route_event(shared: &Shared, frame_id: FrameId, event: ControlEvent) {
    match shared.pending.get(&frame_id) {
        Some(tx) => {
            let _ = tx.try_send(event);
        }
        None => {
            tracing::debug!(
                frame = hex::encode(frame_id),
                "control event for unknown frame"
            );
        }
    }
}

/// Periodic duties: dead-channel detection, idle heartbeats, chunk
/// recovery, buffer aging. Returns false when the channel is dead.
async fn housekeep(shared: &Shared, reassembler: &mut Reassembler) -> bool {
    let now = now_millis();

    let silent_for = now.saturating_sub(shared.last_heard_ms.load(Ordering::Relaxed));
    if silent_for > shared.config.heartbeat_timeout.as_millis() as u64 {
        tracing::warn!(silent_ms = silent_for, "peer silent past timeout, marking pipe dead");
        shared.pipe.mark_error();
        return false;
    }

    let idle_for = now.saturating_sub(shared.last_send_ms.load(Ordering::Relaxed));
    if idle_for >= shared.config.heartbeat_interval.as_millis() as u64 {
        let frame_id = new_frame_id();
        let record = ChunkRecord::single(
            FrameType::Heartbeat,
            frame_id,
            shared.framer.next_sequence(),
            Bytes::new(),
        );
        shared.heartbeats.insert(frame_id, Instant::now());
        shared.transmit_control(&record).await;
    }
    shared
        .heartbeats
        .retain(|_, sent_at| sent_at.elapsed() < shared.config.heartbeat_timeout);

    for stalled in reassembler.stalled(shared.config.recovery_grace) {
        let req = RecoveryRequest {
            frame_id: stalled.frame_id,
            missing: stalled.missing.clone(),
            timestamp_ms: now,
            session: shared.session.clone(),
        };
        tracing::debug!(
            frame = hex::encode(stalled.frame_id),
            missing = stalled.missing.len(),
            attempt = stalled.attempt + 1,
            "requesting chunk recovery"
        );
        let payload = Bytes::from(serde_json::to_vec(&req).unwrap_or_default());
        let record = ChunkRecord::single(
            FrameType::Control,
            stalled.frame_id,
            shared.framer.next_sequence(),
            payload,
        );
        shared.transmit_control(&record).await;
        reassembler.note_recovery_sent(&stalled.frame_id);
    }

    reassembler.sweep();
    true
}
