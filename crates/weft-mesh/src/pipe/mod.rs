//! Pipe — one transport endpoint bound to a physical channel kind.
//!
//! Every channel kind implements the same contract: connect, send one
//! wire record, receive the next inbound record, report status and static
//! capabilities, shut down. Side effects are confined to the underlying
//! medium; pipes of different kinds share no state.

pub mod driver;
pub mod memory;
pub mod socket;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;

use weft_core::channel::{ChannelKind, PipeCapabilities, PipeConfiguration};

/// Pipe lifecycle: Disconnected → Connecting → Connected → (Error |
/// Disconnected). Reconnection re-enters Connecting from any terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipeState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Error = 3,
}

impl PipeState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Error,
            _ => Self::Disconnected,
        }
    }
}

/// Point-in-time pipe status.
#[derive(Debug, Clone)]
pub struct PipeStatus {
    pub state: PipeState,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Smoothed round-trip estimate, fed by acknowledgment timing.
    pub rtt: Option<Duration>,
    /// Time since the current connection was established.
    pub uptime: Option<Duration>,
}

/// Channel errors. Reported to the caller of connect/send; the pipe is left
/// in `Error` state on medium failure.
#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("pipe is not connected")]
    NotConnected,

    #[error("medium unavailable: {0}")]
    MediumUnavailable(String),

    #[error("record of {len} bytes exceeds medium budget of {max}")]
    TooLarge { len: usize, max: usize },

    #[error("channel closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The uniform transport endpoint contract.
#[async_trait]
pub trait Pipe: Send + Sync {
    /// Bring the medium up: Disconnected → Connecting → Connected.
    /// Failure leaves the pipe in `Error` state.
    async fn connect(&self) -> Result<(), PipeError>;

    /// Transmit one wire record. Only valid in `Connected` state.
    async fn send(&self, record: Bytes) -> Result<(), PipeError>;

    /// Next inbound record. `None` means the current connection ended; the
    /// sequence restarts after a successful reconnect.
    async fn recv(&self) -> Option<Bytes>;

    fn status(&self) -> PipeStatus;

    /// Pure and constant for the lifetime of the pipe.
    fn capabilities(&self) -> PipeCapabilities;

    /// Feed an acknowledgment round-trip into the RTT estimate.
    fn observe_rtt(&self, rtt: Duration);

    /// Force the pipe into `Error` state (dead-channel detection).
    fn mark_error(&self);

    /// Release channel resources. Idempotent.
    async fn shutdown(&self);
}

// ── Shared metrics ────────────────────────────────────────────────────────────

/// State and counters shared by every pipe implementation.
pub struct PipeMetrics {
    state: AtomicU8,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    rtt_micros: AtomicU64,
    connected_at: Mutex<Option<Instant>>,
}

impl PipeMetrics {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(PipeState::Disconnected as u8),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            rtt_micros: AtomicU64::new(0),
            connected_at: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PipeState {
        PipeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: PipeState) {
        self.state.store(state as u8, Ordering::Release);
        let mut at = self.connected_at.lock().unwrap_or_else(|e| e.into_inner());
        *at = if state == PipeState::Connected {
            Some(Instant::now())
        } else {
            None
        };
    }

    pub fn add_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// EWMA with 1/8 gain, the classic smoothed-RTT weighting.
    pub fn observe_rtt(&self, rtt: Duration) {
        let sample = rtt.as_micros() as u64;
        let prev = self.rtt_micros.load(Ordering::Relaxed);
        let next = if prev == 0 {
            sample
        } else {
            prev - prev / 8 + sample / 8
        };
        self.rtt_micros.store(next, Ordering::Relaxed);
    }

    pub fn status(&self) -> PipeStatus {
        let rtt = self.rtt_micros.load(Ordering::Relaxed);
        let uptime = self
            .connected_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|t| t.elapsed());
        PipeStatus {
            state: self.state(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            rtt: (rtt > 0).then(|| Duration::from_micros(rtt)),
            uptime,
        }
    }
}

impl Default for PipeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// ── Factory registry ──────────────────────────────────────────────────────────

/// Builds a pipe for one channel kind from its configuration.
pub trait PipeFactory: Send + Sync {
    fn build(&self, config: &PipeConfiguration) -> Result<Arc<dyn Pipe>, PipeError>;
}

/// Explicitly constructed factory registry — passed in wherever pipes are
/// built, so multiple independent nodes in one process never share hidden
/// state.
#[derive(Default)]
pub struct PipeRegistry {
    factories: HashMap<ChannelKind, Arc<dyn PipeFactory>>,
}

impl PipeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ChannelKind, factory: Arc<dyn PipeFactory>) {
        self.factories.insert(kind, factory);
    }

    pub fn supports(&self, kind: ChannelKind) -> bool {
        self.factories.contains_key(&kind)
    }

    pub fn build(&self, config: &PipeConfiguration) -> Result<Arc<dyn Pipe>, PipeError> {
        match self.factories.get(&config.kind()) {
            Some(f) => f.build(config),
            None => Err(PipeError::MediumUnavailable(format!(
                "no driver registered for {} channel",
                config.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_track_state_transitions() {
        let m = PipeMetrics::new();
        assert_eq!(m.state(), PipeState::Disconnected);
        assert!(m.status().uptime.is_none());

        m.set_state(PipeState::Connecting);
        m.set_state(PipeState::Connected);
        assert_eq!(m.state(), PipeState::Connected);
        assert!(m.status().uptime.is_some());

        m.set_state(PipeState::Error);
        assert!(m.status().uptime.is_none());
    }

    #[test]
    fn rtt_estimate_smooths() {
        let m = PipeMetrics::new();
        assert!(m.status().rtt.is_none());

        m.observe_rtt(Duration::from_millis(80));
        assert_eq!(m.status().rtt, Some(Duration::from_millis(80)));

        // A single outlier should barely move the estimate.
        m.observe_rtt(Duration::from_millis(800));
        let rtt = m.status().rtt.unwrap();
        assert!(rtt > Duration::from_millis(80));
        assert!(rtt < Duration::from_millis(200));
    }

    #[test]
    fn registry_rejects_unregistered_kind() {
        let registry = PipeRegistry::new();
        let cfg = weft_core::PipeConfiguration::socket("p1", "127.0.0.1:1");
        assert!(matches!(
            registry.build(&cfg),
            Err(PipeError::MediumUnavailable(_))
        ));
    }
}
