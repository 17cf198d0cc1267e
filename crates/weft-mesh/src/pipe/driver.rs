//! Medium drivers — the only channel-specific code.
//!
//! A `ChannelDriver` maps raw bytes onto one medium's native unit: a single
//! optical frame's byte budget, a radio characteristic write, one near-field
//! exchange. `DriverPipe` is the medium-agnostic adapter that turns any
//! driver into a full [`Pipe`]; everything above it never sees the medium.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use weft_core::channel::PipeCapabilities;

use super::{Pipe, PipeError, PipeMetrics, PipeState, PipeStatus};

/// The interface a physical-layer driver must satisfy. Implementations are
/// host-supplied; this crate ships only the in-process loopback driver.
#[async_trait]
pub trait ChannelDriver: Send + Sync {
    /// Largest unit the medium can carry in one exchange.
    fn unit_budget(&self) -> usize;

    /// Bring the medium up.
    async fn open(&self) -> Result<(), PipeError>;

    /// Transmit one unit. The slice fits within `unit_budget`.
    async fn write_unit(&self, unit: &[u8]) -> Result<(), PipeError>;

    /// Next inbound unit, or `None` when the medium is down.
    async fn read_unit(&self) -> Option<Vec<u8>>;

    /// Release the medium. Idempotent.
    async fn close(&self);
}

/// Adapter from a [`ChannelDriver`] to the [`Pipe`] contract.
///
/// One wire record per medium unit: the reliability layer sizes chunks from
/// `capabilities().max_message_bytes`, so a record always fits one unit.
pub struct DriverPipe {
    driver: Arc<dyn ChannelDriver>,
    caps: PipeCapabilities,
    metrics: PipeMetrics,
}

impl DriverPipe {
    pub fn new(driver: Arc<dyn ChannelDriver>, caps: PipeCapabilities) -> Self {
        Self {
            driver,
            caps,
            metrics: PipeMetrics::new(),
        }
    }
}

#[async_trait]
impl Pipe for DriverPipe {
    async fn connect(&self) -> Result<(), PipeError> {
        self.metrics.set_state(PipeState::Connecting);
        match self.driver.open().await {
            Ok(()) => {
                self.metrics.set_state(PipeState::Connected);
                Ok(())
            }
            Err(e) => {
                self.metrics.set_state(PipeState::Error);
                Err(e)
            }
        }
    }

    async fn send(&self, record: Bytes) -> Result<(), PipeError> {
        if self.metrics.state() != PipeState::Connected {
            return Err(PipeError::NotConnected);
        }
        let budget = self.driver.unit_budget();
        if record.len() > budget {
            return Err(PipeError::TooLarge {
                len: record.len(),
                max: budget,
            });
        }
        match self.driver.write_unit(&record).await {
            Ok(()) => {
                self.metrics.add_sent(record.len());
                Ok(())
            }
            Err(e) => {
                self.metrics.set_state(PipeState::Error);
                Err(e)
            }
        }
    }

    async fn recv(&self) -> Option<Bytes> {
        let unit = self.driver.read_unit().await?;
        self.metrics.add_received(unit.len());
        Some(Bytes::from(unit))
    }

    fn status(&self) -> PipeStatus {
        self.metrics.status()
    }

    fn capabilities(&self) -> PipeCapabilities {
        self.caps.clone()
    }

    fn observe_rtt(&self, rtt: Duration) {
        self.metrics.observe_rtt(rtt);
    }

    fn mark_error(&self) {
        self.metrics.set_state(PipeState::Error);
    }

    async fn shutdown(&self) {
        self.driver.close().await;
        self.metrics.set_state(PipeState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::memory::MemoryDriver;

    #[tokio::test]
    async fn send_requires_connected_state() {
        let (a, _b) = MemoryDriver::pair(1024);
        let pipe = DriverPipe::new(Arc::new(a), PipeCapabilities::loopback(1024));

        let err = pipe.send(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, PipeError::NotConnected));

        pipe.connect().await.unwrap();
        pipe.send(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(pipe.status().bytes_sent, 1);
    }

    #[tokio::test]
    async fn oversized_record_rejected() {
        let (a, _b) = MemoryDriver::pair(8);
        let pipe = DriverPipe::new(Arc::new(a), PipeCapabilities::loopback(8));
        pipe.connect().await.unwrap();

        let err = pipe.send(Bytes::from(vec![0u8; 9])).await.unwrap_err();
        assert!(matches!(err, PipeError::TooLarge { len: 9, max: 8 }));
    }

    #[tokio::test]
    async fn records_cross_a_driver_pair() {
        let (a, b) = MemoryDriver::pair(1024);
        let pa = DriverPipe::new(Arc::new(a), PipeCapabilities::loopback(1024));
        let pb = DriverPipe::new(Arc::new(b), PipeCapabilities::loopback(1024));
        pa.connect().await.unwrap();
        pb.connect().await.unwrap();

        pa.send(Bytes::from_static(b"over the wire")).await.unwrap();
        let got = pb.recv().await.unwrap();
        assert_eq!(got.as_ref(), b"over the wire");
        assert_eq!(pb.status().bytes_received, 13);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_closes_peer() {
        let (a, b) = MemoryDriver::pair(64);
        let pa = DriverPipe::new(Arc::new(a), PipeCapabilities::loopback(64));
        let pb = DriverPipe::new(Arc::new(b), PipeCapabilities::loopback(64));
        pa.connect().await.unwrap();
        pb.connect().await.unwrap();

        pa.shutdown().await;
        pa.shutdown().await;
        assert_eq!(pa.status().state, PipeState::Disconnected);

        // Peer sees end-of-stream.
        assert!(pb.recv().await.is_none());
    }
}
