//! In-process loopback driver.
//!
//! Two crossed bounded channels standing in for a physical medium. Used by
//! unit and integration tests, and by hosts that run several mesh nodes in
//! one process.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::driver::ChannelDriver;
use super::PipeError;

const CHANNEL_DEPTH: usize = 1024;

pub struct MemoryDriver {
    budget: usize,
    // Dropped on close so the peer's read side sees end-of-stream.
    tx: std::sync::Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl MemoryDriver {
    /// A linked pair: units written to one end are read from the other.
    pub fn pair(budget: usize) -> (MemoryDriver, MemoryDriver) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_DEPTH);
        (
            MemoryDriver {
                budget,
                tx: std::sync::Mutex::new(Some(a_tx)),
                rx: Mutex::new(b_rx),
            },
            MemoryDriver {
                budget,
                tx: std::sync::Mutex::new(Some(b_tx)),
                rx: Mutex::new(a_rx),
            },
        )
    }

    fn sender(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ChannelDriver for MemoryDriver {
    fn unit_budget(&self) -> usize {
        self.budget
    }

    async fn open(&self) -> Result<(), PipeError> {
        match self.sender() {
            Some(tx) if !tx.is_closed() => Ok(()),
            _ => Err(PipeError::MediumUnavailable("peer end dropped".into())),
        }
    }

    async fn write_unit(&self, unit: &[u8]) -> Result<(), PipeError> {
        let tx = self.sender().ok_or(PipeError::Closed)?;
        tx.send(unit.to_vec()).await.map_err(|_| PipeError::Closed)
    }

    async fn read_unit(&self) -> Option<Vec<u8>> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.rx.lock().await.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn units_cross_the_pair() {
        let (a, b) = MemoryDriver::pair(256);
        a.write_unit(b"one").await.unwrap();
        a.write_unit(b"two").await.unwrap();
        assert_eq!(b.read_unit().await.unwrap(), b"one");
        assert_eq!(b.read_unit().await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn dropped_peer_fails_open_and_write() {
        let (a, b) = MemoryDriver::pair(256);
        drop(b);
        assert!(a.open().await.is_err());
        assert!(matches!(
            a.write_unit(b"x").await,
            Err(PipeError::Closed)
        ));
    }
}
