//! Fault-injection channel drivers.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use weft_core::frame::FrameType;
use weft_core::wire::{ChunkRecord, HEADER_LEN};
use weft_mesh::pipe::driver::ChannelDriver;
use weft_mesh::pipe::memory::MemoryDriver;
use weft_mesh::pipe::PipeError;

/// Flips the last byte of the first payload-carrying unit it transmits,
/// then behaves normally. Models a single burst of medium noise.
pub struct CorruptOnce {
    inner: MemoryDriver,
    done: AtomicBool,
}

impl CorruptOnce {
    pub fn new(inner: MemoryDriver) -> Self {
        Self {
            inner,
            done: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ChannelDriver for CorruptOnce {
    fn unit_budget(&self) -> usize {
        self.inner.unit_budget()
    }

    async fn open(&self) -> Result<(), PipeError> {
        self.inner.open().await
    }

    async fn write_unit(&self, unit: &[u8]) -> Result<(), PipeError> {
        // Only records with a payload are worth corrupting; a bent header
        // would just be dropped at decode.
        if unit.len() > HEADER_LEN && !self.done.swap(true, Ordering::SeqCst) {
            let mut bent = unit.to_vec();
            let last = bent.len() - 1;
            bent[last] ^= 0xff;
            return self.inner.write_unit(&bent).await;
        }
        self.inner.write_unit(unit).await
    }

    async fn read_unit(&self) -> Option<Vec<u8>> {
        self.inner.read_unit().await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

/// Swallows the first acknowledgment it is asked to transmit, then behaves
/// normally. The peer behind it has to retransmit the acked frame.
pub struct DropFirstAck {
    inner: MemoryDriver,
    done: AtomicBool,
}

impl DropFirstAck {
    pub fn new(inner: MemoryDriver) -> Self {
        Self {
            inner,
            done: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ChannelDriver for DropFirstAck {
    fn unit_budget(&self) -> usize {
        self.inner.unit_budget()
    }

    async fn open(&self) -> Result<(), PipeError> {
        self.inner.open().await
    }

    async fn write_unit(&self, unit: &[u8]) -> Result<(), PipeError> {
        if let Ok(record) = ChunkRecord::decode(unit) {
            if record.frame_type == FrameType::Ack && !self.done.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
        }
        self.inner.write_unit(unit).await
    }

    async fn read_unit(&self) -> Option<Vec<u8>> {
        self.inner.read_unit().await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

/// Accepts every write, delivers nothing, and never yields an inbound unit.
/// Counts payload-carrying writes so retry behavior is observable.
pub struct Blackhole {
    budget: usize,
    data_writes: Arc<AtomicU32>,
    // Held so read_unit blocks forever instead of seeing end-of-stream.
    _keep_open: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl Blackhole {
    pub fn new(budget: usize) -> (Self, Arc<AtomicU32>) {
        let (tx, rx) = mpsc::channel(1);
        let counter = Arc::new(AtomicU32::new(0));
        (
            Self {
                budget,
                data_writes: counter.clone(),
                _keep_open: tx,
                rx: Mutex::new(rx),
            },
            counter,
        )
    }
}

#[async_trait]
impl ChannelDriver for Blackhole {
    fn unit_budget(&self) -> usize {
        self.budget
    }

    async fn open(&self) -> Result<(), PipeError> {
        Ok(())
    }

    async fn write_unit(&self, unit: &[u8]) -> Result<(), PipeError> {
        if unit.len() > HEADER_LEN {
            self.data_writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn read_unit(&self) -> Option<Vec<u8>> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) {}
}
