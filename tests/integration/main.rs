//! Weft integration harness.
//!
//! Nodes run in-process and are linked over memory-pipe pairs, so the full
//! stack (framing, reliability, routing, mesh forwarding) is exercised
//! without touching the host network. Socket pipes get their own coverage
//! in the weft-mesh unit tests against localhost.

mod fault;
mod framing;
mod meshnet;
mod recovery;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use weft_core::channel::PipeCapabilities;
use weft_core::config::MeshConfig;
use weft_core::frame::NetworkMessage;
use weft_mesh::pipe::driver::{ChannelDriver, DriverPipe};
use weft_mesh::pipe::memory::MemoryDriver;
use weft_mesh::pipe::{Pipe, PipeRegistry};
use weft_mesh::reliability::{ReliabilityConfig, ReliabilityManager};
use weft_mesh::{MeshHandle, MeshNode};

/// Reliability tuned for test pacing: fast retries and recovery, defaults
/// elsewhere.
pub fn quick_reliability() -> ReliabilityConfig {
    ReliabilityConfig {
        retry_timeout: Duration::from_millis(300),
        recovery_grace: Duration::from_millis(100),
        ..ReliabilityConfig::default()
    }
}

pub fn start_node(id: &str) -> (MeshHandle, mpsc::Receiver<NetworkMessage>) {
    let mut config = MeshConfig::default();
    config.node.id = id.into();
    MeshNode::start(&config, Arc::new(PipeRegistry::new()), None)
}

/// Link two nodes over a fresh memory-pipe pair with `budget`-byte units.
pub async fn link(a: &MeshHandle, b: &MeshHandle, budget: usize) {
    let (da, db) = MemoryDriver::pair(budget);
    link_with_drivers(a, b, da, db, budget).await;
}

/// Link two nodes over caller-supplied drivers (fault injection hooks).
pub async fn link_with_drivers<A, B>(a: &MeshHandle, b: &MeshHandle, da: A, db: B, budget: usize)
where
    A: ChannelDriver + 'static,
    B: ChannelDriver + 'static,
{
    let pa = DriverPipe::new(Arc::new(da), PipeCapabilities::loopback(budget as u32));
    let pb = DriverPipe::new(Arc::new(db), PipeCapabilities::loopback(budget as u32));
    pa.connect().await.unwrap();
    pb.connect().await.unwrap();

    let (ha, rx_a) = ReliabilityManager::spawn(Arc::new(pa), quick_reliability());
    let (hb, rx_b) = ReliabilityManager::spawn(Arc::new(pb), quick_reliability());

    a.attach_link(b.local().clone(), ha, rx_a).await.unwrap();
    b.attach_link(a.local().clone(), hb, rx_b).await.unwrap();
}

/// Receive with a deadline; `None` means nothing arrived in time.
pub async fn recv_within(
    rx: &mut mpsc::Receiver<NetworkMessage>,
    deadline: Duration,
) -> Option<NetworkMessage> {
    tokio::time::timeout(deadline, rx.recv())
        .await
        .ok()
        .flatten()
}
