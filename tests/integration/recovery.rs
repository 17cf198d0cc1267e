//! Reliability under injected faults: chunk corruption and total loss.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use weft_core::channel::PipeCapabilities;
use weft_mesh::pipe::driver::DriverPipe;
use weft_mesh::pipe::memory::MemoryDriver;
use weft_mesh::pipe::Pipe;
use weft_mesh::reliability::{ReliabilityConfig, ReliabilityError, ReliabilityManager};

use crate::fault::{Blackhole, CorruptOnce, DropFirstAck};
use crate::{link_with_drivers, quick_reliability, recv_within, start_node};

#[tokio::test]
async fn corrupted_chunk_is_recovered_not_redelivered() {
    let (a, _a_rx) = start_node("rc-a");
    let (b, mut b_rx) = start_node("rc-b");

    let (da, db) = MemoryDriver::pair(368);
    link_with_drivers(&a, &b, CorruptOnce::new(da), db, 368).await;

    let payload: Vec<u8> = (0..2000usize).map(|i| (i % 251) as u8).collect();
    let msg = a.compose(b.local().clone(), Bytes::from(payload.clone()));
    a.send(msg).await.unwrap();

    let got = recv_within(&mut b_rx, Duration::from_secs(5)).await.unwrap();
    assert_eq!(got.payload.as_ref(), payload.as_slice());

    // Recovery must not produce a second copy.
    assert!(recv_within(&mut b_rx, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn lost_ack_is_reacked_without_redelivery() {
    let (a, _a_rx) = start_node("la-a");
    let (b, mut b_rx) = start_node("la-b");

    // The receiver's first ack vanishes, so the sender retransmits a frame
    // the receiver already handed to the application.
    let (da, db) = MemoryDriver::pair(4096);
    link_with_drivers(&a, &b, da, DropFirstAck::new(db), 4096).await;

    let msg = a.compose(b.local().clone(), "ack me twice");
    a.send(msg).await.unwrap();

    let got = recv_within(&mut b_rx, Duration::from_secs(5)).await.unwrap();
    assert_eq!(got.payload.as_ref(), b"ack me twice");
    assert!(recv_within(&mut b_rx, Duration::from_millis(500)).await.is_none());
}

#[tokio::test]
async fn lost_channel_exhausts_retries_on_the_wire() {
    let (blackhole, writes) = Blackhole::new(4096);
    let pipe = DriverPipe::new(Arc::new(blackhole), PipeCapabilities::loopback(4096));
    pipe.connect().await.unwrap();

    let config = ReliabilityConfig {
        max_retries: 2,
        retry_timeout: Duration::from_millis(50),
        ..quick_reliability()
    };
    let (handle, _rx) = ReliabilityManager::spawn(Arc::new(pipe), config);

    let err = handle.send(Bytes::from_static(b"into the void")).await.unwrap_err();
    match err {
        ReliabilityError::DeliveryTimeout { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected DeliveryTimeout, got {other}"),
    }
    // One initial transmission plus max_retries retransmissions.
    assert_eq!(writes.load(Ordering::SeqCst), 3);
}
