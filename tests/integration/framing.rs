//! End-to-end framing: payloads of many shapes cross a small-unit link
//! intact.

use std::time::Duration;

use bytes::Bytes;

use crate::{link, recv_within, start_node};

#[tokio::test]
async fn payload_shapes_survive_small_units() {
    let (a, _a_rx) = start_node("fr-a");
    let (b, mut b_rx) = start_node("fr-b");
    // 368-byte units leave 256 payload bytes per record.
    link(&a, &b, 368).await;

    for size in [0usize, 1, 255, 256, 257, 4096] {
        let payload: Vec<u8> = (0..size).map(|i| (i * 31) as u8).collect();
        let msg = a.compose(b.local().clone(), Bytes::from(payload.clone()));
        a.send(msg).await.unwrap();

        let got = recv_within(&mut b_rx, Duration::from_secs(5))
            .await
            .unwrap_or_else(|| panic!("{size}-byte payload never arrived"));
        assert_eq!(got.payload.as_ref(), payload.as_slice(), "size {size}");
    }
}

#[tokio::test]
async fn ten_kilobytes_cross_intact() {
    let (a, _a_rx) = start_node("fr-c");
    let (b, mut b_rx) = start_node("fr-d");
    link(&a, &b, 368).await;

    let payload = Bytes::from(vec![0xc3u8; 10 * 1024]);
    let msg = a.compose(b.local().clone(), payload.clone());
    a.send(msg).await.unwrap();

    let got = recv_within(&mut b_rx, Duration::from_secs(5)).await.unwrap();
    assert_eq!(got.payload.len(), 10 * 1024);
    // NetworkMessage JSON wrapping inflates the frame, but the original
    // bytes must come back exactly.
    assert_eq!(got.payload, payload);
}
