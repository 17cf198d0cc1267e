//! Multi-node topologies: routed forwarding, broadcast flooding, hop
//! budgets, and duplicate suppression.

use std::time::Duration;

use weft_core::peer::PeerAddress;
use weft_mesh::MeshError;

use crate::{link, recv_within, start_node};

const UNIT: usize = 8192;

#[tokio::test]
async fn routed_message_crosses_two_hops_exactly_once() {
    let (x, _x_rx) = start_node("mh-x");
    let (z, _z_rx) = start_node("mh-z");
    let (y, mut y_rx) = start_node("mh-y");
    link(&x, &z, UNIT).await;
    link(&z, &y, UNIT).await;

    // X knows Y only through Z.
    x.learn_route("mh-y", "mh-z", 2).await;

    let msg = x.compose(PeerAddress::new("mh-y", "", 0), "across the relay");
    x.send(msg).await.unwrap();

    let got = recv_within(&mut y_rx, Duration::from_secs(5)).await.unwrap();
    assert_eq!(got.payload.as_ref(), b"across the relay");
    assert_eq!(got.source.id, "mh-x");

    assert!(recv_within(&mut y_rx, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn no_route_no_link_is_unreachable() {
    let (x, _x_rx) = start_node("ur-x");
    let (z, _z_rx) = start_node("ur-z");
    link(&x, &z, UNIT).await;

    let msg = x.compose(PeerAddress::new("ur-y", "", 0), "nowhere to go");
    assert!(matches!(
        x.send(msg).await,
        Err(MeshError::Unreachable(d)) if d == "ur-y"
    ));
}

#[tokio::test]
async fn broadcast_ttl_two_stops_after_two_hops() {
    let (a, _a_rx) = start_node("bc-a");
    let (b, mut b_rx) = start_node("bc-b");
    let (c, mut c_rx) = start_node("bc-c");
    let (d, mut d_rx) = start_node("bc-d");
    link(&a, &b, UNIT).await;
    link(&b, &c, UNIT).await;
    link(&c, &d, UNIT).await;

    let mut msg = a.compose(PeerAddress::broadcast(), "two hops only");
    msg.ttl = 2;
    a.broadcast(msg).await.unwrap();

    assert!(recv_within(&mut b_rx, Duration::from_secs(5)).await.is_some());
    assert!(recv_within(&mut c_rx, Duration::from_secs(5)).await.is_some());
    // Three hops out: past the budget.
    assert!(recv_within(&mut d_rx, Duration::from_millis(500)).await.is_none());
}

#[tokio::test]
async fn diamond_topology_delivers_once_per_node() {
    let (a, _a_rx) = start_node("dm-a");
    let (b, mut b_rx) = start_node("dm-b");
    let (c, mut c_rx) = start_node("dm-c");
    let (d, mut d_rx) = start_node("dm-d");
    link(&a, &b, UNIT).await;
    link(&a, &c, UNIT).await;
    link(&b, &d, UNIT).await;
    link(&c, &d, UNIT).await;

    let msg = a.compose(PeerAddress::broadcast(), "once each");
    a.broadcast(msg).await.unwrap();

    for (name, rx) in [("b", &mut b_rx), ("c", &mut c_rx), ("d", &mut d_rx)] {
        let got = recv_within(rx, Duration::from_secs(5))
            .await
            .unwrap_or_else(|| panic!("node {name} never delivered"));
        assert_eq!(got.payload.as_ref(), b"once each", "node {name}");
        assert!(
            recv_within(rx, Duration::from_millis(300)).await.is_none(),
            "node {name} delivered twice"
        );
    }
}

#[tokio::test]
async fn relayed_traffic_teaches_return_routes() {
    let (x, mut x_rx) = start_node("rt-x");
    let (z, _z_rx) = start_node("rt-z");
    let (y, mut y_rx) = start_node("rt-y");
    link(&x, &z, UNIT).await;
    link(&z, &y, UNIT).await;

    x.learn_route("rt-y", "rt-z", 2).await;
    let msg = x.compose(PeerAddress::new("rt-y", "", 0), "ping");
    x.send(msg).await.unwrap();
    let got = recv_within(&mut y_rx, Duration::from_secs(5)).await.unwrap();

    // Y saw X's message arrive via Z, so it can answer without any
    // explicit route configuration.
    let reply = y.compose(got.source.clone(), "pong");
    y.send(reply).await.unwrap();

    let answered = recv_within(&mut x_rx, Duration::from_secs(5)).await.unwrap();
    assert_eq!(answered.payload.as_ref(), b"pong");
    assert_eq!(answered.source.id, "rt-y");
}
