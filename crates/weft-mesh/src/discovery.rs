//! Peer discovery over UDP broadcast.
//!
//! Each node periodically shouts a JSON announcement on the discovery port
//! and listens for everyone else's. Announcements are fire-and-forget;
//! presence is soft state that expires when a peer goes quiet. Statically
//! configured peers are reported once at start and never expire.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use weft_core::config::DiscoveryConfig;
use weft_core::peer::PeerAddress;

/// Announcement schema version. Unknown versions are ignored.
pub const DISCOVERY_VERSION: u8 = 1;

const EVENT_QUEUE: usize = 64;
const RECV_BUF: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Announcement {
    peer: PeerAddress,
    version: u8,
}

/// Presence changes, in arrival order. `Departed` fires once per expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Discovered(PeerAddress),
    Departed(PeerAddress),
}

struct Presence {
    peer: PeerAddress,
    last_seen: Instant,
    /// Static peers come from config, not announcements, and never expire.
    is_static: bool,
}

pub struct UdpDiscovery;

impl UdpDiscovery {
    /// Start discovery for `local`. Events stop (and the task exits) when
    /// the returned receiver is dropped.
    pub fn spawn(
        config: DiscoveryConfig,
        local: PeerAddress,
    ) -> (mpsc::Receiver<PeerEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let task = tokio::spawn(run(config, local, tx));
        (rx, task)
    }
}

async fn run(config: DiscoveryConfig, local: PeerAddress, events: mpsc::Sender<PeerEvent>) {
    let mut known: HashMap<String, Presence> = HashMap::new();

    for raw in &config.static_peers {
        match raw.parse::<PeerAddress>() {
            Ok(peer) if peer.id != local.id => {
                tracing::info!(peer = %peer, "static peer configured");
                known.insert(
                    peer.id.clone(),
                    Presence {
                        peer: peer.clone(),
                        last_seen: Instant::now(),
                        is_static: true,
                    },
                );
                if events.send(PeerEvent::Discovered(peer)).await.is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(entry = %raw, error = %e, "ignoring bad static peer"),
        }
    }

    if !config.enabled {
        tracing::info!("discovery disabled, only static peers available");
        // Hold the channel open so no Departed is ever implied.
        events.closed().await;
        return;
    }

    let listen = match listen_socket(config.port) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(port = config.port, error = %e, "discovery listen socket failed");
            return;
        }
    };
    let announce = match announce_socket() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "discovery announce socket failed");
            return;
        }
    };

    let target = SocketAddr::from((Ipv4Addr::BROADCAST, config.port));
    let payload = serde_json::to_vec(&Announcement {
        peer: local.clone(),
        version: DISCOVERY_VERSION,
    })
    .unwrap_or_default();

    let peer_ttl = Duration::from_secs(config.peer_ttl_secs);
    let mut announce_tick =
        tokio::time::interval(Duration::from_secs(config.announce_interval_secs.max(1)));
    let mut sweep_tick = tokio::time::interval(peer_ttl.div_f32(2.0).max(Duration::from_secs(1)));
    let mut buf = vec![0u8; RECV_BUF];

    tracing::info!(port = config.port, node = %local.id, "discovery running");

    loop {
        tokio::select! {
            _ = announce_tick.tick() => {
                if events.is_closed() {
                    return;
                }
                // Best effort: a missed announcement just delays discovery.
                if let Err(e) = announce.send_to(&payload, target).await {
                    tracing::debug!(error = %e, "announcement not sent");
                }
            }
            _ = sweep_tick.tick() => {
                let departed: Vec<PeerAddress> = known
                    .values()
                    .filter(|p| !p.is_static && p.last_seen.elapsed() > peer_ttl)
                    .map(|p| p.peer.clone())
                    .collect();
                for peer in departed {
                    known.remove(&peer.id);
                    tracing::info!(peer = %peer, "peer departed");
                    if events.send(PeerEvent::Departed(peer)).await.is_err() {
                        return;
                    }
                }
            }
            received = listen.recv_from(&mut buf) => {
                let (len, src) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::debug!(error = %e, "discovery receive error");
                        continue;
                    }
                };
                if let Some(peer) = parse_announcement(&buf[..len], src, &local.id) {
                    match known.get_mut(&peer.id) {
                        Some(presence) => {
                            presence.last_seen = Instant::now();
                            presence.peer = peer;
                        }
                        None => {
                            tracing::info!(peer = %peer, "peer discovered");
                            known.insert(
                                peer.id.clone(),
                                Presence {
                                    peer: peer.clone(),
                                    last_seen: Instant::now(),
                                    is_static: false,
                                },
                            );
                            if events.send(PeerEvent::Discovered(peer)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

fn parse_announcement(data: &[u8], src: SocketAddr, local_id: &str) -> Option<PeerAddress> {
    let ann: Announcement = match serde_json::from_slice(data) {
        Ok(a) => a,
        Err(e) => {
            tracing::debug!(error = %e, from = %src, "ignoring malformed announcement");
            return None;
        }
    };
    if ann.version != DISCOVERY_VERSION || ann.peer.id == local_id {
        return None;
    }
    let mut peer = ann.peer;
    // Announcers often can't know their own address; the datagram does.
    if peer.host.is_empty() {
        peer.host = src.ip().to_string();
    }
    Some(peer)
}

fn listen_socket(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    UdpSocket::from_std(socket.into())
}

fn announce_socket() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_round_trip_patches_empty_host() {
        let ann = Announcement {
            peer: PeerAddress::new("n2", "", 7350),
            version: DISCOVERY_VERSION,
        };
        let bytes = serde_json::to_vec(&ann).unwrap();
        let src: SocketAddr = "192.168.1.9:7300".parse().unwrap();

        let peer = parse_announcement(&bytes, src, "n1").unwrap();
        assert_eq!(peer.id, "n2");
        assert_eq!(peer.host, "192.168.1.9");
        assert_eq!(peer.port, 7350);
    }

    #[test]
    fn own_and_alien_announcements_are_ignored() {
        let src: SocketAddr = "10.0.0.2:7300".parse().unwrap();

        let own = Announcement {
            peer: PeerAddress::new("n1", "10.0.0.2", 7350),
            version: DISCOVERY_VERSION,
        };
        assert!(parse_announcement(&serde_json::to_vec(&own).unwrap(), src, "n1").is_none());

        let future = Announcement {
            peer: PeerAddress::new("n3", "10.0.0.3", 7350),
            version: DISCOVERY_VERSION + 1,
        };
        assert!(parse_announcement(&serde_json::to_vec(&future).unwrap(), src, "n1").is_none());

        assert!(parse_announcement(b"not json", src, "n1").is_none());
    }

    #[tokio::test]
    async fn static_peers_are_emitted_on_start() {
        let config = DiscoveryConfig {
            enabled: false,
            static_peers: vec![
                "n2@192.168.1.4:7350".into(),
                "garbage".into(),
                "n1@192.168.1.5:7350".into(), // self, skipped
            ],
            ..DiscoveryConfig::default()
        };
        let local = PeerAddress::new("n1", "", 0);
        let (mut rx, task) = UdpDiscovery::spawn(config, local);

        match rx.recv().await.unwrap() {
            PeerEvent::Discovered(p) => {
                assert_eq!(p.id, "n2");
                assert_eq!(p.endpoint(), "192.168.1.4:7350");
            }
            other => panic!("unexpected event {other:?}"),
        }

        drop(rx);
        let _ = task.await;
    }
}
