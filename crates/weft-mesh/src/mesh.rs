//! Mesh orchestrator — addressed and broadcast delivery across hops.
//!
//! One node runs one event-loop task. Links, routes, and the broadcast
//! seen-cache are owned by that loop and mutated nowhere else; the public
//! [`MeshHandle`] talks to it over a command channel. Reliable sends run in
//! spawned tasks so ack waits never stall the loop, reporting failures back
//! as commands.
//!
//! Backpressure: the application delivery queue is bounded
//! (`transport.delivery_queue`). When it is full the arriving message is
//! dropped with a warn log; queued messages are never displaced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use weft_core::config::MeshConfig;
use weft_core::frame::NetworkMessage;
use weft_core::peer::PeerAddress;

use crate::discovery::PeerEvent;
use crate::listener;
use crate::pipe::PipeRegistry;
use crate::reliability::{ReliabilityConfig, ReliabilityError, ReliabilityHandle};
use crate::routing::RoutingTable;
use crate::seen::SeenCache;

const COMMAND_QUEUE: usize = 128;

/// How long an addressed send keeps its destination eligible for a redial
/// after the route expires.
const INTEREST_WINDOW: Duration = Duration::from_secs(60);

/// Node lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MeshState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl MeshState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("no link or route to '{0}'")]
    Unreachable(String),

    #[error("mesh node is not running")]
    NotRunning,

    #[error(transparent)]
    Delivery(#[from] ReliabilityError),
}

enum Command {
    Send {
        message: NetworkMessage,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    Broadcast {
        message: NetworkMessage,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerAddress>>,
    },
    AttachLink {
        peer: PeerAddress,
        handle: ReliabilityHandle,
        inbound: mpsc::Receiver<Bytes>,
    },
    LearnRoute {
        destination: String,
        next_hop: String,
        distance: u32,
    },
    Inbound {
        from: String,
        payload: Bytes,
    },
    LinkClosed {
        peer_id: String,
    },
    LinkFailed {
        peer_id: String,
    },
    Shutdown,
}

/// Cloneable front door to one mesh node's event loop.
#[derive(Clone)]
pub struct MeshHandle {
    local: PeerAddress,
    default_ttl: u8,
    cmd: mpsc::Sender<Command>,
    state: Arc<AtomicU8>,
}

impl MeshHandle {
    pub fn local(&self) -> &PeerAddress {
        &self.local
    }

    pub fn state(&self) -> MeshState {
        MeshState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Build an addressed message from this node with the default hop budget.
    pub fn compose(&self, destination: PeerAddress, payload: impl Into<Bytes>) -> NetworkMessage {
        NetworkMessage::new(self.local.clone(), destination, payload, self.default_ttl)
    }

    /// Deliver to `message.destination`: over a direct link when one exists,
    /// else via a learned route. Resolves once the next hop acknowledged the
    /// frame; fails immediately with `Unreachable` when no path is known.
    pub async fn send(&self, message: NetworkMessage) -> Result<(), MeshError> {
        let (reply, rx) = oneshot::channel();
        self.cmd
            .send(Command::Send { message, reply })
            .await
            .map_err(|_| MeshError::NotRunning)?;
        rx.await.map_err(|_| MeshError::NotRunning)?
    }

    /// Fan `message` out to every direct link with the hop budget already
    /// spent for this hop. Resolves once handed to the links.
    pub async fn broadcast(&self, message: NetworkMessage) -> Result<(), MeshError> {
        let (reply, rx) = oneshot::channel();
        self.cmd
            .send(Command::Broadcast { message, reply })
            .await
            .map_err(|_| MeshError::NotRunning)?;
        rx.await.map_err(|_| MeshError::NotRunning)?
    }

    /// Directly linked peers.
    pub async fn peers(&self) -> Vec<PeerAddress> {
        let (reply, rx) = oneshot::channel();
        if self.cmd.send(Command::Peers { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Hand a live reliability link over to the event loop.
    pub async fn attach_link(
        &self,
        peer: PeerAddress,
        handle: ReliabilityHandle,
        inbound: mpsc::Receiver<Bytes>,
    ) -> Result<(), MeshError> {
        self.cmd
            .send(Command::AttachLink {
                peer,
                handle,
                inbound,
            })
            .await
            .map_err(|_| MeshError::NotRunning)
    }

    pub async fn learn_route(&self, destination: &str, next_hop: &str, distance: u32) {
        let _ = self
            .cmd
            .send(Command::LearnRoute {
                destination: destination.to_string(),
                next_hop: next_hop.to_string(),
                distance,
            })
            .await;
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd.send(Command::Shutdown).await;
    }
}

struct Link {
    peer: PeerAddress,
    handle: ReliabilityHandle,
    pump: JoinHandle<()>,
}

pub struct MeshNode;

impl MeshNode {
    /// Start a node's event loop. Returns the handle and the stream of
    /// messages addressed to (or broadcast past) this node.
    pub fn start(
        config: &MeshConfig,
        registry: Arc<PipeRegistry>,
        discovery: Option<mpsc::Receiver<PeerEvent>>,
    ) -> (MeshHandle, mpsc::Receiver<NetworkMessage>) {
        let local = local_address(config);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (delivered_tx, delivered_rx) =
            mpsc::channel(config.transport.delivery_queue.max(1));
        let state = Arc::new(AtomicU8::new(MeshState::Starting as u8));

        let handle = MeshHandle {
            local: local.clone(),
            default_ttl: config.transport.default_ttl,
            cmd: cmd_tx.clone(),
            state: state.clone(),
        };

        let route_ttl = Duration::from_secs(config.routing.route_ttl_secs);
        let event_loop = EventLoop {
            local,
            registry,
            reliability: ReliabilityConfig::from_transport(&config.transport),
            links: HashMap::new(),
            routing: RoutingTable::new(route_ttl),
            seen: SeenCache::new(config.transport.seen_cache_size),
            known_peers: HashMap::new(),
            interest: HashMap::new(),
            sweep_period: Duration::from_secs(5)
                .min(route_ttl)
                .max(Duration::from_millis(200)),
            delivered: delivered_tx,
            cmd: cmd_tx,
            state,
        };
        tokio::spawn(event_loop.run(cmd_rx, discovery));

        (handle, delivered_rx)
    }
}

fn local_address(config: &MeshConfig) -> PeerAddress {
    let port = config
        .network
        .listen_addr
        .rsplit_once(':')
        .and_then(|(_, p)| p.parse().ok())
        .unwrap_or(0);
    let mut local = PeerAddress::new(config.node.id.clone(), "", port);
    if !config.node.display_name.is_empty() {
        local = local.with_metadata("name", config.node.display_name.clone());
    }
    local
}

struct EventLoop {
    local: PeerAddress,
    registry: Arc<PipeRegistry>,
    reliability: ReliabilityConfig,
    links: HashMap<String, Link>,
    routing: RoutingTable,
    seen: SeenCache<String>,
    /// Last known address per peer id, fed by links and discovery. Kept
    /// past link death so an expired route can be redialed.
    known_peers: HashMap<String, PeerAddress>,
    /// Destinations of recent addressed sends, for expiry-driven redials.
    interest: HashMap<String, Instant>,
    sweep_period: Duration,
    delivered: mpsc::Sender<NetworkMessage>,
    cmd: mpsc::Sender<Command>,
    state: Arc<AtomicU8>,
}

impl EventLoop {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut discovery: Option<mpsc::Receiver<PeerEvent>>,
    ) {
        self.state
            .store(MeshState::Running as u8, Ordering::Release);
        tracing::info!(node = %self.local.id, "mesh node running");

        let mut route_sweep = tokio::time::interval(self.sweep_period);
        route_sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = cmd_rx.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(c) => self.handle_command(c).await,
                    }
                }
                event = async {
                    match discovery.as_mut() {
                        Some(events) => events.recv().await,
                        None => std::future::pending().await,
                    }
                }, if discovery.is_some() => {
                    match event {
                        Some(e) => self.handle_discovery(e).await,
                        None => discovery = None,
                    }
                }
                _ = route_sweep.tick() => {
                    // Live links keep their distance-1 routes fresh even
                    // when idle.
                    for id in self.links.keys() {
                        self.routing.refresh(id);
                    }
                    self.interest.retain(|_, at| at.elapsed() < INTEREST_WINDOW);
                    for route in self.routing.expire_stale() {
                        tracing::debug!(
                            destination = %route.destination,
                            next_hop = %route.next_hop,
                            "route expired"
                        );
                        self.redial_if_wanted(&route.destination);
                    }
                }
            }
        }

        self.state
            .store(MeshState::Stopping as u8, Ordering::Release);
        for (_, link) in self.links.drain() {
            link.pump.abort();
            link.handle.shutdown().await;
        }
        self.state
            .store(MeshState::Stopped as u8, Ordering::Release);
        tracing::info!(node = %self.local.id, "mesh node stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send { message, reply } => self.send_addressed(message, Some(reply)),
            Command::Broadcast { message, reply } => {
                self.broadcast_from_local(message);
                let _ = reply.send(Ok(()));
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.links.values().map(|l| l.peer.clone()).collect());
            }
            Command::AttachLink {
                peer,
                handle,
                inbound,
            } => self.install_link(peer, handle, inbound).await,
            Command::LearnRoute {
                destination,
                next_hop,
                distance,
            } => self.routing.learn_route(&destination, &next_hop, distance),
            Command::Inbound { from, payload } => self.handle_inbound(&from, &payload),
            Command::LinkClosed { peer_id } => self.drop_link(&peer_id, "link closed").await,
            Command::LinkFailed { peer_id } => self.drop_link(&peer_id, "link failed").await,
            Command::Shutdown => unreachable!("handled by the loop"),
        }
    }

    /// Origin-side addressed send. TTL is left for the receiving hops to
    /// spend; only forwarding decrements it.
    fn send_addressed(
        &mut self,
        message: NetworkMessage,
        reply: Option<oneshot::Sender<Result<(), MeshError>>>,
    ) {
        let dest = message.destination.id.clone();
        self.interest.insert(dest.clone(), Instant::now());

        let via = if self.links.contains_key(&dest) {
            Some(dest.clone())
        } else {
            self.routing.route_for(&dest).map(|r| {
                self.routing.refresh(&dest);
                r.next_hop
            })
        };

        match via.and_then(|id| self.links.get(&id)) {
            Some(link) => {
                self.spawn_reliable_send(link, message.to_bytes(), reply);
            }
            None => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(MeshError::Unreachable(dest)));
                } else {
                    tracing::warn!(destination = %dest, "dropping unreachable message");
                }
            }
        }
    }

    fn broadcast_from_local(&mut self, mut message: NetworkMessage) {
        self.seen.insert(message.id.clone());
        message.ttl = message.ttl.saturating_sub(1);
        self.fan_out(&message, None);
    }

    /// Hand a copy to every link except the arrival one.
    fn fan_out(&mut self, message: &NetworkMessage, except: Option<&str>) {
        let bytes = message.to_bytes();
        let targets: Vec<String> = self
            .links
            .keys()
            .filter(|id| except != Some(id.as_str()))
            .cloned()
            .collect();
        for id in targets {
            if let Some(link) = self.links.get(&id) {
                self.spawn_reliable_send(link, bytes.clone(), None);
            }
        }
    }

    fn spawn_reliable_send(
        &self,
        link: &Link,
        bytes: Bytes,
        reply: Option<oneshot::Sender<Result<(), MeshError>>>,
    ) {
        let handle = link.handle.clone();
        let peer_id = link.peer.id.clone();
        let cmd = self.cmd.clone();
        tokio::spawn(async move {
            match handle.send(bytes).await {
                Ok(()) => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(()));
                    }
                }
                Err(e) => {
                    tracing::warn!(peer = %peer_id, error = %e, "link send failed");
                    let _ = cmd.send(Command::LinkFailed { peer_id }).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(MeshError::Delivery(e)));
                    }
                }
            }
        });
    }

    fn handle_inbound(&mut self, from: &str, payload: &[u8]) {
        let message = match NetworkMessage::from_bytes(payload) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(from, error = %e, "dropping undecodable mesh message");
                return;
            }
        };

        // Keep the neighbor's own route fresh; learn two-hop routes from
        // relayed traffic.
        if message.source.id == from {
            self.routing.learn_route(from, from, 1);
        } else if message.source.id != self.local.id {
            self.routing.learn_route(&message.source.id, from, 2);
        }

        if message.destination.is_broadcast() {
            if !self.seen.insert(message.id.clone()) {
                tracing::trace!(id = %message.id, "duplicate broadcast suppressed");
                return;
            }
            self.deliver_local(message.clone());
            if message.ttl > 0 {
                let mut fwd = message;
                fwd.ttl -= 1;
                self.fan_out(&fwd, Some(from));
            }
        } else if message.destination.id == self.local.id {
            self.deliver_local(message);
        } else {
            // Forwarding hop: spend one TTL unit, drop silently at zero.
            if message.ttl == 0 {
                tracing::trace!(id = %message.id, "hop budget exhausted");
                return;
            }
            let mut fwd = message;
            fwd.ttl -= 1;
            self.send_addressed(fwd, None);
        }
    }

    fn deliver_local(&self, message: NetworkMessage) {
        if let Err(mpsc::error::TrySendError::Full(m)) = self.delivered.try_send(message) {
            tracing::warn!(id = %m.id, "delivery queue full, dropping message");
        }
    }

    async fn install_link(
        &mut self,
        peer: PeerAddress,
        handle: ReliabilityHandle,
        inbound: mpsc::Receiver<Bytes>,
    ) {
        if let Some(old) = self.links.remove(&peer.id) {
            tracing::debug!(peer = %peer, "replacing existing link");
            old.pump.abort();
            old.handle.shutdown().await;
        }
        tracing::info!(peer = %peer, "link attached");
        let pump = spawn_pump(peer.id.clone(), inbound, self.cmd.clone());
        self.routing.learn_route(&peer.id, &peer.id, 1);
        self.known_peers.insert(peer.id.clone(), peer.clone());
        self.links.insert(
            peer.id.clone(),
            Link { peer, handle, pump },
        );
    }

    async fn drop_link(&mut self, peer_id: &str, reason: &str) {
        if let Some(link) = self.links.remove(peer_id) {
            tracing::info!(peer = peer_id, reason, "removing link");
            link.pump.abort();
            link.handle.shutdown().await;
        }
        self.routing.remove(peer_id);
        let purged = self.routing.purge_via(peer_id);
        if purged > 0 {
            tracing::debug!(peer = peer_id, purged, "purged routes through dead hop");
        }
    }

    async fn handle_discovery(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Discovered(peer) => {
                self.routing.learn_route(&peer.id, &peer.id, 1);
                self.known_peers.insert(peer.id.clone(), peer.clone());
                if self.links.contains_key(&peer.id) {
                    return;
                }
                // The lower id dials so both sides don't build duplicate
                // links to each other.
                let dialable = peer.port != 0 && !peer.host.is_empty();
                if dialable && self.local.id < peer.id {
                    self.spawn_dial(peer);
                }
            }
            PeerEvent::Departed(peer) => {
                self.drop_link(&peer.id, "peer departed").await;
            }
        }
    }

    /// An expired route whose destination saw recent addressed traffic gets
    /// one rediscovery attempt at the last known address.
    fn redial_if_wanted(&self, destination: &str) {
        if !self.interest.contains_key(destination) || self.links.contains_key(destination) {
            return;
        }
        if let Some(peer) = self.known_peers.get(destination) {
            if peer.port != 0 && !peer.host.is_empty() {
                tracing::info!(peer = %peer, "route expired with traffic pending, redialing");
                self.spawn_dial(peer.clone());
            }
        }
    }

    fn spawn_dial(&self, peer: PeerAddress) {
        let registry = self.registry.clone();
        let local = self.local.clone();
        let reliability = self.reliability.clone();
        let cmd = self.cmd.clone();
        tokio::spawn(async move {
            match listener::dial(&registry, &local, &peer, &reliability).await {
                Ok((peer, handle, inbound)) => {
                    let _ = cmd
                        .send(Command::AttachLink {
                            peer,
                            handle,
                            inbound,
                        })
                        .await;
                }
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "dial failed");
                }
            }
        });
    }
}

fn spawn_pump(
    peer_id: String,
    mut inbound: mpsc::Receiver<Bytes>,
    cmd: mpsc::Sender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = inbound.recv().await {
            let command = Command::Inbound {
                from: peer_id.clone(),
                payload,
            };
            if cmd.send(command).await.is_err() {
                return;
            }
        }
        // Delivered stream closed: the reliability manager saw the pipe die.
        let _ = cmd.send(Command::LinkClosed { peer_id }).await;
    })
}
