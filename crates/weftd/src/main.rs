//! weftd — Weft mesh transport daemon.
//!
//! Brings up one mesh node: socket link intake, UDP peer discovery, and
//! the pipes named in the config. Received application messages are logged;
//! embedding hosts consume them through the library instead.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use weft_core::channel::ChannelKind;
use weft_core::config::MeshConfig;
use weft_mesh::listener::accept_loop;
use weft_mesh::pipe::socket::SocketPipeFactory;
use weft_mesh::reliability::{ReliabilityConfig, ReliabilityManager};
use weft_mesh::{MeshNode, PipeRegistry, UdpDiscovery};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = MeshConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = MeshConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MeshConfig::default()
    });
    tracing::info!(node = %config.node.id, "weftd starting");

    let mut registry = PipeRegistry::new();
    registry.register(ChannelKind::Socket, Arc::new(SocketPipeFactory));
    let registry = Arc::new(registry);

    let reliability = ReliabilityConfig::from_transport(&config.transport);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Discovery feeds the mesh loop; the mesh dials discovered socket peers.
    let local = {
        let port = config
            .network
            .listen_addr
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse().ok())
            .unwrap_or(0);
        weft_core::PeerAddress::new(config.node.id.clone(), "", port)
    };
    let (discovery_rx, discovery_task) = UdpDiscovery::spawn(config.discovery.clone(), local);

    let (mesh, mut delivered) = MeshNode::start(&config, registry.clone(), Some(discovery_rx));

    // Socket link intake.
    let listener = TcpListener::bind(&config.network.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.network.listen_addr))?;
    tokio::spawn(accept_loop(
        listener,
        mesh.clone(),
        reliability.clone(),
        shutdown_tx.subscribe(),
    ));

    // Configured pipes: build, connect, attach as links. The pipe id doubles
    // as the peer id until discovery supplies a real address.
    for pipe_config in &config.pipes {
        let peer_id = pipe_config.pipe_id.clone();
        match registry.build(pipe_config) {
            Ok(pipe) => {
                if let Err(e) = pipe.connect().await {
                    tracing::warn!(pipe = %pipe_config.pipe_id, error = %e, "pipe connect failed");
                    continue;
                }
                let (handle, inbound) = ReliabilityManager::spawn(pipe, reliability.clone());
                let peer = weft_core::PeerAddress::new(peer_id, "", 0);
                if let Err(e) = mesh.attach_link(peer, handle, inbound).await {
                    tracing::warn!(pipe = %pipe_config.pipe_id, error = %e, "attach failed");
                }
            }
            Err(e) => {
                tracing::warn!(pipe = %pipe_config.pipe_id, error = %e, "no driver for pipe");
            }
        }
    }

    // Drain deliveries until shutdown.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
            message = delivered.recv() => {
                match message {
                    Some(m) => {
                        tracing::info!(
                            from = %m.source,
                            bytes = m.payload.len(),
                            id = %m.id,
                            "message received"
                        );
                    }
                    None => {
                        tracing::warn!("delivery stream ended");
                        break;
                    }
                }
            }
        }
    }

    let _ = shutdown_tx.send(());
    discovery_task.abort();
    mesh.shutdown().await;
    Ok(())
}
