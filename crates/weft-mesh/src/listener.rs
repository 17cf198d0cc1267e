//! Socket link intake — TCP accept loop and dial, with a hello exchange.
//!
//! The hello is one JSON `PeerAddress` each way, carried as the first
//! record on the stream. After it, the stream belongs to a reliability
//! manager and the link is attached to the mesh.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use weft_core::channel::PipeConfiguration;
use weft_core::peer::PeerAddress;

use crate::mesh::MeshHandle;
use crate::pipe::socket::SocketPipe;
use crate::pipe::{Pipe, PipeRegistry};
use crate::reliability::{ReliabilityConfig, ReliabilityHandle, ReliabilityManager};

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept inbound socket links until shut down. Each connection gets its
/// own intake task so a slow hello never blocks the loop.
pub async fn accept_loop(
    listener: TcpListener,
    mesh: MeshHandle,
    config: ReliabilityConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "link intake listening");
    }
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let mesh = mesh.clone();
                        let config = config.clone();
                        tokio::spawn(async move {
                            if let Err(e) = intake(stream, addr.to_string(), mesh, config).await {
                                tracing::warn!(from = %addr, error = %e, "inbound link rejected");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
    tracing::info!("link intake stopped");
}

async fn intake(
    stream: TcpStream,
    from: String,
    mesh: MeshHandle,
    config: ReliabilityConfig,
) -> anyhow::Result<()> {
    let caps = PipeConfiguration::socket("accepted", from.clone()).capabilities();
    let pipe: Arc<dyn Pipe> = Arc::new(SocketPipe::from_stream(stream, caps));

    let mut peer = exchange_hello(&pipe, mesh.local()).await?;
    if peer.host.is_empty() {
        if let Some((host, _)) = from.rsplit_once(':') {
            peer.host = host.to_string();
        }
    }

    let (handle, inbound) = ReliabilityManager::spawn(pipe, config);
    mesh.attach_link(peer, handle, inbound).await?;
    Ok(())
}

/// Dial `peer` through the registry's socket factory and complete the hello.
/// The caller attaches the returned link to its mesh.
pub async fn dial(
    registry: &PipeRegistry,
    local: &PeerAddress,
    peer: &PeerAddress,
    config: &ReliabilityConfig,
) -> anyhow::Result<(PeerAddress, ReliabilityHandle, mpsc::Receiver<Bytes>)> {
    let pipe_config =
        PipeConfiguration::socket(format!("socket-{}", peer.id), peer.endpoint());
    let pipe = registry.build(&pipe_config)?;
    pipe.connect().await?;

    let mut remote = exchange_hello(&pipe, local).await?;
    // Prefer the address we actually reached the peer on.
    if remote.host.is_empty() {
        remote.host = peer.host.clone();
        remote.port = peer.port;
    }

    let (handle, inbound) = ReliabilityManager::spawn(pipe, config.clone());
    Ok((remote, handle, inbound))
}

/// Send our address, read theirs. Both sides send first; the records queue.
async fn exchange_hello(
    pipe: &Arc<dyn Pipe>,
    local: &PeerAddress,
) -> anyhow::Result<PeerAddress> {
    let hello = Bytes::from(serde_json::to_vec(local).context("encoding hello")?);
    pipe.send(hello).await.context("sending hello")?;

    let bytes = tokio::time::timeout(HELLO_TIMEOUT, pipe.recv())
        .await
        .context("hello timed out")?
        .context("stream ended during hello")?;
    let peer: PeerAddress = serde_json::from_slice(&bytes).context("malformed hello")?;
    anyhow::ensure!(!peer.id.is_empty(), "hello carried an empty peer id");
    Ok(peer)
}
