//! Socket pipe — the TCP stream fallback channel.
//!
//! Records are framed with a u32 big-endian length prefix. A read task owns
//! the receive half and feeds an inbound channel, so `recv()` never holds
//! the stream across await points used by `send()`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use weft_core::channel::{ChannelConfig, PipeCapabilities, PipeConfiguration};

use super::{Pipe, PipeError, PipeFactory, PipeMetrics, PipeState, PipeStatus};

/// Upper bound on one length-prefixed record. Anything larger is a protocol
/// violation and ends the connection.
const MAX_RECORD_LEN: usize = 1 << 20;

const INBOUND_DEPTH: usize = 256;

pub struct SocketPipe {
    /// Endpoint to dial on (re)connect. None for accepted streams.
    endpoint: Option<String>,
    caps: PipeCapabilities,
    metrics: Arc<PipeMetrics>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
    inbound_tx: mpsc::Sender<Bytes>,
    read_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SocketPipe {
    /// A pipe that dials `endpoint` on `connect()`.
    pub fn dialer(endpoint: impl Into<String>, caps: PipeCapabilities) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_DEPTH);
        Self {
            endpoint: Some(endpoint.into()),
            caps,
            metrics: Arc::new(PipeMetrics::new()),
            writer: Mutex::new(None),
            inbound: Mutex::new(inbound_rx),
            inbound_tx,
            read_task: std::sync::Mutex::new(None),
        }
    }

    /// Wrap an already-established stream (the accept side of link intake).
    pub fn from_stream(stream: TcpStream, caps: PipeCapabilities) -> Self {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_DEPTH);
        let metrics = Arc::new(PipeMetrics::new());
        let task = tokio::spawn(read_loop(read_half, metrics.clone(), inbound_tx.clone()));
        metrics.set_state(PipeState::Connected);

        Self {
            endpoint: None,
            caps,
            metrics,
            writer: Mutex::new(Some(write_half)),
            inbound: Mutex::new(inbound_rx),
            inbound_tx,
            read_task: std::sync::Mutex::new(Some(task)),
        }
    }

    /// Install a connected stream: store the write half, spawn the reader.
    async fn adopt(&self, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        *self.writer.lock().await = Some(write_half);

        let task = tokio::spawn(read_loop(
            read_half,
            self.metrics.clone(),
            self.inbound_tx.clone(),
        ));
        let mut slot = self.read_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
        drop(slot);
        self.metrics.set_state(PipeState::Connected);
    }
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    metrics: Arc<PipeMetrics>,
    tx: mpsc::Sender<Bytes>,
) {
    let mut buf = Vec::new();
    loop {
        let len = match read_half.read_u32().await {
            Ok(n) => n as usize,
            Err(_) => break,
        };
        if len > MAX_RECORD_LEN {
            tracing::warn!(len, "oversized record on socket pipe, closing");
            break;
        }
        buf.resize(len, 0);
        if read_half.read_exact(&mut buf).await.is_err() {
            break;
        }
        metrics.add_received(len + 4);
        if tx.send(Bytes::copy_from_slice(&buf)).await.is_err() {
            break;
        }
    }
    if metrics.state() == PipeState::Connected {
        metrics.set_state(PipeState::Disconnected);
    }
}

#[async_trait]
impl Pipe for SocketPipe {
    async fn connect(&self) -> Result<(), PipeError> {
        let endpoint = match &self.endpoint {
            Some(e) => e.clone(),
            // Accepted streams are born connected; reconnect is the
            // initiator's job.
            None => {
                return if self.metrics.state() == PipeState::Connected {
                    Ok(())
                } else {
                    Err(PipeError::NotConnected)
                };
            }
        };

        self.metrics.set_state(PipeState::Connecting);
        match TcpStream::connect(&endpoint).await {
            Ok(stream) => {
                self.adopt(stream).await;
                tracing::debug!(endpoint = %endpoint, "socket pipe connected");
                Ok(())
            }
            Err(e) => {
                self.metrics.set_state(PipeState::Error);
                Err(PipeError::MediumUnavailable(format!("{endpoint}: {e}")))
            }
        }
    }

    async fn send(&self, record: Bytes) -> Result<(), PipeError> {
        if self.metrics.state() != PipeState::Connected {
            return Err(PipeError::NotConnected);
        }
        if record.len() > self.caps.max_message_bytes as usize {
            return Err(PipeError::TooLarge {
                len: record.len(),
                max: self.caps.max_message_bytes as usize,
            });
        }

        let mut writer = self.writer.lock().await;
        let w = writer.as_mut().ok_or(PipeError::NotConnected)?;

        let result: std::io::Result<()> = async {
            w.write_u32(record.len() as u32).await?;
            w.write_all(&record).await?;
            w.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                self.metrics.add_sent(record.len() + 4);
                Ok(())
            }
            Err(e) => {
                self.metrics.set_state(PipeState::Error);
                Err(PipeError::Io(e))
            }
        }
    }

    async fn recv(&self) -> Option<Bytes> {
        self.inbound.lock().await.recv().await
    }

    fn status(&self) -> PipeStatus {
        self.metrics.status()
    }

    fn capabilities(&self) -> PipeCapabilities {
        self.caps.clone()
    }

    fn observe_rtt(&self, rtt: Duration) {
        self.metrics.observe_rtt(rtt);
    }

    fn mark_error(&self) {
        self.metrics.set_state(PipeState::Error);
    }

    async fn shutdown(&self) {
        if let Some(task) = self
            .read_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        if let Some(mut w) = self.writer.lock().await.take() {
            let _ = w.shutdown().await;
        }
        self.metrics.set_state(PipeState::Disconnected);
    }
}

/// Factory for socket pipes, registered under `ChannelKind::Socket`.
pub struct SocketPipeFactory;

impl PipeFactory for SocketPipeFactory {
    fn build(&self, config: &PipeConfiguration) -> Result<Arc<dyn Pipe>, PipeError> {
        match &config.channel {
            ChannelConfig::Socket { endpoint, .. } => Ok(Arc::new(SocketPipe::dialer(
                endpoint.clone(),
                config.capabilities(),
            ))),
            _ => Err(PipeError::MediumUnavailable(format!(
                "socket factory cannot build {} pipe",
                config.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn records_cross_a_local_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            SocketPipe::from_stream(stream, PipeCapabilities::loopback(65_535))
        });

        let dialer = SocketPipe::dialer(addr.to_string(), PipeCapabilities::loopback(65_535));
        dialer.connect().await.unwrap();
        let acceptor = accept.await.unwrap();

        dialer.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(acceptor.recv().await.unwrap().as_ref(), b"ping");

        acceptor.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(dialer.recv().await.unwrap().as_ref(), b"pong");

        dialer.shutdown().await;
        acceptor.shutdown().await;
    }

    #[tokio::test]
    async fn dial_failure_leaves_error_state() {
        // Port 1 is essentially never listening.
        let pipe = SocketPipe::dialer("127.0.0.1:1", PipeCapabilities::loopback(65_535));
        assert!(pipe.connect().await.is_err());
        assert_eq!(pipe.status().state, PipeState::Error);
    }

    #[tokio::test]
    async fn send_before_connect_is_rejected() {
        let pipe = SocketPipe::dialer("127.0.0.1:1", PipeCapabilities::loopback(65_535));
        assert!(matches!(
            pipe.send(Bytes::from_static(b"x")).await,
            Err(PipeError::NotConnected)
        ));
    }
}
