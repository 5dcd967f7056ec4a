//! Raw TCP bridge onto a stream transport.
//!
//! Each accepted connection gets two in-memory pipes and a private engine:
//!
//! ```text
//! socket ──copy_socket_to_pipe──▶ inbound pipe ──▶ StreamTransport ──▶ engine
//! socket ◀──copy_pipe_to_socket── outbound pipe ◀── StreamTransport ◀── engine
//! ```
//!
//! The bridge copies bytes only; the engine's own line framing passes through
//! verbatim.

use crate::config::{BridgeConfig, TcpBridgeConfig};
use crate::engine::EngineFactory;
use crate::error::{BridgeError, Result};
use crate::transport::{StreamTransport, Transport};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Copy client bytes into the inbound pipe until EOF or cancellation.
///
/// Flushes after every chunk and shuts the pipe down on exit so the reader
/// sees EOF. Returns the number of bytes copied.
pub async fn copy_socket_to_pipe<R, W>(
    mut socket: R,
    mut pipe: W,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = socket.read(&mut buf) => read?,
        };
        if n == 0 {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            written = pipe.write_all(&buf[..n]) => written?,
        }
        pipe.flush().await?;
        total += n as u64;
    }

    pipe.shutdown().await?;
    Ok(total)
}

/// Copy engine output from the outbound pipe to the client until EOF or
/// cancellation, then half-close the socket's write side.
pub async fn copy_pipe_to_socket<R, W>(
    mut pipe: R,
    mut socket: W,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = pipe.read(&mut buf) => read?,
        };
        if n == 0 {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            written = socket.write_all(&buf[..n]) => written?,
        }
        total += n as u64;
    }

    socket.shutdown().await?;
    Ok(total)
}

/// TCP listener adapting each connection onto its own engine.
pub struct TcpBridge {
    config: TcpBridgeConfig,
    factory: EngineFactory,
    started: AtomicBool,
    running: Arc<AtomicBool>,
    local_addr: OnceLock<SocketAddr>,
    active_connections: Arc<AtomicUsize>,
    listener_stop: CancellationToken,
    connections_stop: CancellationToken,
    tasks: TaskTracker,
}

impl TcpBridge {
    pub fn new(config: TcpBridgeConfig, factory: EngineFactory) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            factory,
            started: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            local_addr: OnceLock::new(),
            active_connections: Arc::new(AtomicUsize::new(0)),
            listener_stop: CancellationToken::new(),
            connections_stop: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Bind with address reuse and start the accept loop.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::Lifecycle("bridge already started".to_string()));
        }
        if self.connections_stop.is_cancelled() {
            return Err(BridgeError::Lifecycle("bridge has been shut down".to_string()));
        }

        let (listener, addr) = match bind_reuse(self.config.bind) {
            Ok(bound) => bound,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let _ = self.local_addr.set(addr);
        self.running.store(true, Ordering::SeqCst);

        info!("TCP bridge listening on {}", addr);

        let session = Session {
            config: self.config.clone(),
            factory: self.factory.clone(),
            active_connections: self.active_connections.clone(),
            connections_stop: self.connections_stop.clone(),
            tasks: self.tasks.clone(),
        };
        let stop = self.listener_stop.clone();
        let running = self.running.clone();
        self.tasks.spawn(async move {
            session.accept_loop(listener, stop).await;
            running.store(false, Ordering::SeqCst);
        });

        Ok(addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Close the listener. Established connections keep running.
    pub fn stop(&self) {
        if !self.listener_stop.is_cancelled() {
            info!("Stopping TCP bridge...");
            self.listener_stop.cancel();
        }
    }

    /// Stop, cancel every connection, and wait for all of them to tear down.
    pub async fn shutdown(&self) {
        self.stop();
        self.connections_stop.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

fn bind_reuse(addr: SocketAddr) -> Result<(TcpListener, SocketAddr)> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(BridgeConfig::LISTEN_BACKLOG)?;
    let local = listener.local_addr()?;
    Ok((listener, local))
}

/// Everything a connection task needs, detached from the bridge's lifetime.
struct Session {
    config: TcpBridgeConfig,
    factory: EngineFactory,
    active_connections: Arc<AtomicUsize>,
    connections_stop: CancellationToken,
    tasks: TaskTracker,
}

impl Session {
    async fn accept_loop(self, listener: TcpListener, stop: CancellationToken) {
        let session = Arc::new(self);
        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    info!("TCP bridge shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            session.active_connections.fetch_add(1, Ordering::Relaxed);
                            let session = session.clone();
                            session.tasks.clone().spawn(async move {
                                info!("Client {} connected", peer_addr);
                                match session.handle_connection(stream).await {
                                    Ok(()) => {}
                                    Err(e) if e.is_scoped() => {
                                        warn!("Connection {} failed: {}", peer_addr, e)
                                    }
                                    Err(e) => error!("Connection {} aborted: {}", peer_addr, e),
                                }
                                session.active_connections.fetch_sub(1, Ordering::Relaxed);
                                info!("Client {} disconnected", peer_addr);
                            });
                        }
                        Err(e) => {
                            error!("TCP accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let cancel = self.connections_stop.child_token();
        let chunk = self.config.copy_chunk_size;

        let (inbound_writer, inbound_reader) = tokio::io::duplex(self.config.pipe_capacity);
        let (outbound_writer, outbound_reader) = tokio::io::duplex(self.config.pipe_capacity);

        let transport: Arc<dyn Transport> = Arc::new(StreamTransport::new(
            inbound_reader,
            outbound_writer,
            cancel.clone(),
        ));
        let engine = (self.factory)(transport.clone());

        let engine_task = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.run(cancel).await {
                    warn!("Connection engine stopped with error: {}", e);
                }
                // Engine is done writing: let the pipe→socket loop reach EOF.
                transport.close().await;
            })
        };

        let (socket_reader, socket_writer) = stream.into_split();
        let (inbound, outbound) = tokio::join!(
            copy_socket_to_pipe(socket_reader, inbound_writer, chunk, &cancel),
            copy_pipe_to_socket(outbound_reader, socket_writer, chunk, &cancel),
        );

        match inbound {
            Ok(n) => debug!("Socket to pipe loop finished after {} bytes", n),
            Err(e) => warn!("Socket to pipe loop failed: {}", e),
        }
        match outbound {
            Ok(n) => debug!("Pipe to socket loop finished after {} bytes", n),
            Err(e) => warn!("Pipe to socket loop failed: {}", e),
        }

        cancel.cancel();
        engine.dispose().await;
        if let Err(e) = engine_task.await {
            warn!("Connection engine task panicked: {}", e);
        }
        Ok(())
    }
}
