//! Listeners and dialers.
//!
//! A [`NetworkServer`] accepts one protocol on one address and hands every
//! new channel to its [`SessionAcceptor`], which decides who owns the
//! resulting session (a scene for client traffic, the router for
//! server-to-server traffic).

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};

use super::channel::{NetworkChannel, NetworkError};
use super::kcp::{KcpClient, KcpServer, KcpSettings};
use super::packet::DEFAULT_MAX_BODY;
use super::session::Session;
use super::{tcp, websocket};
use crate::config::NetworkProtocol;

/// Turns a fresh channel into an owned session.
pub trait SessionAcceptor: Send + Sync {
    /// Create and register the session for `channel`.
    fn accept(&self, channel: Arc<dyn NetworkChannel>) -> Session;
}

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Transport.
    pub protocol: NetworkProtocol,
    /// Largest accepted body.
    pub max_body: usize,
    /// KCP tuning, used when `protocol` is KCP.
    pub kcp: KcpSettings,
}

impl ServerConfig {
    /// Config with default limits.
    pub fn new(bind_addr: SocketAddr, protocol: NetworkProtocol) -> Self {
        Self {
            bind_addr,
            protocol,
            max_body: DEFAULT_MAX_BODY,
            kcp: KcpSettings::default(),
        }
    }
}

enum Listener {
    Stream(TcpListener),
    Kcp(Arc<KcpServer>),
}

/// One bound listener.
pub struct NetworkServer {
    config: ServerConfig,
    listener: Listener,
    acceptor: Arc<dyn SessionAcceptor>,
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: Mutex<Option<broadcast::Receiver<()>>>,
}

impl NetworkServer {
    /// Bind the listener. Port 0 picks a free port; see [`local_addr`](Self::local_addr).
    pub async fn bind(config: ServerConfig, acceptor: Arc<dyn SessionAcceptor>) -> Result<Self, NetworkError> {
        let (listener, local_addr) = match config.protocol {
            NetworkProtocol::Tcp | NetworkProtocol::Websocket => {
                let listener = TcpListener::bind(config.bind_addr).await?;
                let local_addr = listener.local_addr()?;
                (Listener::Stream(listener), local_addr)
            }
            NetworkProtocol::Kcp => {
                let server = KcpServer::bind(config.bind_addr, config.kcp.clone(), config.max_body, acceptor.clone()).await?;
                let local_addr = server.local_addr()?;
                (Listener::Kcp(Arc::new(server)), local_addr)
            }
        };
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        Ok(Self {
            config,
            listener,
            acceptor,
            local_addr,
            shutdown_tx,
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
        })
    }

    /// Actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Transport.
    pub fn protocol(&self) -> NetworkProtocol {
        self.config.protocol
    }

    /// Stop `run`.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Accept until shutdown.
    #[instrument(skip(self), fields(addr = %self.local_addr, protocol = ?self.config.protocol))]
    pub async fn run(&self) -> Result<(), NetworkError> {
        // Subscribed at bind time so a shutdown before the first poll is not lost.
        let shutdown_rx = self.shutdown_rx.lock().take().unwrap_or_else(|| self.shutdown_tx.subscribe());
        match &self.listener {
            Listener::Kcp(server) => server.clone().run(shutdown_rx).await,
            Listener::Stream(listener) => self.run_stream(listener, shutdown_rx).await,
        }
    }

    async fn run_stream(&self, listener: &TcpListener, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), NetworkError> {
        info!("{:?} server listening on {}", self.config.protocol, self.local_addr);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }
        Ok(())
    }

    fn handle_connection(&self, stream: tokio::net::TcpStream, addr: SocketAddr) {
        let acceptor = self.acceptor.clone();
        let max_body = self.config.max_body;
        match self.config.protocol {
            NetworkProtocol::Tcp => {
                tcp::spawn_connection(stream, addr, max_body, |channel| acceptor.accept(channel));
            }
            NetworkProtocol::Websocket => {
                tokio::spawn(async move {
                    if let Err(e) = websocket::accept(stream, addr, max_body, |channel| acceptor.accept(channel)).await {
                        warn!("WebSocket handshake failed for {}: {}", addr, e);
                    }
                });
            }
            NetworkProtocol::Kcp => {}
        }
    }
}

/// Client-side connection parameters.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Largest accepted body.
    pub max_body: usize,
    /// KCP tuning.
    pub kcp: KcpSettings,
    /// Handshake deadline.
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            max_body: DEFAULT_MAX_BODY,
            kcp: KcpSettings::default(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Connect to a listener of the given protocol.
pub async fn connect<F>(
    addr: SocketAddr,
    protocol: NetworkProtocol,
    options: &ConnectOptions,
    make_session: F,
) -> Result<Session, NetworkError>
where
    F: FnOnce(Arc<dyn NetworkChannel>) -> Session,
{
    match protocol {
        NetworkProtocol::Tcp => tcp::connect(addr, options.max_body, make_session).await,
        NetworkProtocol::Websocket => websocket::connect(addr, options.max_body, make_session).await,
        NetworkProtocol::Kcp => {
            KcpClient::connect(addr, options.kcp.clone(), options.max_body, options.connect_timeout, make_session).await
        }
    }
}
