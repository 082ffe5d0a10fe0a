//! KCP client side.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{interval, sleep_until, Instant};
use tracing::{debug, info, warn};

use super::connection::KcpConnection;
use super::{client_channel_id, decode_datagram, encode_datagram, KcpHeader, KcpSettings};
use crate::network::channel::{NetworkChannel, NetworkError};
use crate::network::session::Session;

/// Interval between `RequestConnection` retries.
const HANDSHAKE_RETRY: Duration = Duration::from_millis(500);

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    /// Waiting for the server.
    Connecting,
    /// Handshake complete.
    Connected,
    /// Timed out or torn down.
    Failed,
}

/// Connects to a [`KcpServer`](super::KcpServer).
pub struct KcpClient;

impl KcpClient {
    /// Open a session immediately. Packets sent before the handshake
    /// completes are held and flushed once it does. If the server does not
    /// answer within `connect_timeout` the session is disposed.
    pub async fn open<F>(
        remote: SocketAddr,
        settings: KcpSettings,
        max_body: usize,
        connect_timeout: Duration,
        make_session: F,
    ) -> Result<(Session, watch::Receiver<ConnectState>), NetworkError>
    where
        F: FnOnce(Arc<dyn NetworkChannel>) -> Session,
    {
        let bind: SocketAddr = if remote.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = Arc::new(UdpSocket::bind(bind).await?);

        let interval_ms = settings.interval.max(1) as u64;
        let connection = Arc::new(KcpConnection::connecting(
            client_channel_id(),
            remote,
            socket.clone(),
            settings,
            max_body,
        ));
        let channel: Arc<dyn NetworkChannel> = connection.clone();
        let session = make_session(channel);

        let (state_tx, state_rx) = watch::channel(ConnectState::Connecting);
        tokio::spawn(drive(
            socket,
            remote,
            connection,
            session.clone(),
            state_tx,
            Instant::now() + connect_timeout,
            Duration::from_millis(interval_ms),
        ));
        Ok((session, state_rx))
    }

    /// Open a session and wait for the handshake.
    pub async fn connect<F>(
        remote: SocketAddr,
        settings: KcpSettings,
        max_body: usize,
        connect_timeout: Duration,
        make_session: F,
    ) -> Result<Session, NetworkError>
    where
        F: FnOnce(Arc<dyn NetworkChannel>) -> Session,
    {
        let (session, mut state) = Self::open(remote, settings, max_body, connect_timeout, make_session).await?;
        loop {
            match *state.borrow_and_update() {
                ConnectState::Connected => return Ok(session),
                ConnectState::Failed => return Err(NetworkError::ConnectTimeout),
                ConnectState::Connecting => {}
            }
            if state.changed().await.is_err() {
                return Err(NetworkError::ConnectTimeout);
            }
        }
    }
}

async fn drive(
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    connection: Arc<KcpConnection>,
    session: Session,
    state: watch::Sender<ConnectState>,
    connect_deadline: Instant,
    update_every: Duration,
) {
    let mut buf = vec![0u8; 64 * 1024];
    let mut retry = interval(HANDSHAKE_RETRY);
    let mut ticker = interval(update_every);
    let deadline = sleep_until(connect_deadline);
    tokio::pin!(deadline);

    // Handshake.
    loop {
        tokio::select! {
            _ = retry.tick() => {
                send(&socket, remote, KcpHeader::RequestConnection, connection.channel_id()).await;
            }
            result = socket.recv_from(&mut buf) => {
                let len = match result {
                    Ok((len, from)) if from == remote => len,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("KCP client receive error: {}", e);
                        continue;
                    }
                };
                let Some((header, channel_id, _)) = decode_datagram(&buf[..len]) else {
                    continue;
                };
                if channel_id != connection.channel_id() {
                    continue;
                }
                match header {
                    KcpHeader::WaitConfirmConnection => {
                        send(&socket, remote, KcpHeader::ConfirmConnection, channel_id).await;
                        if let Err(e) = connection.establish(channel_id) {
                            warn!("Failed to start channel {}: {}", channel_id, e);
                            let _ = state.send(ConnectState::Failed);
                            session.dispose();
                            return;
                        }
                        info!("Connected to {} on channel {}", remote, channel_id);
                        let _ = state.send(ConnectState::Connected);
                        break;
                    }
                    KcpHeader::RepeatChannelId => {
                        let fresh = client_channel_id();
                        debug!("Channel id {} taken, retrying with {}", channel_id, fresh);
                        connection.set_channel_id(fresh);
                        send(&socket, remote, KcpHeader::RequestConnection, fresh).await;
                    }
                    _ => {}
                }
            }
            _ = &mut deadline => {
                warn!("KCP connect timed out");
                let _ = state.send(ConnectState::Failed);
                connection.close_silently();
                session.dispose();
                return;
            }
        }
    }

    // Data.
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let len = match result {
                    Ok((len, from)) if from == remote => len,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("KCP client receive error: {}", e);
                        continue;
                    }
                };
                let Some((header, channel_id, payload)) = decode_datagram(&buf[..len]) else {
                    warn!("Malformed datagram: {}", hex::encode(&buf[..len.min(16)]));
                    continue;
                };
                if channel_id != connection.channel_id() {
                    continue;
                }
                match header {
                    KcpHeader::ReceiveData => match connection.input(payload) {
                        Ok(packs) => {
                            for pack in packs {
                                session.receive(pack);
                            }
                        }
                        Err(e) => {
                            warn!("Protocol error on channel {}: {}", channel_id, e);
                            break;
                        }
                    },
                    KcpHeader::Disconnect => {
                        debug!("Server closed channel {}", channel_id);
                        connection.close_silently();
                        break;
                    }
                    _ => {}
                }
            }
            _ = ticker.tick() => {
                if connection.is_closed() || session.is_disposed() {
                    break;
                }
                if !connection.update() {
                    warn!("Channel {} is dead", connection.channel_id());
                    break;
                }
            }
        }
    }

    let _ = state.send(ConnectState::Failed);
    session.dispose();
}

async fn send(socket: &UdpSocket, remote: SocketAddr, header: KcpHeader, channel_id: u32) {
    if let Err(e) = socket.send_to(&encode_datagram(header, channel_id, &[]), remote).await {
        debug!("Failed to send {:?}: {}", header, e);
    }
}
