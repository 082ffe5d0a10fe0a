//! KCP listener.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant};
use tracing::{debug, info, instrument, warn};

use super::connection::KcpConnection;
use super::{decode_datagram, encode_datagram, KcpHeader, KcpSettings};
use crate::network::channel::{NetworkChannel, NetworkError};
use crate::network::server::SessionAcceptor;
use crate::network::session::Session;

/// How long a `WaitConfirmConnection` stays valid.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest datagram read.
const RECV_BUFFER: usize = 64 * 1024;

struct PendingHandshake {
    addr: SocketAddr,
    expires: Instant,
}

#[derive(Clone)]
struct Peer {
    addr: SocketAddr,
    connection: Arc<KcpConnection>,
    session: Session,
}

/// Accepts KCP connections on one UDP socket.
pub struct KcpServer {
    socket: Arc<UdpSocket>,
    settings: KcpSettings,
    max_body: usize,
    acceptor: Arc<dyn SessionAcceptor>,
    pending: DashMap<u32, PendingHandshake>,
    peers: DashMap<u32, Peer>,
}

impl KcpServer {
    /// Bind the socket.
    pub async fn bind(
        addr: SocketAddr,
        settings: KcpSettings,
        max_body: usize,
        acceptor: Arc<dyn SessionAcceptor>,
    ) -> Result<Self, NetworkError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            settings,
            max_body,
            acceptor,
            pending: DashMap::new(),
            peers: DashMap::new(),
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.socket.local_addr()?)
    }

    /// Live connections.
    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    /// Serve until shutdown.
    #[instrument(skip(self, shutdown))]
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<(), NetworkError> {
        info!("KCP server listening on {}", self.local_addr()?);
        let mut buf = vec![0u8; RECV_BUFFER];
        let mut ticker = interval(Duration::from_millis(self.settings.interval.max(1) as u64));

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, addr)) => self.handle_datagram(&buf[..len], addr),
                        Err(e) => debug!("UDP receive error: {}", e),
                    }
                }
                _ = ticker.tick() => {
                    self.update();
                }
                _ = shutdown.recv() => {
                    info!("KCP server shutting down");
                    break;
                }
            }
        }

        let peers: Vec<Peer> = self.peers.iter().map(|entry| entry.value().clone()).collect();
        self.peers.clear();
        for peer in peers {
            peer.session.dispose();
        }
        Ok(())
    }

    fn reply(&self, header: KcpHeader, channel_id: u32, addr: SocketAddr) {
        let datagram = encode_datagram(header, channel_id, &[]);
        if let Err(e) = self.socket.try_send_to(&datagram, addr) {
            debug!("Failed to send {:?} to {}: {}", header, addr, e);
        }
    }

    fn handle_datagram(&self, datagram: &[u8], addr: SocketAddr) {
        let Some((header, channel_id, payload)) = decode_datagram(datagram) else {
            let prefix = &datagram[..datagram.len().min(16)];
            warn!("Malformed datagram from {}: {}", addr, hex::encode(prefix));
            return;
        };

        match header {
            KcpHeader::RequestConnection => self.on_request(channel_id, addr),
            KcpHeader::ConfirmConnection => self.on_confirm(channel_id, addr),
            KcpHeader::ReceiveData => self.on_data(channel_id, addr, payload),
            KcpHeader::Disconnect => self.on_disconnect(channel_id, addr),
            KcpHeader::WaitConfirmConnection | KcpHeader::RepeatChannelId => {
                debug!("Ignoring client-bound {:?} from {}", header, addr);
            }
        }
    }

    fn on_request(&self, channel_id: u32, addr: SocketAddr) {
        if let Some(peer) = self.peers.get(&channel_id) {
            if peer.addr == addr {
                // Our confirmation reply was lost.
                self.reply(KcpHeader::WaitConfirmConnection, channel_id, addr);
            } else {
                self.reply(KcpHeader::RepeatChannelId, channel_id, addr);
            }
            return;
        }

        let taken = self
            .pending
            .get(&channel_id)
            .map(|pending| pending.addr != addr && pending.expires > Instant::now())
            .unwrap_or(false);
        if taken {
            self.reply(KcpHeader::RepeatChannelId, channel_id, addr);
            return;
        }

        self.pending.insert(
            channel_id,
            PendingHandshake {
                addr,
                expires: Instant::now() + HANDSHAKE_TIMEOUT,
            },
        );
        self.reply(KcpHeader::WaitConfirmConnection, channel_id, addr);
    }

    fn on_confirm(&self, channel_id: u32, addr: SocketAddr) {
        if self.peers.contains_key(&channel_id) {
            return;
        }
        let Some((_, pending)) = self.pending.remove_if(&channel_id, |_, pending| pending.addr == addr) else {
            debug!("Confirm from {} for unknown channel {}", addr, channel_id);
            return;
        };
        self.promote(channel_id, pending.addr);
    }

    fn promote(&self, channel_id: u32, addr: SocketAddr) -> Option<Peer> {
        let connection = match KcpConnection::connected(
            channel_id,
            addr,
            self.socket.clone(),
            self.settings.clone(),
            self.max_body,
        ) {
            Ok(connection) => Arc::new(connection),
            Err(e) => {
                warn!("Failed to open channel {} for {}: {}", channel_id, addr, e);
                return None;
            }
        };

        let channel: Arc<dyn NetworkChannel> = connection.clone();
        let session = self.acceptor.accept(channel);
        let peer = Peer {
            addr,
            connection,
            session,
        };
        self.peers.insert(channel_id, peer.clone());
        debug!("Channel {} established with {}", channel_id, addr);
        Some(peer)
    }

    fn on_data(&self, channel_id: u32, addr: SocketAddr, payload: &[u8]) {
        let peer = match self.peers.get(&channel_id).map(|peer| peer.clone()) {
            Some(peer) => peer,
            None => {
                // Lost confirm: data proves the client saw our reply.
                let confirmed = self
                    .pending
                    .remove_if(&channel_id, |_, pending| pending.addr == addr)
                    .is_some();
                match confirmed.then(|| self.promote(channel_id, addr)).flatten() {
                    Some(peer) => peer,
                    None => return,
                }
            }
        };
        if peer.addr != addr {
            debug!("Channel {} data from unexpected address {}", channel_id, addr);
            return;
        }

        match peer.connection.input(payload) {
            Ok(packs) => {
                for pack in packs {
                    peer.session.receive(pack);
                }
            }
            Err(e) => {
                let prefix = &payload[..payload.len().min(16)];
                warn!("Protocol error on channel {} from {}: {} ({})", channel_id, addr, e, hex::encode(prefix));
                self.peers.remove(&channel_id);
                peer.session.dispose();
            }
        }
    }

    fn on_disconnect(&self, channel_id: u32, addr: SocketAddr) {
        self.pending.remove_if(&channel_id, |_, pending| pending.addr == addr);
        if let Some((_, peer)) = self.peers.remove_if(&channel_id, |_, peer| peer.addr == addr) {
            debug!("Channel {} disconnected by {}", channel_id, addr);
            peer.connection.close_silently();
            peer.session.dispose();
        }
    }

    fn update(&self) {
        let now = Instant::now();
        self.pending.retain(|_, pending| pending.expires > now);

        let mut dropped = Vec::new();
        for entry in self.peers.iter() {
            let peer = entry.value();
            if peer.connection.is_closed() || peer.session.is_disposed() {
                dropped.push(*entry.key());
            } else if !peer.connection.update() {
                warn!("Channel {} to {} is dead", entry.key(), peer.addr);
                dropped.push(*entry.key());
            }
        }

        for channel_id in dropped {
            if let Some((_, peer)) = self.peers.remove(&channel_id) {
                peer.session.dispose();
            }
        }
    }
}
