//! One logical KCP connection on a shared socket.

use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{trace, warn};

use super::arq::Kcp;
use super::{encode_datagram, KcpHeader, KcpSettings};
use crate::network::channel::{NetworkChannel, NetworkError};
use crate::network::packet::PackInfo;

enum LinkState {
    /// Handshake in progress; outgoing packets wait here.
    Connecting(Vec<Bytes>),
    Connected(Kcp),
}

/// ARQ engine plus the socket it writes to.
pub struct KcpConnection {
    remote: SocketAddr,
    socket: Arc<UdpSocket>,
    settings: KcpSettings,
    max_body: usize,
    state: Mutex<LinkState>,
    channel_id: Mutex<u32>,
    closed: AtomicBool,
    started: Instant,
}

impl KcpConnection {
    /// Connection that still has to finish its handshake.
    pub fn connecting(
        channel_id: u32,
        remote: SocketAddr,
        socket: Arc<UdpSocket>,
        settings: KcpSettings,
        max_body: usize,
    ) -> Self {
        Self {
            remote,
            socket,
            settings,
            max_body,
            state: Mutex::new(LinkState::Connecting(Vec::new())),
            channel_id: Mutex::new(channel_id),
            closed: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    /// Connection whose handshake already completed.
    pub fn connected(
        channel_id: u32,
        remote: SocketAddr,
        socket: Arc<UdpSocket>,
        settings: KcpSettings,
        max_body: usize,
    ) -> Result<Self, NetworkError> {
        let connection = Self::connecting(channel_id, remote, socket, settings, max_body);
        connection.establish(channel_id)?;
        Ok(connection)
    }

    /// Current channel id.
    pub fn channel_id(&self) -> u32 {
        *self.channel_id.lock()
    }

    /// Change the id while still connecting.
    pub fn set_channel_id(&self, channel_id: u32) {
        *self.channel_id.lock() = channel_id;
    }

    /// True once the ARQ engine runs.
    pub fn is_established(&self) -> bool {
        matches!(*self.state.lock(), LinkState::Connected(_))
    }

    fn now_ms(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }

    /// Start the ARQ engine and push everything queued during the handshake.
    pub fn establish(&self, channel_id: u32) -> Result<(), NetworkError> {
        self.set_channel_id(channel_id);

        let socket = self.socket.clone();
        let remote = self.remote;
        let mut kcp = Kcp::new(
            channel_id,
            Box::new(move |segments: &[u8]| {
                let datagram = encode_datagram(KcpHeader::ReceiveData, channel_id, segments);
                if let Err(e) = socket.try_send_to(&datagram, remote) {
                    trace!("Dropped datagram to {}: {}", remote, e);
                }
            }),
        );
        self.settings.apply(&mut kcp)?;

        let mut state = self.state.lock();
        let cached = match std::mem::replace(&mut *state, LinkState::Connecting(Vec::new())) {
            LinkState::Connecting(cached) => cached,
            LinkState::Connected(existing) => {
                *state = LinkState::Connected(existing);
                return Ok(());
            }
        };
        for bytes in &cached {
            kcp.send(bytes)?;
        }
        kcp.update(self.now_ms());
        *state = LinkState::Connected(kcp);
        Ok(())
    }

    /// Feed one `ReceiveData` payload; returns the packets it completed.
    pub fn input(&self, payload: &[u8]) -> Result<Vec<PackInfo>, NetworkError> {
        let mut state = self.state.lock();
        let LinkState::Connected(kcp) = &mut *state else {
            return Ok(Vec::new());
        };
        kcp.input(payload)?;

        let mut packs = Vec::new();
        while let Ok(message) = kcp.recv() {
            packs.push(PackInfo::decode(message, self.max_body)?);
        }
        Ok(packs)
    }

    /// Drive retransmission. Returns false once the link is dead.
    pub fn update(&self) -> bool {
        let now = self.now_ms();
        let mut state = self.state.lock();
        match &mut *state {
            LinkState::Connected(kcp) => {
                kcp.update(now);
                !kcp.is_dead()
            }
            LinkState::Connecting(_) => true,
        }
    }

    /// Segments not yet acknowledged.
    pub fn wait_snd(&self) -> usize {
        match &*self.state.lock() {
            LinkState::Connected(kcp) => kcp.wait_snd(),
            LinkState::Connecting(cached) => cached.len(),
        }
    }

    /// Send a control datagram.
    pub fn send_control(&self, header: KcpHeader) {
        let datagram = encode_datagram(header, self.channel_id(), &[]);
        if let Err(e) = self.socket.try_send_to(&datagram, self.remote) {
            trace!("Failed to send {:?} to {}: {}", header, self.remote, e);
        }
    }

    /// Mark closed without telling the peer.
    pub fn close_silently(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl NetworkChannel for KcpConnection {
    fn send(&self, pack: PackInfo) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }
        let bytes = pack.to_bytes();

        let mut state = self.state.lock();
        match &mut *state {
            LinkState::Connecting(cached) => {
                cached.push(bytes);
                Ok(())
            }
            LinkState::Connected(kcp) => {
                let waiting = kcp.wait_snd();
                if waiting > self.settings.max_wait_send {
                    drop(state);
                    warn!(
                        "Channel {} to {} has {} unacknowledged segments, disconnecting",
                        self.channel_id(),
                        self.remote,
                        waiting
                    );
                    self.close();
                    return Err(NetworkError::SendBufferFull { waiting });
                }
                kcp.send(&bytes)?;
                kcp.flush();
                Ok(())
            }
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.send_control(KcpHeader::Disconnect);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }
}
