//! Transport-neutral channel abstraction.
//!
//! A [`Session`](super::Session) talks to its peer through a
//! [`NetworkChannel`]. Stream transports (TCP, WebSocket) back it with a
//! writer task fed by [`QueuedChannel`]; KCP provides its own.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

use super::kcp::KcpError;
use super::packet::{PackInfo, PacketError};
use crate::core::id::RuntimeId;
use crate::message::CodecError;

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing error.
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// ARQ error.
    #[error("KCP error: {0}")]
    Kcp(#[from] KcpError),

    /// Body encoding failed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The channel is closed.
    #[error("Channel closed")]
    Closed,

    /// Too much unacknowledged data is queued.
    #[error("Send buffer full: {waiting} segments waiting")]
    SendBufferFull {
        /// Segments waiting.
        waiting: usize,
    },

    /// The connection handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Connecting took too long.
    #[error("Connect timed out")]
    ConnectTimeout,

    /// No scene owns the destination.
    #[error("No route to {0}")]
    NoRoute(RuntimeId),
}

/// A bidirectional packet pipe.
pub trait NetworkChannel: Send + Sync {
    /// Queue a packet for the peer.
    fn send(&self, pack: PackInfo) -> Result<(), NetworkError>;

    /// Close the channel. Idempotent.
    fn close(&self);

    /// True once closed.
    fn is_closed(&self) -> bool;

    /// Peer address, if the transport has one.
    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// Channel half handed to a writer task.
#[derive(Debug)]
pub struct ChannelWriter {
    /// Outgoing packets.
    pub rx: mpsc::UnboundedReceiver<PackInfo>,
    /// Signalled when the channel is closed.
    pub closed: Arc<Notify>,
}

/// Channel whose packets are drained by a writer task.
pub struct QueuedChannel {
    tx: mpsc::UnboundedSender<PackInfo>,
    closed: AtomicBool,
    notify: Arc<Notify>,
    remote_addr: Option<SocketAddr>,
}

impl QueuedChannel {
    /// Create the channel and its writer half.
    pub fn new(remote_addr: Option<SocketAddr>) -> (Self, ChannelWriter) {
        let (tx, rx) = mpsc::unbounded_channel();
        let notify = Arc::new(Notify::new());
        let channel = Self {
            tx,
            closed: AtomicBool::new(false),
            notify: notify.clone(),
            remote_addr,
        };
        (channel, ChannelWriter { rx, closed: notify })
    }
}

impl NetworkChannel for QueuedChannel {
    fn send(&self, pack: PackInfo) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }
        self.tx.send(pack).map_err(|_| NetworkError::Closed)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
            self.notify.notify_one();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}
