//! Network Layer
//!
//! Packet framing, transports (TCP, WebSocket, reliable UDP) and the
//! [`Session`] abstraction every transport feeds into.

pub mod channel;
pub mod kcp;
pub mod packet;
pub mod server;
pub mod session;
pub mod tcp;
pub mod websocket;

pub use channel::{NetworkChannel, NetworkError, QueuedChannel};
pub use kcp::{KcpClient, KcpServer, KcpSettings};
pub use packet::{PackInfo, PacketCodec, PacketError, HEADER_SIZE};
pub use server::{connect, ConnectOptions, NetworkServer, ServerConfig, SessionAcceptor};
pub use session::{InboundHandler, Session, SessionKind};
