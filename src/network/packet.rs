//! Packet Framing
//!
//! Every transport carries the same packet: a fixed little-endian header
//! followed by a codec-encoded body.
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────────┬─────────────────┬──────────┐
//! │ body_len │ op_code  │ rpc_id   │ route_id     │ route_type_code │ body ... │
//! │ u32      │ u32      │ u32      │ i64          │ i64             │          │
//! └──────────┴──────────┴──────────┴──────────────┴─────────────────┴──────────┘
//!   0          4          8          12             20                28
//! ```
//!
//! Stream transports use [`PacketCodec`], which buffers partial reads until a
//! full packet is available. Message transports (KCP, WebSocket) deliver
//! whole packets and use [`PackInfo::decode`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::core::id::RuntimeId;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 28;

/// Default upper bound on a body.
pub const DEFAULT_MAX_BODY: usize = 1024 * 1024;

/// Hex of the leading bytes of a rejected packet, for logs. Covers the header.
pub fn hex_prefix(data: &[u8]) -> String {
    hex::encode(&data[..data.len().min(HEADER_SIZE)])
}

/// Framing errors. Any of these is fatal for the channel that produced it.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    /// Fewer bytes than a header.
    #[error("Truncated packet: need {needed} bytes, got {got}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        got: usize,
    },

    /// Declared body exceeds the limit.
    #[error("Body of {len} bytes exceeds limit of {max}")]
    BodyTooLarge {
        /// Declared length.
        len: usize,
        /// Configured limit.
        max: usize,
    },

    /// Declared length disagrees with the datagram size.
    #[error("Declared body length {declared} but {actual} bytes follow the header")]
    LengthMismatch {
        /// Header value.
        declared: usize,
        /// Actual payload size.
        actual: usize,
    },

    /// Underlying stream error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Body length in bytes.
    pub body_len: u32,
    /// Message opcode.
    pub op_code: u32,
    /// Call correlation id, 0 when no reply is expected.
    pub rpc_id: u32,
    /// Destination address.
    pub route_id: RuntimeId,
    /// Route discriminator (roaming type).
    pub route_type_code: i64,
}

impl PacketHeader {
    fn read(buf: &mut impl Buf) -> Self {
        Self {
            body_len: buf.get_u32_le(),
            op_code: buf.get_u32_le(),
            rpc_id: buf.get_u32_le(),
            route_id: RuntimeId(buf.get_i64_le()),
            route_type_code: buf.get_i64_le(),
        }
    }
}

/// One packet travelling through the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackInfo {
    /// Call correlation id.
    pub rpc_id: u32,
    /// Destination address.
    pub route_id: RuntimeId,
    /// Message opcode.
    pub op_code: u32,
    /// Route discriminator.
    pub route_type_code: i64,
    /// Encoded body.
    pub body: Bytes,
}

impl PackInfo {
    /// Packet with just an opcode and body.
    pub fn new(op_code: u32, body: Bytes) -> Self {
        Self {
            op_code,
            body,
            ..Default::default()
        }
    }

    /// Set the correlation id.
    pub fn with_rpc_id(mut self, rpc_id: u32) -> Self {
        self.rpc_id = rpc_id;
        self
    }

    /// Set the destination.
    pub fn with_route(mut self, route_id: RuntimeId) -> Self {
        self.route_id = route_id;
        self
    }

    /// Set the route discriminator.
    pub fn with_route_type(mut self, route_type_code: i64) -> Self {
        self.route_type_code = route_type_code;
        self
    }

    /// Body length.
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Header of this packet.
    pub fn header(&self) -> PacketHeader {
        PacketHeader {
            body_len: self.body.len() as u32,
            op_code: self.op_code,
            rpc_id: self.rpc_id,
            route_id: self.route_id,
            route_type_code: self.route_type_code,
        }
    }

    /// Append header and body to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE + self.body.len());
        dst.put_u32_le(self.body.len() as u32);
        dst.put_u32_le(self.op_code);
        dst.put_u32_le(self.rpc_id);
        dst.put_i64_le(self.route_id.0);
        dst.put_i64_le(self.route_type_code);
        dst.extend_from_slice(&self.body);
    }

    /// Serialize into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.body.len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Parse exactly one packet from a message-oriented transport.
    /// The body is sliced out of `data` without copying.
    pub fn decode(mut data: Bytes, max_body: usize) -> Result<Self, PacketError> {
        if data.len() < HEADER_SIZE {
            return Err(PacketError::Truncated {
                needed: HEADER_SIZE,
                got: data.len(),
            });
        }
        let header = PacketHeader::read(&mut data);
        let declared = header.body_len as usize;
        if declared > max_body {
            return Err(PacketError::BodyTooLarge { len: declared, max: max_body });
        }
        if declared != data.len() {
            return Err(PacketError::LengthMismatch {
                declared,
                actual: data.len(),
            });
        }
        Ok(Self::from_parts(header, data))
    }

    fn from_parts(header: PacketHeader, body: Bytes) -> Self {
        Self {
            rpc_id: header.rpc_id,
            route_id: header.route_id,
            op_code: header.op_code,
            route_type_code: header.route_type_code,
            body,
        }
    }
}

// =============================================================================
// STREAM CODEC
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Header,
    Body(PacketHeader),
}

/// Incremental length-prefixed decoder/encoder for byte streams.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_body: usize,
    state: DecodeState,
    peer: Option<SocketAddr>,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BODY)
    }
}

impl PacketCodec {
    /// Codec rejecting bodies above `max_body`.
    pub fn new(max_body: usize) -> Self {
        Self {
            max_body,
            state: DecodeState::Header,
            peer: None,
        }
    }

    /// Name the remote end in protocol-error logs.
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }
}

impl Decoder for PacketCodec {
    type Item = PackInfo;
    type Error = PacketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<PackInfo>, PacketError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if src.len() < HEADER_SIZE {
                        src.reserve(HEADER_SIZE - src.len());
                        return Ok(None);
                    }
                    let header = PacketHeader::read(&mut &src[..HEADER_SIZE]);
                    let len = header.body_len as usize;
                    if len > self.max_body {
                        // Header stays in `src` so the dump shows what was sent.
                        warn!(
                            "Oversized packet from {:?}: {} > {} bytes, header {}",
                            self.peer,
                            len,
                            self.max_body,
                            hex_prefix(src)
                        );
                        return Err(PacketError::BodyTooLarge { len, max: self.max_body });
                    }
                    src.advance(HEADER_SIZE);
                    self.state = DecodeState::Body(header);
                }
                DecodeState::Body(header) => {
                    let len = header.body_len as usize;
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }
                    let body = src.split_to(len).freeze();
                    self.state = DecodeState::Header;
                    return Ok(Some(PackInfo::from_parts(header, body)));
                }
            }
        }
    }
}

impl Encoder<PackInfo> for PacketCodec {
    type Error = PacketError;

    fn encode(&mut self, item: PackInfo, dst: &mut BytesMut) -> Result<(), PacketError> {
        if item.body.len() > self.max_body {
            return Err(PacketError::BodyTooLarge {
                len: item.body.len(),
                max: self.max_body,
            });
        }
        item.encode_into(dst);
        Ok(())
    }
}
