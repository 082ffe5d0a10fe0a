//! Reliable UDP
//!
//! Many logical connections share one UDP socket. Every datagram starts
//! with a 5-byte prefix naming what it carries and which connection it
//! belongs to:
//!
//! ```text
//! ┌────────┬─────────────────┬─────────────────────────┐
//! │ header │ channel_id (LE) │ payload (KCP segments)  │
//! │  u8    │ u32             │ only for ReceiveData    │
//! └────────┴─────────────────┴─────────────────────────┘
//! ```
//!
//! Handshake: the client picks a channel id and sends `RequestConnection`;
//! the server answers `WaitConfirmConnection` (or `RepeatChannelId` if the
//! id is taken), the client confirms and both sides start their ARQ engines
//! with the channel id as conversation id.

pub mod arq;
pub mod client;
pub mod connection;
pub mod server;

use serde::{Deserialize, Serialize};

pub use arq::{Kcp, KcpError, KCP_OVERHEAD};
pub use client::KcpClient;
pub use connection::KcpConnection;
pub use server::KcpServer;

/// Datagram prefix size.
pub const PREFIX_SIZE: usize = 5;

/// Datagram kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KcpHeader {
    /// Client asks for a channel.
    RequestConnection = 0x01,
    /// Server accepted the id; waiting for confirmation.
    WaitConfirmConnection = 0x02,
    /// Client confirms.
    ConfirmConnection = 0x03,
    /// The id is held by another peer; pick a new one.
    RepeatChannelId = 0x04,
    /// ARQ payload.
    ReceiveData = 0x06,
    /// Tear the channel down.
    Disconnect = 0x07,
}

impl TryFrom<u8> for KcpHeader {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x01 => Ok(Self::RequestConnection),
            0x02 => Ok(Self::WaitConfirmConnection),
            0x03 => Ok(Self::ConfirmConnection),
            0x04 => Ok(Self::RepeatChannelId),
            0x06 => Ok(Self::ReceiveData),
            0x07 => Ok(Self::Disconnect),
            other => Err(other),
        }
    }
}

/// Build a datagram.
pub fn encode_datagram(header: KcpHeader, channel_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(PREFIX_SIZE + payload.len());
    datagram.push(header as u8);
    datagram.extend_from_slice(&channel_id.to_le_bytes());
    datagram.extend_from_slice(payload);
    datagram
}

/// Split a datagram into header, channel id and payload.
pub fn decode_datagram(datagram: &[u8]) -> Option<(KcpHeader, u32, &[u8])> {
    if datagram.len() < PREFIX_SIZE {
        return None;
    }
    let header = KcpHeader::try_from(datagram[0]).ok()?;
    let channel_id = u32::from_le_bytes([datagram[1], datagram[2], datagram[3], datagram[4]]);
    Some((header, channel_id, &datagram[PREFIX_SIZE..]))
}

/// Fresh client-chosen channel id. The top two bits are always set.
pub fn client_channel_id() -> u32 {
    let random = uuid::Uuid::new_v4().as_u128() as u32;
    0xC000_0000 | (random & 0x7FFF_FFFF)
}

/// ARQ tuning shared by both ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KcpSettings {
    /// Datagram size including the prefix.
    pub mtu: usize,
    /// Send window (segments).
    pub snd_wnd: u16,
    /// Receive window (segments).
    pub rcv_wnd: u16,
    /// 0 normal, 1 low-latency RTO, 2 aggressive backoff.
    pub nodelay: u32,
    /// Update interval (ms).
    pub interval: u32,
    /// Fast-retransmit after this many skipping ACKs (0 off).
    pub resend: u32,
    /// Disable congestion control.
    pub no_congestion: bool,
    /// Unacknowledged segments tolerated before the channel is dropped.
    pub max_wait_send: usize,
}

impl Default for KcpSettings {
    fn default() -> Self {
        Self {
            mtu: 1400,
            snd_wnd: 256,
            rcv_wnd: 256,
            nodelay: 1,
            interval: 10,
            resend: 2,
            no_congestion: true,
            max_wait_send: 1024,
        }
    }
}

impl KcpSettings {
    /// Configure a fresh engine.
    pub fn apply(&self, kcp: &mut Kcp) -> Result<(), KcpError> {
        kcp.set_mtu(self.mtu.saturating_sub(PREFIX_SIZE))?;
        kcp.set_wndsize(self.snd_wnd, self.rcv_wnd);
        kcp.set_nodelay(self.nodelay, self.interval, self.resend, self.no_congestion);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_prefix() {
        let datagram = encode_datagram(KcpHeader::ReceiveData, 0xC000_0001, b"seg");
        assert_eq!(datagram.len(), PREFIX_SIZE + 3);
        assert_eq!(datagram[0], 0x06);
        let (header, channel_id, payload) = decode_datagram(&datagram).unwrap();
        assert_eq!(header, KcpHeader::ReceiveData);
        assert_eq!(channel_id, 0xC000_0001);
        assert_eq!(payload, b"seg");

        assert!(decode_datagram(&[0x05, 0, 0, 0, 0]).is_none());
        assert!(decode_datagram(&[0x01, 0]).is_none());
    }

    #[test]
    fn test_client_channel_id_range() {
        for _ in 0..100 {
            let id = client_channel_id();
            assert_eq!(id & 0xC000_0000, 0xC000_0000);
        }
    }
}
