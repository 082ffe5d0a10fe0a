//! Opcode classification.
//!
//! Opcodes are grouped into decimal bands of ten million; the band decides
//! how a packet is routed. Request opcodes are conventionally paired with a
//! response opcode two bands higher (`100_000_001` → `120_000_001`).

use std::fmt;

/// Width of one opcode band.
pub const BAND: u32 = 10_000_000;

/// Built-in opcodes used by the runtime itself.
pub mod builtin {
    /// Keep-alive / RTT probe.
    pub const PING_REQUEST: u32 = 90_000_001;
    /// Reply to a ping.
    pub const PING_RESPONSE: u32 = 90_000_002;

    /// Register an addressable actor.
    pub const ADDRESSABLE_ADD_REQUEST: u32 = 200_000_001;
    /// Resolve an addressable actor.
    pub const ADDRESSABLE_GET_REQUEST: u32 = 200_000_002;
    /// Unregister an addressable actor.
    pub const ADDRESSABLE_REMOVE_REQUEST: u32 = 200_000_003;
    /// Begin a migration.
    pub const ADDRESSABLE_LOCK_REQUEST: u32 = 200_000_004;
    /// Commit or abort a migration.
    pub const ADDRESSABLE_UNLOCK_REQUEST: u32 = 200_000_005;
    /// Create a terminus for a roaming session.
    pub const LINK_ROAMING_REQUEST: u32 = 200_000_006;
    /// Dispose a terminus.
    pub const UNLINK_ROAMING_REQUEST: u32 = 200_000_007;

    /// Generic directory reply.
    pub const ADDRESSABLE_RESPONSE: u32 = 220_000_001;
    /// Directory lookup reply.
    pub const ADDRESSABLE_GET_RESPONSE: u32 = 220_000_002;
    /// Terminus creation reply.
    pub const LINK_ROAMING_RESPONSE: u32 = 220_000_006;
    /// Terminus disposal reply.
    pub const UNLINK_ROAMING_RESPONSE: u32 = 220_000_007;
}

/// Routing class of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCodeKind {
    /// Client request handled by the receiving scene.
    OuterRequest,
    /// Client message handled by the receiving scene.
    OuterMessage,
    /// Reply to an outer request.
    OuterResponse,
    /// Client message forwarded to the session's addressable actor.
    OuterAddressableMessage,
    /// Client request forwarded to the session's addressable actor.
    OuterAddressableRequest,
    /// Reply to an outer addressable request.
    OuterAddressableResponse,
    /// Client message forwarded to the linked terminus.
    OuterRoamingMessage,
    /// Client request forwarded to the linked terminus.
    OuterRoamingRequest,
    /// Reply to an outer roaming request.
    OuterRoamingResponse,
    /// Server-to-server request addressed by route id.
    InnerRequest,
    /// Server-to-server message addressed by route id.
    InnerMessage,
    /// Reply to an inner request.
    InnerResponse,
    /// Keep-alive request.
    PingRequest,
    /// Keep-alive reply.
    PingResponse,
    /// Outside every band.
    Unknown,
}

/// Message opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpCode(pub u32);

impl OpCode {
    /// Routing class.
    pub fn kind(self) -> OpCodeKind {
        match self.0 {
            builtin::PING_REQUEST => return OpCodeKind::PingRequest,
            builtin::PING_RESPONSE => return OpCodeKind::PingResponse,
            _ => {}
        }
        match self.0 / BAND {
            10 => OpCodeKind::OuterRequest,
            11 => OpCodeKind::OuterMessage,
            12 => OpCodeKind::OuterResponse,
            13 => OpCodeKind::OuterAddressableMessage,
            14 => OpCodeKind::OuterAddressableRequest,
            15 => OpCodeKind::OuterAddressableResponse,
            16 => OpCodeKind::OuterRoamingMessage,
            17 => OpCodeKind::OuterRoamingRequest,
            18 => OpCodeKind::OuterRoamingResponse,
            20 => OpCodeKind::InnerRequest,
            21 => OpCodeKind::InnerMessage,
            22 => OpCodeKind::InnerResponse,
            _ => OpCodeKind::Unknown,
        }
    }

    /// Replies are matched against the RPC table, never dispatched.
    pub fn is_response(self) -> bool {
        matches!(
            self.kind(),
            OpCodeKind::OuterResponse
                | OpCodeKind::OuterAddressableResponse
                | OpCodeKind::OuterRoamingResponse
                | OpCodeKind::InnerResponse
                | OpCodeKind::PingResponse
        )
    }

    /// Expects a reply.
    pub fn is_request(self) -> bool {
        matches!(
            self.kind(),
            OpCodeKind::OuterRequest
                | OpCodeKind::OuterAddressableRequest
                | OpCodeKind::OuterRoamingRequest
                | OpCodeKind::InnerRequest
                | OpCodeKind::PingRequest
        )
    }

    /// Sent to the addressable actor bound to the session.
    pub fn is_addressable(self) -> bool {
        matches!(
            self.kind(),
            OpCodeKind::OuterAddressableMessage | OpCodeKind::OuterAddressableRequest
        )
    }

    /// Sent to the terminus linked for the packet's route type.
    pub fn is_roaming(self) -> bool {
        matches!(
            self.kind(),
            OpCodeKind::OuterRoamingMessage | OpCodeKind::OuterRoamingRequest
        )
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
