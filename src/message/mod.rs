//! Message Dispatch & RPC
//!
//! Typed messages, opcode classification, payload codecs, the startup-built
//! handler registry and the per-channel table of outstanding calls.

pub mod codec;
pub mod dispatcher;
pub mod error_code;
pub mod opcode;
pub mod protocol;
pub mod rpc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use codec::{BincodeCodec, Codec, CodecError, CodecKind, JsonCodec};
pub use dispatcher::{DispatchError, DispatcherBuilder, HandlerContext, MessageDispatcher, Registrar};
pub use opcode::{OpCode, OpCodeKind};
pub use rpc::{RpcReply, RpcTable};

/// A typed message with a fixed opcode.
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    /// Wire opcode.
    const OP_CODE: u32;
    /// Body codec.
    const CODEC: CodecKind = CodecKind::Bincode;

    /// Encode the body.
    fn encode_body(&self) -> Result<Bytes, CodecError> {
        Self::CODEC.encode(self)
    }

    /// Decode a body.
    fn decode_body(body: &[u8]) -> Result<Self, CodecError> {
        Self::CODEC.decode(body)
    }
}

/// A message that expects a reply.
pub trait Request: Message {
    /// Reply type.
    type Response: Response;
}

/// A reply. `Default` is used to build error replies.
pub trait Response: Message + Default {
    /// Error code, 0 on success.
    fn error_code(&self) -> u32;
    /// Set the error code.
    fn set_error_code(&mut self, code: u32);

    /// Default reply carrying `code`.
    fn from_error(code: u32) -> Self {
        let mut response = Self::default();
        response.set_error_code(code);
        response
    }
}
