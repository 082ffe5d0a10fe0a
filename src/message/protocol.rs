//! Runtime Protocol Messages
//!
//! Messages the runtime exchanges on its own behalf: keep-alive, the
//! addressable directory and roaming links. Game protocols define their own
//! types the same way.

use serde::{Deserialize, Serialize};

use super::opcode::builtin;
use super::{Message, Request, Response};
use crate::core::id::RuntimeId;

macro_rules! impl_response {
    ($ty:ty) => {
        impl Response for $ty {
            fn error_code(&self) -> u32 {
                self.error_code
            }

            fn set_error_code(&mut self, code: u32) {
                self.error_code = code;
            }
        }
    };
}

// =============================================================================
// KEEP-ALIVE
// =============================================================================

/// RTT probe; answered by the session itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {}

/// Ping reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    /// Error code.
    pub error_code: u32,
    /// Responder wall clock, Unix milliseconds.
    pub now_ms: i64,
}

impl Message for PingRequest {
    const OP_CODE: u32 = builtin::PING_REQUEST;
}

impl Request for PingRequest {
    type Response = PingResponse;
}

impl Message for PingResponse {
    const OP_CODE: u32 = builtin::PING_RESPONSE;
}

impl_response!(PingResponse);

// =============================================================================
// ADDRESSABLE DIRECTORY
// =============================================================================

/// Register `addressable_id` at `route_id`, optionally entering a migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressableAddRequest {
    /// Logical actor id.
    pub addressable_id: i64,
    /// Current owner.
    pub route_id: RuntimeId,
    /// Keep the entry locked after adding.
    pub is_lock: bool,
}

/// Resolve `addressable_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressableGetRequest {
    /// Logical actor id.
    pub addressable_id: i64,
}

/// Unregister `addressable_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressableRemoveRequest {
    /// Logical actor id.
    pub addressable_id: i64,
}

/// Begin migrating `addressable_id`; lookups wait until unlocked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressableLockRequest {
    /// Logical actor id.
    pub addressable_id: i64,
}

/// Finish a migration: commit to `route_id`, or abort when it is `NONE`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressableUnlockRequest {
    /// Logical actor id.
    pub addressable_id: i64,
    /// New owner.
    pub route_id: RuntimeId,
}

/// Directory reply without payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressableResponse {
    /// Error code.
    pub error_code: u32,
}

/// Directory lookup reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressableGetResponse {
    /// Error code.
    pub error_code: u32,
    /// Current owner, `NONE` if unregistered.
    pub route_id: RuntimeId,
}

impl Message for AddressableAddRequest {
    const OP_CODE: u32 = builtin::ADDRESSABLE_ADD_REQUEST;
}

impl Request for AddressableAddRequest {
    type Response = AddressableResponse;
}

impl Message for AddressableGetRequest {
    const OP_CODE: u32 = builtin::ADDRESSABLE_GET_REQUEST;
}

impl Request for AddressableGetRequest {
    type Response = AddressableGetResponse;
}

impl Message for AddressableRemoveRequest {
    const OP_CODE: u32 = builtin::ADDRESSABLE_REMOVE_REQUEST;
}

impl Request for AddressableRemoveRequest {
    type Response = AddressableResponse;
}

impl Message for AddressableLockRequest {
    const OP_CODE: u32 = builtin::ADDRESSABLE_LOCK_REQUEST;
}

impl Request for AddressableLockRequest {
    type Response = AddressableResponse;
}

impl Message for AddressableUnlockRequest {
    const OP_CODE: u32 = builtin::ADDRESSABLE_UNLOCK_REQUEST;
}

impl Request for AddressableUnlockRequest {
    type Response = AddressableResponse;
}

impl Message for AddressableResponse {
    const OP_CODE: u32 = builtin::ADDRESSABLE_RESPONSE;
}

impl_response!(AddressableResponse);

impl Message for AddressableGetResponse {
    const OP_CODE: u32 = builtin::ADDRESSABLE_GET_RESPONSE;
}

impl_response!(AddressableGetResponse);

// =============================================================================
// ROAMING
// =============================================================================

/// Ask a scene to create a terminus for a gate session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRoamingRequest {
    /// Gate session runtime id.
    pub roaming_id: RuntimeId,
    /// Roaming type.
    pub roaming_type: i64,
    /// Where the terminus sends client-bound messages.
    pub forward_route: RuntimeId,
}

/// Terminus creation reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRoamingResponse {
    /// Error code.
    pub error_code: u32,
    /// Address of the new terminus.
    pub terminus_route: RuntimeId,
}

/// Ask a scene to dispose a terminus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlinkRoamingRequest {
    /// Gate session runtime id.
    pub roaming_id: RuntimeId,
    /// Roaming type.
    pub roaming_type: i64,
}

/// Terminus disposal reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlinkRoamingResponse {
    /// Error code.
    pub error_code: u32,
}

impl Message for LinkRoamingRequest {
    const OP_CODE: u32 = builtin::LINK_ROAMING_REQUEST;
}

impl Request for LinkRoamingRequest {
    type Response = LinkRoamingResponse;
}

impl Message for LinkRoamingResponse {
    const OP_CODE: u32 = builtin::LINK_ROAMING_RESPONSE;
}

impl_response!(LinkRoamingResponse);

impl Message for UnlinkRoamingRequest {
    const OP_CODE: u32 = builtin::UNLINK_ROAMING_REQUEST;
}

impl Request for UnlinkRoamingRequest {
    type Response = UnlinkRoamingResponse;
}

impl Message for UnlinkRoamingResponse {
    const OP_CODE: u32 = builtin::UNLINK_ROAMING_RESPONSE;
}

impl_response!(UnlinkRoamingResponse);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::error_code;
    use crate::message::OpCode;

    #[test]
    fn test_error_response_factory() {
        let response = AddressableGetResponse::from_error(error_code::ROUTE_TIMEOUT);
        assert_eq!(response.error_code(), error_code::ROUTE_TIMEOUT);
        assert!(response.route_id.is_none());
    }

    #[test]
    fn test_builtin_pairs_are_classified() {
        assert!(OpCode(AddressableGetRequest::OP_CODE).is_request());
        assert!(OpCode(<AddressableGetRequest as Request>::Response::OP_CODE).is_response());
        assert!(OpCode(LinkRoamingRequest::OP_CODE).is_request());
        assert!(OpCode(PingResponse::OP_CODE).is_response());
    }

    #[test]
    fn test_body_roundtrip() {
        let request = AddressableUnlockRequest {
            addressable_id: 42,
            route_id: RuntimeId(7),
        };
        let body = request.encode_body().unwrap();
        assert_eq!(AddressableUnlockRequest::decode_body(&body).unwrap(), request);
    }
}
