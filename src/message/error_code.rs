//! Stable error codes carried on responses.
//!
//! Routing and timeout failures are reported through
//! [`Response::error_code`](super::Response::error_code), never as `Err`.
//! Codes below `100_000_000` are free for game logic.

/// No error.
pub const SUCCESS: u32 = 0;
/// The call failed in transport or the channel was disposed.
pub const RPC_FAIL: u32 = 100_000_001;
/// No route to the target.
pub const NOT_FOUND_ROUTE: u32 = 100_000_002;
/// The call deadline elapsed.
pub const ROUTE_TIMEOUT: u32 = 100_000_003;
/// The target scene does not hold the addressed entity.
pub const ENTITY_NOT_FOUND: u32 = 100_000_004;
/// The session has no link for the roaming type.
pub const NOT_FOUND_ROAMING: u32 = 100_000_005;
/// Waiting on a locked terminus timed out.
pub const ROAMING_TIMEOUT: u32 = 100_000_006;
/// A terminus transfer failed.
pub const TRANSFER_ERROR: u32 = 100_000_007;
/// The session already links this roaming type.
pub const ROAMING_ALREADY_LINKED: u32 = 100_000_008;
/// The target scene already holds a terminus for this link.
pub const TERMINUS_ALREADY_EXISTS: u32 = 100_000_009;
/// No handler is registered for the opcode.
pub const HANDLER_NOT_FOUND: u32 = 100_000_010;

/// Name of a runtime error code, for logs.
pub fn name(code: u32) -> &'static str {
    match code {
        SUCCESS => "success",
        RPC_FAIL => "rpc_fail",
        NOT_FOUND_ROUTE => "not_found_route",
        ROUTE_TIMEOUT => "route_timeout",
        ENTITY_NOT_FOUND => "entity_not_found",
        NOT_FOUND_ROAMING => "not_found_roaming",
        ROAMING_TIMEOUT => "roaming_timeout",
        TRANSFER_ERROR => "transfer_error",
        ROAMING_ALREADY_LINKED => "roaming_already_linked",
        TERMINUS_ALREADY_EXISTS => "terminus_already_exists",
        HANDLER_NOT_FOUND => "handler_not_found",
        _ => "application",
    }
}

/// Codes that mean the actor moved or is not there yet.
pub fn is_route_miss(code: u32) -> bool {
    code == NOT_FOUND_ROUTE || code == ENTITY_NOT_FOUND
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(name(ROUTE_TIMEOUT), "route_timeout");
        assert_eq!(name(42), "application");
        assert!(is_route_miss(ENTITY_NOT_FOUND));
        assert!(!is_route_miss(ROUTE_TIMEOUT));
    }
}
