//! Handler registry.
//!
//! Built once at process start from [`Registrar`]s, then frozen and shared
//! by every scene. Lookups are a single hash probe by opcode; nothing is
//! discovered at call time.

use futures_util::future::LocalBoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::{CodecError, Message, Request, Response};
use crate::core::id::RuntimeId;
use crate::entity::SceneContext;
use crate::network::packet::PackInfo;
use crate::network::session::Session;

/// Dispatch errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Two handlers claimed one opcode.
    #[error("Opcode {0} registered twice")]
    DuplicateOpCode(u32),

    /// No handler for the opcode.
    #[error("No handler for opcode {0}")]
    HandlerNotFound(u32),

    /// The body did not decode as the registered type.
    #[error("Failed to decode opcode {op_code}: {source}")]
    Decode {
        /// Offending opcode.
        op_code: u32,
        /// Codec failure.
        source: CodecError,
    },

    /// The reply could not be encoded.
    #[error("Failed to encode reply: {0}")]
    Encode(#[from] CodecError),
}

/// Everything a handler can reach.
#[derive(Clone)]
pub struct HandlerContext {
    /// Scene running the handler.
    pub scene: SceneContext,
    /// Session the packet arrived on; replies go back through it.
    pub session: Session,
    /// Address the packet was sent to: the scene itself or an entity in it.
    pub target: RuntimeId,
    /// Route discriminator of the packet.
    pub route_type_code: i64,
}

type HandlerFuture = LocalBoxFuture<'static, Result<Option<PackInfo>, DispatchError>>;

type HandlerFn = Arc<dyn Fn(HandlerContext, PackInfo) -> HandlerFuture + Send + Sync>;

/// Reply helpers for one request type, usable without knowing the type.
#[derive(Clone, Copy)]
struct ResponseCodec {
    error_pack: fn(u32) -> Option<PackInfo>,
    error_code: fn(&[u8]) -> Option<u32>,
}

impl ResponseCodec {
    fn of<R: Request>() -> Self {
        Self {
            error_pack: error_pack::<R>,
            error_code: reply_error_code::<R>,
        }
    }
}

fn error_pack<R: Request>(code: u32) -> Option<PackInfo> {
    let response = R::Response::from_error(code);
    response
        .encode_body()
        .ok()
        .map(|body| PackInfo::new(<R::Response as Message>::OP_CODE, body))
}

fn reply_error_code<R: Request>(body: &[u8]) -> Option<u32> {
    R::Response::decode_body(body).ok().map(|response| response.error_code())
}

/// Source of handler registrations.
pub trait Registrar {
    /// Add handlers to `builder`.
    fn register(&self, builder: &mut DispatcherBuilder) -> Result<(), DispatchError>;
}

impl<F> Registrar for F
where
    F: Fn(&mut DispatcherBuilder) -> Result<(), DispatchError>,
{
    fn register(&self, builder: &mut DispatcherBuilder) -> Result<(), DispatchError> {
        self(builder)
    }
}

/// Mutable registry used during startup.
#[derive(Default)]
pub struct DispatcherBuilder {
    handlers: HashMap<u32, HandlerFn>,
    responses: HashMap<u32, ResponseCodec>,
}

impl DispatcherBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, op_code: u32, handler: HandlerFn) -> Result<(), DispatchError> {
        if self.handlers.contains_key(&op_code) {
            return Err(DispatchError::DuplicateOpCode(op_code));
        }
        self.handlers.insert(op_code, handler);
        Ok(())
    }

    /// Register a fire-and-forget handler.
    pub fn message<M, F, Fut>(&mut self, handler: F) -> Result<&mut Self, DispatchError>
    where
        M: Message,
        F: Fn(HandlerContext, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let handler = Arc::new(handler);
        let erased: HandlerFn = Arc::new(move |ctx: HandlerContext, pack: PackInfo| -> HandlerFuture {
            let handler = handler.clone();
            Box::pin(async move {
                let message = M::decode_body(&pack.body).map_err(|source| DispatchError::Decode {
                    op_code: pack.op_code,
                    source,
                })?;
                handler(ctx, message).await;
                Ok(None)
            })
        });
        self.insert(M::OP_CODE, erased)?;
        Ok(self)
    }

    /// Register a request handler. Its return value is sent back with the
    /// caller's rpc id.
    pub fn request<R, F, Fut>(&mut self, handler: F) -> Result<&mut Self, DispatchError>
    where
        R: Request,
        F: Fn(HandlerContext, R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R::Response> + 'static,
    {
        let handler = Arc::new(handler);
        let erased: HandlerFn = Arc::new(move |ctx: HandlerContext, pack: PackInfo| -> HandlerFuture {
            let handler = handler.clone();
            Box::pin(async move {
                let request = R::decode_body(&pack.body).map_err(|source| DispatchError::Decode {
                    op_code: pack.op_code,
                    source,
                })?;
                let response = handler(ctx, request).await;
                let body = response.encode_body()?;
                Ok(Some(
                    PackInfo::new(<R::Response as Message>::OP_CODE, body).with_rpc_id(pack.rpc_id),
                ))
            })
        });
        self.insert(R::OP_CODE, erased)?;
        self.responses.insert(R::OP_CODE, ResponseCodec::of::<R>());
        Ok(self)
    }

    /// Make a request type known without handling it here, so forwarded
    /// calls can still be answered with an error code.
    pub fn declare<R: Request>(&mut self) -> &mut Self {
        self.responses.insert(R::OP_CODE, ResponseCodec::of::<R>());
        self
    }

    /// Apply a registrar.
    pub fn register(&mut self, registrar: &dyn Registrar) -> Result<&mut Self, DispatchError> {
        registrar.register(self)?;
        Ok(self)
    }

    /// Freeze.
    pub fn build(self) -> MessageDispatcher {
        MessageDispatcher {
            handlers: self.handlers,
            responses: self.responses,
        }
    }
}

/// Frozen opcode → handler table.
pub struct MessageDispatcher {
    handlers: HashMap<u32, HandlerFn>,
    responses: HashMap<u32, ResponseCodec>,
}

impl MessageDispatcher {
    /// Start a builder.
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// True if a handler exists for `op_code`.
    pub fn contains(&self, op_code: u32) -> bool {
        self.handlers.contains_key(&op_code)
    }

    /// Registered handler count.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler for `pack`. Requests resolve to their encoded reply.
    pub fn dispatch(&self, ctx: HandlerContext, pack: PackInfo) -> HandlerFuture {
        match self.handlers.get(&pack.op_code) {
            Some(handler) => handler(ctx, pack),
            None => {
                let op_code = pack.op_code;
                Box::pin(async move { Err(DispatchError::HandlerNotFound(op_code)) })
            }
        }
    }

    /// Encoded error reply for a request opcode, if the type is known.
    pub fn error_response(&self, request_op: u32, rpc_id: u32, code: u32) -> Option<PackInfo> {
        let codec = self.responses.get(&request_op)?;
        (codec.error_pack)(code).map(|pack| pack.with_rpc_id(rpc_id))
    }

    /// Error code carried by a reply body to `request_op`, if the type is known
    /// and the body decodes.
    pub fn response_error_code(&self, request_op: u32, body: &[u8]) -> Option<u32> {
        let codec = self.responses.get(&request_op)?;
        (codec.error_code)(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::error_code;
    use crate::message::protocol::{AddressableGetRequest, AddressableGetResponse, PingRequest};

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut builder = MessageDispatcher::builder();
        builder
            .request(|_ctx, _req: AddressableGetRequest| async { AddressableGetResponse::default() })
            .unwrap();
        let err = builder
            .request(|_ctx, _req: AddressableGetRequest| async { AddressableGetResponse::default() })
            .err()
            .unwrap();
        assert!(matches!(err, DispatchError::DuplicateOpCode(op) if op == AddressableGetRequest::OP_CODE));
    }

    #[test]
    fn test_error_response_for_declared_request() {
        let mut builder = MessageDispatcher::builder();
        builder.declare::<AddressableGetRequest>();
        let dispatcher = builder.build();

        let pack = dispatcher
            .error_response(AddressableGetRequest::OP_CODE, 12, error_code::NOT_FOUND_ROUTE)
            .unwrap();
        assert_eq!(pack.rpc_id, 12);
        assert_eq!(pack.op_code, AddressableGetResponse::OP_CODE);
        let decoded = AddressableGetResponse::decode_body(&pack.body).unwrap();
        assert_eq!(decoded.error_code, error_code::NOT_FOUND_ROUTE);

        assert_eq!(
            dispatcher.response_error_code(AddressableGetRequest::OP_CODE, &pack.body),
            Some(error_code::NOT_FOUND_ROUTE)
        );
        assert!(dispatcher.error_response(PingRequest::OP_CODE, 1, 1).is_none());
        assert!(dispatcher.response_error_code(PingRequest::OP_CODE, &pack.body).is_none());
        assert!(!dispatcher.contains(AddressableGetRequest::OP_CODE));
    }

    #[test]
    fn test_registrar_closure() {
        let registrar = |builder: &mut DispatcherBuilder| -> Result<(), DispatchError> {
            builder.message(|_ctx, _msg: PingRequest| async {})?;
            Ok(())
        };
        let mut builder = MessageDispatcher::builder();
        builder.register(&registrar).unwrap();
        let dispatcher = builder.build();
        assert!(dispatcher.contains(PingRequest::OP_CODE));
        assert_eq!(dispatcher.len(), 1);
    }
}
