//! The handler-dispatch side of an [`crate::endpoint::Endpoint`] (§4.5,
//! §4.6): accepts remote-initiated streams, resolves a method path to a
//! registered handler, and runs it under the middleware chain.

use crate::call::bidi::BidiHandler;
use crate::call::client_stream::ClientStreamHandler;
use crate::call::server_stream::ServerStreamHandler;
use crate::call::support::{next_inbound, ResponderCall, Inbound};
use crate::call::unary::{reject_unimplemented, ErasedHandler, UnaryHandler};
use crate::cancel::CancellationToken;
use crate::codec::BoxedCodec;
use crate::contract::{MethodContract, Pattern};
use crate::dispatch::HandlerRegistry;
use crate::metadata::Metadata;
use crate::middleware::{CallContext, MiddlewareChain};
use crate::mux::Multiplexer;
use crate::registry::ContractRegistry;
use crate::status::{Status, StatusCode};
use crate::Result;
use std::sync::Arc;
use tracing::warn;

/// The handler-registration and dispatch half of an endpoint (§4.5, §4.6).
/// Cheaply cloneable like [`crate::caller::CallerEndpoint`]; registration
/// methods may be called at any point in the endpoint's lifetime (§3: the
/// registry accepts new methods for as long as the endpoint is open).
#[derive(Clone)]
pub struct ResponderEndpoint {
    mux: Arc<Multiplexer>,
    contracts: Arc<ContractRegistry>,
    handlers: Arc<HandlerRegistry>,
    /// Shared with the owning [`crate::endpoint::Endpoint`], not a
    /// snapshot: `Endpoint::add_middleware` must take effect for the
    /// long-running accept loop too (§4.7, §6).
    middleware: Arc<std::sync::Mutex<MiddlewareChain>>,
    label: Option<String>,
}

impl ResponderEndpoint {
    pub(crate) fn new(
        mux: Arc<Multiplexer>,
        contracts: Arc<ContractRegistry>,
        handlers: Arc<HandlerRegistry>,
        middleware: Arc<std::sync::Mutex<MiddlewareChain>>,
        label: Option<String>,
    ) -> Self {
        ResponderEndpoint { mux, contracts, handlers, middleware, label }
    }

    /// Register a unary handler under `service`/`method` (§4.6 ad-hoc
    /// registration). Fails if the path is already registered either here
    /// or via a prior [`crate::contract::ServiceContract`] registration —
    /// the two registries share one namespace.
    pub fn register_unary<Req, Resp>(&self, service: &str, method: &str, handler: UnaryHandler<Req, Resp>) -> Result<()>
    where
        Req: Send + Sync + 'static,
        Resp: Send + Sync + 'static,
    {
        self.register(service, method, Pattern::Unary, handler.contract_codecs(), Arc::new(handler))
    }

    pub fn register_server_stream<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        handler: ServerStreamHandler<Req, Resp>,
    ) -> Result<()>
    where
        Req: Send + Sync + 'static,
        Resp: Send + Sync + 'static,
    {
        self.register(service, method, Pattern::ServerStream, handler.contract_codecs(), Arc::new(handler))
    }

    pub fn register_client_stream<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        handler: ClientStreamHandler<Req, Resp>,
    ) -> Result<()>
    where
        Req: Send + Sync + 'static,
        Resp: Send + Sync + 'static,
    {
        self.register(service, method, Pattern::ClientStream, handler.contract_codecs(), Arc::new(handler))
    }

    pub fn register_bidi<Req, Resp>(&self, service: &str, method: &str, handler: BidiHandler<Req, Resp>) -> Result<()>
    where
        Req: Send + Sync + 'static,
        Resp: Send + Sync + 'static,
    {
        self.register(service, method, Pattern::BidiStream, handler.contract_codecs(), Arc::new(handler))
    }

    fn register(
        &self,
        service: &str,
        method: &str,
        pattern: Pattern,
        codecs: crate::contract::ErasedCodecs,
        handler: Arc<dyn ErasedHandler>,
    ) -> Result<()> {
        let contract = MethodContract::new(service, method, pattern, codecs);
        let path = contract.method_path();
        self.contracts.register_method(contract)?;
        self.handlers.register(path, handler)
    }

    /// The accept loop (§4.5): one task per remote-initiated stream for as
    /// long as the multiplexer keeps producing them. Spawned once by
    /// [`crate::endpoint::Endpoint::new`]; not meant to be called twice.
    pub(crate) fn spawn_accept_loop(self) {
        tokio::spawn(async move {
            while let Some(stream_id) = self.mux.accept().await {
                let Some(inbox) = self.mux.messages_for(stream_id) else {
                    continue;
                };
                let this = self.clone();
                tokio::spawn(async move {
                    this.handle_stream(stream_id, inbox).await;
                });
            }
        });
    }

    async fn handle_stream(&self, stream_id: crate::wire::StreamId, mut inbox: tokio::sync::mpsc::Receiver<crate::wire::TransportMessage>) {
        let chain = self.middleware.lock().unwrap().clone();

        // The initial metadata frame is what reveals the method path, so
        // there is no real `CallContext` yet to run it through `on_frame`
        // under. Use a placeholder with an empty path rather than skip the
        // hook outright — a middleware rejecting even this frame still
        // short-circuits the call the same way a rejected data frame would.
        let bootstrap_ctx = CallContext {
            method_path: String::new(),
            pattern: Pattern::Unary,
            stream_id,
            label: self.label.clone(),
        };

        let (service_name, method_name, deadline) = match next_inbound(
            &self.mux,
            stream_id,
            &mut inbox,
            &chain,
            &bootstrap_ctx,
        )
        .await
        {
            Inbound::Metadata(metadata) => match metadata.method_path() {
                Some((service, method)) => (service, method, metadata.deadline()),
                None => {
                    warn!(stream = %stream_id, "initial frame carried no method path");
                    let status = Status::new(StatusCode::Internal, "initial metadata missing method path");
                    let _ = self.mux.send_metadata(stream_id, Metadata::for_status(&status), true).await;
                    self.mux.release_stream_id(stream_id);
                    return;
                }
            },
            other => {
                warn!(stream = %stream_id, "stream opened without initial metadata");
                let status = match other {
                    Inbound::Closed(status) => status,
                    _ => Status::new(StatusCode::Internal, "expected initial metadata to open a call"),
                };
                let _ = self.mux.send_metadata(stream_id, Metadata::for_status(&status), true).await;
                self.mux.release_stream_id(stream_id);
                return;
            }
        };
        let method_path = format!("/{service_name}/{method_name}");

        let pattern = self
            .contracts
            .lookup(&method_path)
            .map(|contract| contract.pattern)
            .unwrap_or(Pattern::Unary);
        let ctx = CallContext {
            method_path: method_path.clone(),
            pattern,
            stream_id,
            label: self.label.clone(),
        };

        if let Err(err) = chain.before_request(&ctx).await {
            let status = err.to_status();
            let _ = self.mux.send_metadata(stream_id, Metadata::for_status(&status), true).await;
            self.mux.release_stream_id(stream_id);
            chain.after_response(&ctx, &status).await;
            chain.on_error(&ctx, &err).await;
            return;
        }

        let status = match self.handlers.lookup(&method_path) {
            Some(handler) => {
                let cancel = CancellationToken::new();
                let deadline_expired = deadline.map(|d| crate::cancel::arm_deadline(cancel.clone(), d));
                let call = ResponderCall::new(self.mux.clone(), stream_id, cancel, deadline_expired);
                handler.dispatch(call, inbox, &chain, &ctx).await
            }
            None => reject_unimplemented(&self.mux, stream_id, inbox, &method_path, &chain, &ctx).await,
        };

        chain.after_response(&ctx, &status).await;
    }
}
