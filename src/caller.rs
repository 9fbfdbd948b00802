//! Caller-side invocation API (§4.4): allocates a stream per call and
//! returns the typed future/stream/sink the public surface promises.

use crate::call::bidi::{self, BidiChannel};
use crate::call::client_stream::{self, RequestSink};
use crate::call::server_stream::{self, ResponseStream};
use crate::call::unary;
use crate::codec::BoxedCodec;
use crate::contract::Pattern;
use crate::middleware::{CallContext, CircuitBreaker, MiddlewareChain, RetryExecutor};
use crate::mux::Multiplexer;
use crate::status::Status;
use crate::wire::StreamId;
use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// The client-side API of an [`crate::endpoint::Endpoint`] (§4.4, §6).
///
/// Cheaply cloneable: everything it owns is already `Arc`'d, mirroring the
/// teacher's `PipelineClient` being freely shared across call sites.
#[derive(Clone)]
pub struct CallerEndpoint {
    mux: Arc<Multiplexer>,
    /// Shared with the owning [`crate::endpoint::Endpoint`] and its
    /// `ResponderEndpoint`, not a snapshot — `Endpoint::add_middleware`
    /// must take effect for calls already in hand (§4.7, §6).
    middleware: Arc<std::sync::Mutex<MiddlewareChain>>,
    retry: Option<Arc<RetryExecutor>>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    label: Option<String>,
}

impl CallerEndpoint {
    pub(crate) fn new(
        mux: Arc<Multiplexer>,
        middleware: Arc<std::sync::Mutex<MiddlewareChain>>,
        retry: Option<Arc<RetryExecutor>>,
        circuit_breaker: Option<Arc<CircuitBreaker>>,
        label: Option<String>,
    ) -> Self {
        CallerEndpoint { mux, middleware, retry, circuit_breaker, label }
    }

    /// Snapshot the current chain — cheap, it's a `Vec` of `Arc`s — so the
    /// rest of a call's lifetime never holds the lock.
    fn middleware_snapshot(&self) -> MiddlewareChain {
        self.middleware.lock().unwrap().clone()
    }

    fn ctx(&self, service: &str, method: &str, pattern: Pattern) -> CallContext {
        CallContext {
            method_path: format!("/{service}/{method}"),
            pattern,
            // Not yet allocated when the context is built for the
            // `on_request` hook — streams are keyed by path until then;
            // `0` is never a valid allocated id (§3 parity rule starts at
            // 1), so it reads unambiguously as "not yet opened".
            stream_id: StreamId(0),
            label: self.label.clone(),
        }
    }

    /// `unary(service, method, request) -> Future<Response | Error>` (§4.4).
    pub async fn unary<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: Req,
        request_codec: BoxedCodec<Req>,
        response_codec: BoxedCodec<Resp>,
    ) -> Result<Resp>
    where
        Req: Clone + Send + Sync + 'static,
        Resp: Send + Sync + 'static,
    {
        self.unary_inner(service, method, request, request_codec, response_codec, None).await
    }

    /// As [`Self::unary`], but enforces `deadline` as a `grpc-timeout` on the
    /// stream and as a `tokio::time::timeout` around the response wait (§5).
    pub async fn unary_with_deadline<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: Req,
        request_codec: BoxedCodec<Req>,
        response_codec: BoxedCodec<Resp>,
        deadline: Duration,
    ) -> Result<Resp>
    where
        Req: Clone + Send + Sync + 'static,
        Resp: Send + Sync + 'static,
    {
        self.unary_inner(service, method, request, request_codec, response_codec, Some(deadline)).await
    }

    async fn unary_inner<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: Req,
        request_codec: BoxedCodec<Req>,
        response_codec: BoxedCodec<Resp>,
        deadline: Option<Duration>,
    ) -> Result<Resp>
    where
        Req: Clone + Send + Sync + 'static,
        Resp: Send + Sync + 'static,
    {
        let ctx = self.ctx(service, method, Pattern::Unary);
        let chain = self.middleware_snapshot();
        chain.before_request(&ctx).await?;

        let mux = self.mux.clone();
        let service = service.to_string();
        let method = method.to_string();
        let call_once = {
            let request = request.clone();
            let request_codec = request_codec.clone();
            let response_codec = response_codec.clone();
            let outer_chain = chain.clone();
            let outer_ctx = ctx.clone();
            move || {
                let mux = mux.clone();
                let service = service.clone();
                let method = method.clone();
                let request = request.clone();
                let request_codec = request_codec.clone();
                let response_codec = response_codec.clone();
                let chain = outer_chain.clone();
                let ctx = outer_ctx.clone();
                async move {
                    unary::call_unary(
                        &mux,
                        &service,
                        &method,
                        request,
                        &request_codec,
                        &response_codec,
                        deadline,
                        &chain,
                        &ctx,
                    )
                    .await
                }
            }
        };

        let result = self.run_resilient(call_once).await;
        Self::finish(&chain, &ctx, &result).await;
        result
    }

    /// `serverStream(service, method, request) -> LazyFiniteSequence<Response>`
    /// (§4.4). Not wrapped in retry/circuit-breaker: a partially-consumed
    /// response sequence cannot be safely replayed (§9 design notes carry no
    /// such requirement, and replaying would double-invoke a
    /// possibly-non-idempotent handler).
    pub async fn server_stream<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: Req,
        request_codec: BoxedCodec<Req>,
        response_codec: BoxedCodec<Resp>,
    ) -> Result<ResponseStream<Resp>>
    where
        Req: Send + Sync + 'static,
        Resp: Send + Sync + 'static,
    {
        self.server_stream_inner(service, method, request, request_codec, response_codec, None).await
    }

    /// As [`Self::server_stream`], with `deadline` arming the response
    /// sequence's cancellation token on expiry (§5).
    pub async fn server_stream_with_deadline<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: Req,
        request_codec: BoxedCodec<Req>,
        response_codec: BoxedCodec<Resp>,
        deadline: Duration,
    ) -> Result<ResponseStream<Resp>>
    where
        Req: Send + Sync + 'static,
        Resp: Send + Sync + 'static,
    {
        self.server_stream_inner(service, method, request, request_codec, response_codec, Some(deadline)).await
    }

    async fn server_stream_inner<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: Req,
        request_codec: BoxedCodec<Req>,
        response_codec: BoxedCodec<Resp>,
        deadline: Option<Duration>,
    ) -> Result<ResponseStream<Resp>>
    where
        Req: Send + Sync + 'static,
        Resp: Send + Sync + 'static,
    {
        let ctx = self.ctx(service, method, Pattern::ServerStream);
        let chain = self.middleware_snapshot();
        chain.before_request(&ctx).await?;
        let result = server_stream::call_server_stream(
            self.mux.clone(),
            service,
            method,
            request,
            request_codec,
            response_codec,
            deadline,
            chain.clone(),
            ctx.clone(),
        )
        .await;
        Self::finish(&chain, &ctx, &result).await;
        result
    }

    /// `clientStream(service, method) -> (Sink<Request>, Future<Response>)`
    /// (§4.4).
    pub async fn client_stream<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request_codec: BoxedCodec<Req>,
        response_codec: BoxedCodec<Resp>,
    ) -> Result<(RequestSink<Req>, impl Future<Output = Result<Resp>>)>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        self.client_stream_inner(service, method, request_codec, response_codec, None).await
    }

    /// As [`Self::client_stream`], with `deadline` racing the combined
    /// request/response drive task (§5).
    pub async fn client_stream_with_deadline<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request_codec: BoxedCodec<Req>,
        response_codec: BoxedCodec<Resp>,
        deadline: Duration,
    ) -> Result<(RequestSink<Req>, impl Future<Output = Result<Resp>>)>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        self.client_stream_inner(service, method, request_codec, response_codec, Some(deadline)).await
    }

    async fn client_stream_inner<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request_codec: BoxedCodec<Req>,
        response_codec: BoxedCodec<Resp>,
        deadline: Option<Duration>,
    ) -> Result<(RequestSink<Req>, impl Future<Output = Result<Resp>>)>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let ctx = self.ctx(service, method, Pattern::ClientStream);
        let chain = self.middleware_snapshot();
        chain.before_request(&ctx).await?;
        let result = client_stream::call_client_stream(
            self.mux.clone(),
            service,
            method,
            request_codec,
            response_codec,
            deadline,
            chain.clone(),
            ctx.clone(),
        )
        .await;
        Self::finish(&chain, &ctx, &result).await;
        let (sink, resp_rx) = result?;
        Ok((sink, await_response(resp_rx)))
    }

    /// `bidiStream(service, method) -> DuplexChannel<Request, Response>`
    /// (§4.4).
    pub async fn bidi_stream<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request_codec: BoxedCodec<Req>,
        response_codec: BoxedCodec<Resp>,
    ) -> Result<BidiChannel<Req, Resp>>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        self.bidi_stream_inner(service, method, request_codec, response_codec, None).await
    }

    /// As [`Self::bidi_stream`], with `deadline` arming the response half's
    /// cancellation token on expiry (§5).
    pub async fn bidi_stream_with_deadline<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request_codec: BoxedCodec<Req>,
        response_codec: BoxedCodec<Resp>,
        deadline: Duration,
    ) -> Result<BidiChannel<Req, Resp>>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        self.bidi_stream_inner(service, method, request_codec, response_codec, Some(deadline)).await
    }

    async fn bidi_stream_inner<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request_codec: BoxedCodec<Req>,
        response_codec: BoxedCodec<Resp>,
        deadline: Option<Duration>,
    ) -> Result<BidiChannel<Req, Resp>>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let ctx = self.ctx(service, method, Pattern::BidiStream);
        let chain = self.middleware_snapshot();
        chain.before_request(&ctx).await?;
        let result = bidi::call_bidi(
            self.mux.clone(),
            service,
            method,
            request_codec,
            response_codec,
            deadline,
            chain.clone(),
            ctx.clone(),
        )
        .await;
        Self::finish(&chain, &ctx, &result).await;
        result
    }

    async fn finish<T>(chain: &MiddlewareChain, ctx: &CallContext, result: &Result<T>) {
        match result {
            Ok(_) => chain.after_response(ctx, &Status::ok()).await,
            Err(err) => {
                let status = err.to_status();
                chain.after_response(ctx, &status).await;
                chain.on_error(ctx, err).await;
            }
        }
    }

    async fn run_resilient<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let run_with_retry = || async {
            match &self.retry {
                Some(retry) => retry.execute(|| operation()).await,
                None => operation().await,
            }
        };
        match &self.circuit_breaker {
            Some(cb) => cb.execute(run_with_retry).await,
            None => run_with_retry().await,
        }
    }
}

async fn await_response<Resp>(rx: oneshot::Receiver<Result<Resp>>) -> Result<Resp> {
    rx.await.map_err(|_| Error::Unavailable("response channel dropped before completion".into()))?
}
