//! Unary calls: exactly one request payload, exactly one response payload
//! (§4.3 "Unary").

use super::support::{
    decode_or_internal, drain_to_end_of_stream, encode_or_internal, next_inbound, open_caller_stream,
    Inbound, ResponderCall,
};
use super::{CallState, Half};
use crate::cancel::CancellationToken;
use crate::codec::BoxedCodec;
use crate::middleware::{CallContext, MiddlewareChain};
use crate::mux::Multiplexer;
use crate::status::{Status, StatusCode};
use crate::wire::StreamId;
use crate::{Error, Result};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Drive a unary call from the caller side to its single typed response
/// (§4.4 `unary(service, method, request) -> Future<Response | Error>`).
///
/// Runs to completion inline in the calling task — unlike the streaming
/// patterns there is no intermediate handle a caller could drop early
/// (besides the future itself, whose ordinary drop-stops-polling semantics
/// already satisfy §4.4's cancellation contract: the spawned send has
/// already happened or hasn't, and the stream ID is released by whichever
/// side notices the abandonment). A `deadline` is enforced the same way: a
/// `tokio::time::timeout` around the response wait is, from the stream's
/// point of view, indistinguishable from the caller dropping this future
/// (§5).
pub async fn call_unary<Req, Resp>(
    mux: &Multiplexer,
    service: &str,
    method: &str,
    request: Req,
    request_codec: &BoxedCodec<Req>,
    response_codec: &BoxedCodec<Resp>,
    deadline: Option<Duration>,
    chain: &MiddlewareChain,
    ctx: &CallContext,
) -> Result<Resp> {
    let (stream_id, mut inbox) = open_caller_stream(mux, service, method, deadline).await?;
    let mut state = CallState::new();
    state.open();

    let bytes = encode_or_internal(request_codec.as_ref(), &request)?;
    mux.send_payload(stream_id, bytes, true).await?;
    state.end(Half::Local);

    let result = match deadline {
        Some(d) => match tokio::time::timeout(
            d,
            read_unary_response(mux, stream_id, &mut inbox, response_codec, chain, ctx),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                let _ = mux.finish_sending(stream_id).await;
                Err(Error::DeadlineExceeded)
            }
        },
        None => read_unary_response(mux, stream_id, &mut inbox, response_codec, chain, ctx).await,
    };
    mux.release_stream_id(stream_id);
    result
}

async fn read_unary_response<Resp>(
    mux: &Multiplexer,
    stream_id: StreamId,
    inbox: &mut tokio::sync::mpsc::Receiver<crate::wire::TransportMessage>,
    response_codec: &BoxedCodec<Resp>,
    chain: &MiddlewareChain,
    ctx: &CallContext,
) -> Result<Resp> {
    let mut payload: Option<Resp> = None;
    loop {
        match next_inbound(mux, stream_id, inbox, chain, ctx).await {
            Inbound::Metadata(_) => continue,
            Inbound::Payload(bytes) => {
                if payload.is_some() {
                    return Err(Error::Protocol("unary call received more than one response payload".into()));
                }
                payload = Some(decode_or_internal(response_codec.as_ref(), &bytes)?);
            }
            Inbound::Direct(_) => {
                // This codec-based surface always falls back to encoding
                // (§9: "call-sites that use [zero-copy] must fall back to
                // encoding when the capability is absent"); a typed direct
                // frame would need a call-site built against `DirectObject`
                // directly, which this crate's public API doesn't expose.
                return Err(Error::Protocol("unexpected direct-object frame on a codec-based call".into()));
            }
            Inbound::Trailer(status) => {
                if status.is_ok() {
                    return payload.ok_or_else(|| {
                        Error::Protocol("unary call completed OK without a response payload".into())
                    });
                }
                return Err(status.into());
            }
            Inbound::EndOfStream => {
                return Err(Error::Protocol("unary call ended without a trailer".into()));
            }
            Inbound::Closed(status) => return Err(status.into()),
        }
    }
}

/// A registered unary handler, type-erased for the registry (§4.5, §4.6).
/// `F` returns the handler's future boxed so many different closures can
/// share one trait object.
pub struct UnaryHandler<Req, Resp> {
    request_codec: BoxedCodec<Req>,
    response_codec: BoxedCodec<Resp>,
    handler: Box<dyn Fn(Req) -> Pin<Box<dyn Future<Output = Result<Resp>> + Send>> + Send + Sync>,
}

impl<Req, Resp> UnaryHandler<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Send + Sync + 'static,
{
    /// The codec pair this handler was registered with, for building the
    /// `MethodContract` entry that accompanies it in the contract registry
    /// (§4.6 ad-hoc registration).
    pub(crate) fn contract_codecs(&self) -> crate::contract::ErasedCodecs {
        crate::contract::ErasedCodecs::new(self.request_codec.clone(), self.response_codec.clone())
    }

    pub fn new<F, Fut>(request_codec: BoxedCodec<Req>, response_codec: BoxedCodec<Resp>, handler: F) -> Self
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        UnaryHandler {
            request_codec,
            response_codec,
            handler: Box::new(move |req| Box::pin(handler(req))),
        }
    }
}

/// The dispatcher's view of any registered handler, regardless of pattern
/// (§4.5, §9: the dispatcher drives the state machine and only calls into
/// the handler through this adaptor — handlers cannot re-enter dispatch).
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    /// Drive `call` to completion and report the trailer status it sent, so
    /// the responder accept loop can feed it to the middleware chain's
    /// `on_response`/`on_error` hooks (§4.6) without re-deriving it.
    async fn dispatch(
        &self,
        call: ResponderCall,
        inbox: tokio::sync::mpsc::Receiver<crate::wire::TransportMessage>,
        chain: &MiddlewareChain,
        ctx: &CallContext,
    ) -> Status;
}

#[async_trait]
impl<Req, Resp> ErasedHandler for UnaryHandler<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Send + Sync + 'static,
{
    async fn dispatch(
        &self,
        mut call: ResponderCall,
        mut inbox: tokio::sync::mpsc::Receiver<crate::wire::TransportMessage>,
        chain: &MiddlewareChain,
        ctx: &CallContext,
    ) -> Status {
        let mux = call.mux.clone();
        let stream_id = call.stream_id;

        let request = match read_unary_request(&mux, stream_id, &mut inbox, &self.request_codec, chain, ctx).await {
            Ok(req) => req,
            Err(err) => {
                let status = err_to_status(&err);
                let _ = call.send_trailer(status.clone()).await;
                mux.release_stream_id(stream_id);
                return status;
            }
        };

        let outcome = run_with_cancellation(&call.cancel, (self.handler)(request)).await;

        let final_status = match outcome {
            Some(Ok(resp)) => {
                let send_result = async {
                    let bytes = encode_or_internal(self.response_codec.as_ref(), &resp)?;
                    call.send_response_payload(bytes).await?;
                    call.send_trailer(Status::ok()).await
                }
                .await;
                match send_result {
                    Ok(()) => Status::ok(),
                    Err(err) => {
                        tracing::warn!(stream = %stream_id, error = %err, "failed to deliver unary response");
                        err.to_status()
                    }
                }
            }
            Some(Err(err)) => {
                let status = err.to_status();
                let _ = call.send_trailer(status.clone()).await;
                status
            }
            None => {
                let status = call.cancellation_status();
                let _ = call.send_trailer(status.clone()).await;
                status
            }
        };
        mux.release_stream_id(stream_id);
        final_status
    }
}

async fn read_unary_request<Req>(
    mux: &Multiplexer,
    stream_id: StreamId,
    inbox: &mut tokio::sync::mpsc::Receiver<crate::wire::TransportMessage>,
    request_codec: &BoxedCodec<Req>,
    chain: &MiddlewareChain,
    ctx: &CallContext,
) -> Result<Req> {
    loop {
        match next_inbound(mux, stream_id, inbox, chain, ctx).await {
            Inbound::Metadata(_) => continue,
            Inbound::Payload(bytes) => return decode_or_internal(request_codec.as_ref(), &bytes),
            Inbound::Direct(_) => {
                return Err(Error::Protocol("direct frames are not supported for this handler".into()))
            }
            Inbound::EndOfStream => {
                return Err(Error::Protocol("unary handler observed end-of-stream with no request payload".into()))
            }
            Inbound::Trailer(_) => {
                return Err(Error::Protocol("unary handler observed a trailer on its own inbound half".into()))
            }
            Inbound::Closed(status) => return Err(status.into()),
        }
    }
}

/// Run a handler future to completion, or stop early once `cancel` fires
/// (§4.5 failure mode 3: "the runtime forcibly closes the state machine
/// after its cancellation token is signalled").
pub(super) async fn run_with_cancellation<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Option<Result<T>> {
    tokio::select! {
        result = fut => Some(result),
        _ = cancel.cancelled() => None,
    }
}

fn err_to_status(err: &Error) -> Status {
    err.to_status()
}

/// Reject a call whose method path has no registered contract, without
/// opening the state machine beyond `New` (§8: "Method path unknown:
/// immediate UNIMPLEMENTED trailer without opening the state machine").
pub(crate) async fn reject_unimplemented(
    mux: &Arc<Multiplexer>,
    stream_id: StreamId,
    mut inbox: tokio::sync::mpsc::Receiver<crate::wire::TransportMessage>,
    method_path: &str,
    chain: &MiddlewareChain,
    ctx: &CallContext,
) -> Status {
    drain_to_end_of_stream(mux, stream_id, &mut inbox, chain, ctx).await;
    let status = Status::new(StatusCode::Unimplemented, format!("method not found: {method_path}"));
    let _ = mux.send_metadata(stream_id, crate::metadata::Metadata::for_status(&status), true).await;
    mux.release_stream_id(stream_id);
    status
}

#[cfg(test)]
mod tests {
    use crate::codec::FnCodec;
    use crate::endpoint::{Endpoint, EndpointConfig};
    use crate::status::StatusCode;
    use crate::transport::inmemory::InMemoryTransport;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    fn string_codec() -> crate::codec::BoxedCodec<String> {
        Arc::new(FnCodec::new(
            |s: &String| Ok(Bytes::copy_from_slice(s.as_bytes())),
            |b: &[u8]| String::from_utf8(b.to_vec()).map_err(|e| crate::Error::Codec(e.to_string())),
        ))
    }

    #[tokio::test]
    async fn handler_error_surfaces_as_the_returned_status() {
        let (caller_transport, responder_transport) = InMemoryTransport::pair();
        let caller = Endpoint::new(Arc::new(caller_transport), EndpointConfig::default());
        let responder = Endpoint::new(Arc::new(responder_transport), EndpointConfig::default());

        responder
            .responder()
            .register_unary(
                "Echo",
                "Say",
                super::UnaryHandler::new(string_codec(), string_codec(), |_req: String| async move {
                    Err(crate::Error::Status(crate::status::Status::new(
                        StatusCode::InvalidArgument,
                        "nope",
                    )))
                }),
            )
            .unwrap();

        let result = caller
            .caller()
            .unary::<String, String>("Echo", "Say", "hi".to_string(), string_codec(), string_codec())
            .await;
        assert_eq!(result.unwrap_err().to_status().code, StatusCode::InvalidArgument);
    }

    #[tokio::test]
    async fn deadline_exceeded_when_handler_outlives_it() {
        let (caller_transport, responder_transport) = InMemoryTransport::pair();
        let caller = Endpoint::new(Arc::new(caller_transport), EndpointConfig::default());
        let responder = Endpoint::new(Arc::new(responder_transport), EndpointConfig::default());

        responder
            .responder()
            .register_unary(
                "Echo",
                "Say",
                super::UnaryHandler::new(string_codec(), string_codec(), |_req: String| async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok("too late".to_string())
                }),
            )
            .unwrap();

        let result = caller
            .caller()
            .unary_with_deadline::<String, String>(
                "Echo",
                "Say",
                "hi".to_string(),
                string_codec(),
                string_codec(),
                Duration::from_millis(20),
            )
            .await;
        assert_eq!(result.unwrap_err().to_status().code, StatusCode::DeadlineExceeded);
    }
}
