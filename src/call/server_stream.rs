//! Server-streaming calls: one request payload, zero or more response
//! payloads (§4.3 "Server-streaming").

use super::support::{decode_or_internal, encode_or_internal, next_inbound, open_caller_stream, Inbound, ResponderCall};
use super::unary::ErasedHandler;
use super::{CallState, Half};
use crate::cancel::CancellationToken;
use crate::codec::BoxedCodec;
use crate::middleware::{CallContext, MiddlewareChain};
use crate::mux::Multiplexer;
use crate::status::{Status, StatusCode};
use crate::wire::{StreamId, TransportMessage};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// The caller-visible surface for a server-streaming call (§4.4
/// `serverStream(...) -> LazyFiniteSequence<Response>`). A plain
/// `futures::Stream`; dropping it before the trailer is the caller's
/// cancellation path (§4.4 contract 3).
pub struct ResponseStream<Resp> {
    inner: ReceiverStream<Result<Resp>>,
    cancel: CancellationToken,
    mux: Arc<Multiplexer>,
    stream_id: StreamId,
}

impl<Resp> ResponseStream<Resp> {
    pub(crate) fn new(
        inner: ReceiverStream<Result<Resp>>,
        cancel: CancellationToken,
        mux: Arc<Multiplexer>,
        stream_id: StreamId,
    ) -> Self {
        ResponseStream { inner, cancel, mux, stream_id }
    }
}

impl<Resp> Stream for ResponseStream<Resp> {
    type Item = Result<Resp>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<Resp> Drop for ResponseStream<Resp> {
    fn drop(&mut self) {
        self.cancel.cancel();
        // `cancel` only stops *this side's* background task; the responder
        // is watching its own token, which nothing local can reach. Send a
        // reset across the wire so a dropped handle actually drives the
        // responder to a terminal state (§5) instead of leaving it running
        // an abandoned handler forever.
        let mux = self.mux.clone();
        let stream_id = self.stream_id;
        tokio::spawn(async move {
            let _ = mux
                .reset_stream(stream_id, Status::new(StatusCode::Cancelled, "caller dropped the response handle"))
                .await;
        });
    }
}

/// Open a server-streaming call: send the single request payload, then hand
/// back a lazily-pulled response sequence driven by a background task
/// (§4.4, §5 suspension point "pulling from a response sequence").
pub fn call_server_stream<Req, Resp>(
    mux: Arc<Multiplexer>,
    service: &str,
    method: &str,
    request: Req,
    request_codec: BoxedCodec<Req>,
    response_codec: BoxedCodec<Resp>,
    deadline: Option<Duration>,
    chain: MiddlewareChain,
    ctx: CallContext,
) -> Pin<Box<dyn Future<Output = Result<ResponseStream<Resp>>> + Send>>
where
    Req: Send + Sync + 'static,
    Resp: Send + Sync + 'static,
{
    let service = service.to_string();
    let method = method.to_string();
    Box::pin(async move {
        let (stream_id, inbox) = open_caller_stream(&mux, &service, &method, deadline).await?;
        let mut state = CallState::new();
        state.open();

        let bytes = encode_or_internal(request_codec.as_ref(), &request)?;
        mux.send_payload(stream_id, bytes, true).await?;
        state.end(Half::Local);

        let cancel = CancellationToken::new();
        let deadline_expired = deadline.map(|d| crate::cancel::arm_deadline(cancel.clone(), d));
        let (tx, rx) = mpsc::channel(16);
        let task_mux = mux.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            drive_caller_responses(
                task_mux,
                stream_id,
                inbox,
                response_codec,
                tx,
                task_cancel,
                deadline_expired,
                chain,
                ctx,
            )
            .await;
        });

        Ok(ResponseStream { inner: ReceiverStream::new(rx), cancel, mux: mux.clone(), stream_id })
    })
}

#[allow(clippy::too_many_arguments)]
async fn drive_caller_responses<Resp>(
    mux: Arc<Multiplexer>,
    stream_id: StreamId,
    mut inbox: mpsc::Receiver<TransportMessage>,
    response_codec: BoxedCodec<Resp>,
    tx: mpsc::Sender<Result<Resp>>,
    cancel: CancellationToken,
    deadline_expired: Option<Arc<AtomicBool>>,
    chain: MiddlewareChain,
    ctx: CallContext,
) where
    Resp: Send + 'static,
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = mux.finish_sending(stream_id).await;
                if deadline_expired.as_ref().map(|f| f.load(Ordering::Acquire)).unwrap_or(false) {
                    let _ = tx.send(Err(Error::DeadlineExceeded)).await;
                }
                break;
            }
            inbound = next_inbound(&mux, stream_id, &mut inbox, &chain, &ctx) => {
                match inbound {
                    Inbound::Metadata(_) => continue,
                    Inbound::Payload(bytes) => {
                        let item = decode_or_internal(response_codec.as_ref(), &bytes);
                        let stop = item.is_err();
                        if tx.send(item).await.is_err() || stop {
                            break;
                        }
                    }
                    Inbound::Direct(_) => {
                        let _ = tx.send(Err(Error::Protocol("unexpected direct-object frame".into()))).await;
                        break;
                    }
                    Inbound::Trailer(status) => {
                        if !status.is_ok() {
                            let _ = tx.send(Err(status.into())).await;
                        }
                        break;
                    }
                    Inbound::EndOfStream => break,
                    Inbound::Closed(status) => {
                        let _ = tx.send(Err(status.into())).await;
                        break;
                    }
                }
            }
        }
    }
    mux.release_stream_id(stream_id);
}

/// A registered server-streaming handler: takes the single request and
/// returns an outbound `Stream` of responses (§4.5).
pub struct ServerStreamHandler<Req, Resp> {
    request_codec: BoxedCodec<Req>,
    response_codec: BoxedCodec<Resp>,
    #[allow(clippy::type_complexity)]
    handler: Box<
        dyn Fn(Req) -> Pin<Box<dyn Stream<Item = Result<Resp>> + Send>> + Send + Sync,
    >,
}

impl<Req, Resp> ServerStreamHandler<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Send + Sync + 'static,
{
    pub(crate) fn contract_codecs(&self) -> crate::contract::ErasedCodecs {
        crate::contract::ErasedCodecs::new(self.request_codec.clone(), self.response_codec.clone())
    }

    pub fn new<F, S>(request_codec: BoxedCodec<Req>, response_codec: BoxedCodec<Resp>, handler: F) -> Self
    where
        F: Fn(Req) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Resp>> + Send + 'static,
    {
        ServerStreamHandler {
            request_codec,
            response_codec,
            handler: Box::new(move |req| Box::pin(handler(req))),
        }
    }
}

#[async_trait]
impl<Req, Resp> ErasedHandler for ServerStreamHandler<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Send + Sync + 'static,
{
    async fn dispatch(
        &self,
        mut call: ResponderCall,
        mut inbox: mpsc::Receiver<TransportMessage>,
        chain: &MiddlewareChain,
        ctx: &CallContext,
    ) -> Status {
        use futures::StreamExt;

        let mux = call.mux.clone();
        let stream_id = call.stream_id;

        let request = match read_single_request(&mux, stream_id, &mut inbox, &self.request_codec, chain, ctx).await {
            Ok(req) => req,
            Err(err) => {
                let status = err.to_status();
                let _ = call.send_trailer(status.clone()).await;
                mux.release_stream_id(stream_id);
                return status;
            }
        };

        // The single request frame is already consumed, so nothing else is
        // expected on this stream's inbound half — except a caller-sent
        // reset (§5) or the multiplexer tearing the stream down. Keep
        // watching for that concurrently with producing the outbound
        // sequence below; `call.cancel` has nothing else to drive it once
        // the caller side has dropped its handle.
        let watch_cancel = call.cancel.clone();
        let watch_mux = mux.clone();
        let watch_chain = chain.clone();
        let watch_ctx = ctx.clone();
        tokio::spawn(async move {
            next_inbound(&watch_mux, stream_id, &mut inbox, &watch_chain, &watch_ctx).await;
            watch_cancel.cancel();
        });

        let mut stream = (self.handler)(request);
        let final_status = loop {
            let next = tokio::select! {
                biased;
                _ = call.cancel.cancelled() => break call.cancellation_status(),
                item = stream.next() => item,
            };
            match next {
                Some(Ok(item)) => match encode_or_internal(self.response_codec.as_ref(), &item) {
                    Ok(bytes) => {
                        if let Err(err) = call.send_response_payload(bytes).await {
                            break err.to_status();
                        }
                    }
                    Err(err) => break err.to_status(),
                },
                Some(Err(err)) => break err.to_status(),
                None => break Status::ok(),
            }
        };
        let _ = call.send_trailer(final_status.clone()).await;
        mux.release_stream_id(stream_id);
        final_status
    }
}

#[cfg(test)]
mod tests {
    use crate::codec::FnCodec;
    use crate::endpoint::{Endpoint, EndpointConfig};
    use crate::status::StatusCode;
    use crate::transport::inmemory::InMemoryTransport;
    use bytes::Bytes;
    use futures::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;

    fn i32_codec() -> crate::codec::BoxedCodec<i32> {
        Arc::new(FnCodec::new(
            |n: &i32| Ok(Bytes::copy_from_slice(&n.to_le_bytes())),
            |b: &[u8]| {
                let arr: [u8; 4] = b.try_into().map_err(|_| crate::Error::Codec("bad i32 length".into()))?;
                Ok(i32::from_le_bytes(arr))
            },
        ))
    }

    #[tokio::test]
    async fn handler_that_never_yields_completes_an_empty_sequence() {
        let (caller_transport, responder_transport) = InMemoryTransport::pair();
        let caller = Endpoint::new(Arc::new(caller_transport), EndpointConfig::default());
        let responder = Endpoint::new(Arc::new(responder_transport), EndpointConfig::default());

        responder
            .responder()
            .register_server_stream(
                "Count",
                "Never",
                super::ServerStreamHandler::new(i32_codec(), i32_codec(), |_: i32| futures::stream::empty()),
            )
            .unwrap();

        let mut stream = caller
            .caller()
            .server_stream::<i32, i32>("Count", "Never", 0, i32_codec(), i32_codec())
            .await
            .unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn deadline_exceeded_when_handler_outlives_it() {
        let (caller_transport, responder_transport) = InMemoryTransport::pair();
        let caller = Endpoint::new(Arc::new(caller_transport), EndpointConfig::default());
        let responder = Endpoint::new(Arc::new(responder_transport), EndpointConfig::default());

        responder
            .responder()
            .register_server_stream(
                "Count",
                "Slow",
                super::ServerStreamHandler::new(i32_codec(), i32_codec(), |_: i32| {
                    futures::stream::once(async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok(1)
                    })
                }),
            )
            .unwrap();

        let mut stream = caller
            .caller()
            .server_stream_with_deadline::<i32, i32>(
                "Count",
                "Slow",
                0,
                i32_codec(),
                i32_codec(),
                Duration::from_millis(20),
            )
            .await
            .unwrap();

        let first = stream.next().await.unwrap();
        assert_eq!(first.unwrap_err().to_status().code, StatusCode::DeadlineExceeded);
    }
}

async fn read_single_request<Req>(
    mux: &Multiplexer,
    stream_id: StreamId,
    inbox: &mut mpsc::Receiver<TransportMessage>,
    request_codec: &BoxedCodec<Req>,
    chain: &MiddlewareChain,
    ctx: &CallContext,
) -> Result<Req> {
    loop {
        match next_inbound(mux, stream_id, inbox, chain, ctx).await {
            Inbound::Metadata(_) => continue,
            Inbound::Payload(bytes) => return decode_or_internal(request_codec.as_ref(), &bytes),
            Inbound::Direct(_) => return Err(Error::Protocol("unexpected direct-object frame".into())),
            Inbound::EndOfStream => {
                return Err(Error::Protocol("server-stream handler observed no request payload".into()))
            }
            Inbound::Trailer(_) => {
                return Err(Error::Protocol("server-stream handler observed a trailer on its inbound half".into()))
            }
            Inbound::Closed(status) => return Err(status.into()),
        }
    }
}
