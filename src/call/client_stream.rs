//! Client-streaming calls: zero or more request payloads, exactly one
//! response payload (§4.3 "Client-streaming").

use super::support::{decode_or_internal, encode_or_internal, next_inbound, open_caller_stream, Inbound, ResponderCall};
use super::unary::{run_with_cancellation, ErasedHandler};
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
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

/// The caller-visible sink half of a client-streaming call (§4.4
/// `clientStream(...) -> (Sink<Request>, Future<Response>)`). Backed by a
/// bounded channel; `send` suspends under backpressure (§5).
pub struct RequestSink<Req> {
    tx: mpsc::Sender<Req>,
}

impl<Req> RequestSink<Req> {
    pub(crate) fn new(tx: mpsc::Sender<Req>) -> Self {
        RequestSink { tx }
    }

    pub async fn send(&self, request: Req) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| Error::Unavailable("request channel closed".into()))
    }

    /// Finish sending (§4.3 "zero or more request payloads then
    /// end-of-stream"). Equivalent to dropping the sink, spelled out for
    /// readability at call sites.
    pub fn close(self) {
        drop(self);
    }
}

/// Open a client-streaming call: hand back a request sink and a future of
/// the single typed response, both driven by one background task.
pub fn call_client_stream<Req, Resp>(
    mux: Arc<Multiplexer>,
    service: &str,
    method: &str,
    request_codec: BoxedCodec<Req>,
    response_codec: BoxedCodec<Resp>,
    deadline: Option<Duration>,
    chain: MiddlewareChain,
    ctx: CallContext,
) -> Pin<Box<dyn Future<Output = Result<(RequestSink<Req>, oneshot::Receiver<Result<Resp>>)>> + Send>>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let service = service.to_string();
    let method = method.to_string();
    Box::pin(async move {
        let (stream_id, inbox) = open_caller_stream(&mux, &service, &method, deadline).await?;
        let mut state = CallState::new();
        state.open();

        let (req_tx, req_rx) = mpsc::channel(16);
        let (resp_tx, resp_rx) = oneshot::channel();

        let task_mux = mux.clone();
        tokio::spawn(async move {
            let call = async {
                drive_caller_requests(task_mux.clone(), stream_id, req_rx, request_codec).await;
                read_single_response(&task_mux, stream_id, inbox, response_codec, &chain, &ctx).await
            };
            let result = match deadline {
                Some(d) => match tokio::time::timeout(d, call).await {
                    Ok(result) => result,
                    Err(_) => {
                        let _ = task_mux.finish_sending(stream_id).await;
                        Err(Error::DeadlineExceeded)
                    }
                },
                None => call.await,
            };
            task_mux.release_stream_id(stream_id);
            let _ = resp_tx.send(result);
        });

        Ok((RequestSink { tx: req_tx }, resp_rx))
    })
}

async fn drive_caller_requests<Req>(
    mux: Arc<Multiplexer>,
    stream_id: StreamId,
    mut req_rx: mpsc::Receiver<Req>,
    request_codec: BoxedCodec<Req>,
) {
    while let Some(req) = req_rx.recv().await {
        match encode_or_internal(request_codec.as_ref(), &req) {
            Ok(bytes) => {
                if mux.send_payload(stream_id, bytes, false).await.is_err() {
                    return;
                }
            }
            Err(_) => return,
        }
    }
    let _ = mux.finish_sending(stream_id).await;
}

async fn read_single_response<Resp>(
    mux: &Multiplexer,
    stream_id: StreamId,
    mut inbox: mpsc::Receiver<TransportMessage>,
    response_codec: BoxedCodec<Resp>,
    chain: &MiddlewareChain,
    ctx: &CallContext,
) -> Result<Resp> {
    let mut payload = None;
    loop {
        match next_inbound(mux, stream_id, &mut inbox, chain, ctx).await {
            Inbound::Metadata(_) => continue,
            Inbound::Payload(bytes) => {
                if payload.is_some() {
                    return Err(Error::Protocol("client-stream call received more than one response payload".into()));
                }
                payload = Some(decode_or_internal(response_codec.as_ref(), &bytes)?);
            }
            Inbound::Direct(_) => return Err(Error::Protocol("unexpected direct-object frame".into())),
            Inbound::Trailer(status) => {
                if status.is_ok() {
                    return payload.ok_or_else(|| {
                        Error::Protocol("client-stream call completed OK without a response payload".into())
                    });
                }
                return Err(status.into());
            }
            Inbound::EndOfStream => return Err(Error::Protocol("client-stream call ended without a trailer".into())),
            Inbound::Closed(status) => return Err(status.into()),
        }
    }
}

/// The inbound sequence a client-stream handler drains before producing its
/// single response (§4.5: "the handler returns a future of the single
/// response after draining the inbound sequence").
pub struct RequestStream<Req> {
    inner: ReceiverStream<Req>,
}

impl<Req> RequestStream<Req> {
    pub(crate) fn new(inner: ReceiverStream<Req>) -> Self {
        RequestStream { inner }
    }
}

impl<Req> Stream for RequestStream<Req> {
    type Item = Req;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// A registered client-streaming handler: drains the inbound sequence and
/// produces the single response (§4.5).
pub struct ClientStreamHandler<Req, Resp> {
    request_codec: BoxedCodec<Req>,
    response_codec: BoxedCodec<Resp>,
    #[allow(clippy::type_complexity)]
    handler: Box<
        dyn Fn(RequestStream<Req>) -> Pin<Box<dyn Future<Output = Result<Resp>> + Send>> + Send + Sync,
    >,
}

impl<Req, Resp> ClientStreamHandler<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Send + Sync + 'static,
{
    pub(crate) fn contract_codecs(&self) -> crate::contract::ErasedCodecs {
        crate::contract::ErasedCodecs::new(self.request_codec.clone(), self.response_codec.clone())
    }

    pub fn new<F, Fut>(request_codec: BoxedCodec<Req>, response_codec: BoxedCodec<Resp>, handler: F) -> Self
    where
        F: Fn(RequestStream<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        ClientStreamHandler {
            request_codec,
            response_codec,
            handler: Box::new(move |reqs| Box::pin(handler(reqs))),
        }
    }
}

#[async_trait]
impl<Req, Resp> ErasedHandler for ClientStreamHandler<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Send + Sync + 'static,
{
    async fn dispatch(
        &self,
        mut call: ResponderCall,
        inbox: mpsc::Receiver<TransportMessage>,
        chain: &MiddlewareChain,
        ctx: &CallContext,
    ) -> Status {
        let mux = call.mux.clone();
        let stream_id = call.stream_id;

        let (item_tx, item_rx) = mpsc::channel(16);
        let forwarder_mux = mux.clone();
        let forwarder_codec_is_err = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = forwarder_codec_is_err.clone();
        let request_codec = self.request_codec.clone();
        let forwarder_chain = chain.clone();
        let forwarder_ctx = ctx.clone();
        let forwarder = tokio::spawn(forward_requests(
            forwarder_mux,
            stream_id,
            inbox,
            request_codec,
            item_tx,
            flag,
            call.cancel.clone(),
            forwarder_chain,
            forwarder_ctx,
        ));

        let request_stream = RequestStream { inner: ReceiverStream::new(item_rx) };
        let outcome = run_with_cancellation(&call.cancel, (self.handler)(request_stream)).await;
        let _ = forwarder.await;

        let final_status = if forwarder_codec_is_err.load(std::sync::atomic::Ordering::Acquire) {
            Status::new(StatusCode::Internal, "failed to decode an inbound request payload")
        } else {
            match outcome {
                Some(Ok(resp)) => match encode_or_internal(self.response_codec.as_ref(), &resp) {
                    Ok(bytes) => match call.send_response_payload(bytes).await {
                        Ok(()) => Status::ok(),
                        Err(err) => err.to_status(),
                    },
                    Err(err) => err.to_status(),
                },
                Some(Err(err)) => err.to_status(),
                None => call.cancellation_status(),
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
    async fn sending_zero_requests_completes_the_inbound_sequence_empty() {
        let (caller_transport, responder_transport) = InMemoryTransport::pair();
        let caller = Endpoint::new(Arc::new(caller_transport), EndpointConfig::default());
        let responder = Endpoint::new(Arc::new(responder_transport), EndpointConfig::default());

        responder
            .responder()
            .register_client_stream(
                "Math",
                "Sum",
                super::ClientStreamHandler::new(i32_codec(), i32_codec(), |mut requests| async move {
                    let mut total = 0;
                    let mut saw_any = false;
                    while let Some(n) = requests.next().await {
                        saw_any = true;
                        total += n;
                    }
                    assert!(!saw_any);
                    Ok(total)
                }),
            )
            .unwrap();

        let (sink, response) =
            caller.caller().client_stream::<i32, i32>("Math", "Sum", i32_codec(), i32_codec()).await.unwrap();
        sink.close();
        assert_eq!(response.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deadline_exceeded_when_handler_outlives_it() {
        let (caller_transport, responder_transport) = InMemoryTransport::pair();
        let caller = Endpoint::new(Arc::new(caller_transport), EndpointConfig::default());
        let responder = Endpoint::new(Arc::new(responder_transport), EndpointConfig::default());

        responder
            .responder()
            .register_client_stream(
                "Math",
                "Sum",
                super::ClientStreamHandler::new(i32_codec(), i32_codec(), |mut requests| async move {
                    while requests.next().await.is_some() {}
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(0)
                }),
            )
            .unwrap();

        let (sink, response) = caller
            .caller()
            .client_stream_with_deadline::<i32, i32>("Math", "Sum", i32_codec(), i32_codec(), Duration::from_millis(20))
            .await
            .unwrap();
        sink.close();

        assert_eq!(response.await.unwrap_err().to_status().code, StatusCode::DeadlineExceeded);
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn forward_requests<Req>(
    mux: Arc<Multiplexer>,
    stream_id: StreamId,
    mut inbox: mpsc::Receiver<TransportMessage>,
    request_codec: BoxedCodec<Req>,
    item_tx: mpsc::Sender<Req>,
    codec_error: Arc<std::sync::atomic::AtomicBool>,
    cancel: CancellationToken,
    chain: MiddlewareChain,
    ctx: CallContext,
) where
    Req: Send + 'static,
{
    loop {
        match next_inbound(&mux, stream_id, &mut inbox, &chain, &ctx).await {
            Inbound::Metadata(_) => continue,
            Inbound::Payload(bytes) => match decode_or_internal(request_codec.as_ref(), &bytes) {
                Ok(item) => {
                    if item_tx.send(item).await.is_err() {
                        return;
                    }
                }
                Err(_) => {
                    codec_error.store(true, std::sync::atomic::Ordering::Release);
                    return;
                }
            },
            Inbound::Direct(_) => {
                codec_error.store(true, std::sync::atomic::Ordering::Release);
                return;
            }
            Inbound::EndOfStream => return,
            Inbound::Trailer(_) => return,
            Inbound::Closed(_) => {
                // A caller-sent reset (or an abnormal transport close)
                // folds into this variant; the handler producing our
                // outbound half has nothing left worth waiting for (§5).
                cancel.cancel();
                return;
            }
        }
    }
}
