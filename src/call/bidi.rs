//! Bidirectional-streaming calls: independent request and response
//! sequences on the same stream (§4.3 "Bidirectional").

use super::client_stream::{forward_requests, RequestSink, RequestStream};
use super::server_stream::ResponseStream;
use super::support::{encode_or_internal, next_inbound, open_caller_stream, Inbound, ResponderCall};
use super::{CallState, Half};
use crate::cancel::CancellationToken;
use crate::codec::BoxedCodec;
use crate::middleware::{CallContext, MiddlewareChain};
use crate::mux::Multiplexer;
use crate::status::Status;
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

/// The caller-visible duplex surface for a bidi call (§4.4 `bidiStream(...)
/// -> DuplexChannel<Request, Response>`): a sink of typed requests and a
/// lazy, finite sequence of typed responses, closing independently.
pub struct BidiChannel<Req, Resp> {
    pub requests: RequestSink<Req>,
    pub responses: ResponseStream<Resp>,
}

/// Open a bidi call: send initial metadata, then drive the request and
/// response halves with two independent background tasks sharing one
/// cancellation token, per §4.3's "the two halves close independently".
pub async fn call_bidi<Req, Resp>(
    mux: Arc<Multiplexer>,
    service: &str,
    method: &str,
    request_codec: BoxedCodec<Req>,
    response_codec: BoxedCodec<Resp>,
    deadline: Option<Duration>,
    chain: MiddlewareChain,
    ctx: CallContext,
) -> Result<BidiChannel<Req, Resp>>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let (stream_id, inbox) = open_caller_stream(&mux, service, method, deadline).await?;
    let mut state = CallState::new();
    state.open();

    let cancel = CancellationToken::new();
    let deadline_expired = deadline.map(|d| crate::cancel::arm_deadline(cancel.clone(), d));
    let (req_tx, req_rx) = mpsc::channel(16);
    let (resp_tx, resp_rx) = mpsc::channel(16);

    let send_mux = mux.clone();
    tokio::spawn(async move {
        drive_caller_requests(send_mux, stream_id, req_rx, request_codec).await;
    });

    let recv_mux = mux.clone();
    let recv_cancel = cancel.clone();
    tokio::spawn(async move {
        drive_caller_responses(
            recv_mux,
            stream_id,
            inbox,
            response_codec,
            resp_tx,
            recv_cancel,
            deadline_expired,
            chain,
            ctx,
        )
        .await;
    });

    Ok(BidiChannel {
        requests: RequestSink::new(req_tx),
        responses: ResponseStream::new(ReceiverStream::new(resp_rx), cancel, mux.clone(), stream_id),
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
                        let item = super::support::decode_or_internal(response_codec.as_ref(), &bytes);
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

/// A registered bidi handler: given the inbound request sequence, returns
/// the outbound response sequence (§4.5).
pub struct BidiHandler<Req, Resp> {
    request_codec: BoxedCodec<Req>,
    response_codec: BoxedCodec<Resp>,
    #[allow(clippy::type_complexity)]
    handler: Box<dyn Fn(RequestStream<Req>) -> Pin<Box<dyn Stream<Item = Result<Resp>> + Send>> + Send + Sync>,
}

impl<Req, Resp> BidiHandler<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Send + Sync + 'static,
{
    pub(crate) fn contract_codecs(&self) -> crate::contract::ErasedCodecs {
        crate::contract::ErasedCodecs::new(self.request_codec.clone(), self.response_codec.clone())
    }

    pub fn new<F, S>(request_codec: BoxedCodec<Req>, response_codec: BoxedCodec<Resp>, handler: F) -> Self
    where
        F: Fn(RequestStream<Req>) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Resp>> + Send + 'static,
    {
        BidiHandler {
            request_codec,
            response_codec,
            handler: Box::new(move |reqs| Box::pin(handler(reqs))),
        }
    }
}

#[async_trait]
impl<Req, Resp> super::unary::ErasedHandler for BidiHandler<Req, Resp>
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
        use futures::StreamExt;

        let mux = call.mux.clone();
        let stream_id = call.stream_id;

        let (item_tx, item_rx) = mpsc::channel(16);
        let codec_error = Arc::new(AtomicBool::new(false));
        let forwarder = tokio::spawn(forward_requests(
            mux.clone(),
            stream_id,
            inbox,
            self.request_codec.clone(),
            item_tx,
            codec_error.clone(),
            call.cancel.clone(),
            chain.clone(),
            ctx.clone(),
        ));

        let request_stream = RequestStream::new(ReceiverStream::new(item_rx));
        let mut outbound = (self.handler)(request_stream);

        let final_status = loop {
            let next = tokio::select! {
                biased;
                _ = call.cancel.cancelled() => break call.cancellation_status(),
                item = outbound.next() => item,
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

        // §4.3: draining the inbound half continues even after our outbound
        // half is closed; we only release the stream ID once both this
        // side's sending and the peer's sending have reached a terminal
        // state (§3 stream-id lifecycle).
        let _ = forwarder.await;
        if codec_error.load(std::sync::atomic::Ordering::Acquire) {
            tracing::warn!(stream = %stream_id, "bidi handler's inbound half saw an undecodable payload");
        }
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

    fn string_codec() -> crate::codec::BoxedCodec<String> {
        Arc::new(FnCodec::new(
            |s: &String| Ok(Bytes::copy_from_slice(s.as_bytes())),
            |b: &[u8]| String::from_utf8(b.to_vec()).map_err(|e| crate::Error::Codec(e.to_string())),
        ))
    }

    #[tokio::test]
    async fn echo_preserves_send_order() {
        let (caller_transport, responder_transport) = InMemoryTransport::pair();
        let caller = Endpoint::new(Arc::new(caller_transport), EndpointConfig::default());
        let responder = Endpoint::new(Arc::new(responder_transport), EndpointConfig::default());

        responder
            .responder()
            .register_bidi(
                "Chat",
                "Echo",
                super::BidiHandler::new(string_codec(), string_codec(), |requests| requests.map(Ok)),
            )
            .unwrap();

        let mut channel = caller
            .caller()
            .bidi_stream::<String, String>("Chat", "Echo", string_codec(), string_codec())
            .await
            .unwrap();

        for word in ["a", "b", "c"] {
            channel.requests.send(word.to_string()).await.unwrap();
        }
        channel.requests.close();

        let mut observed = Vec::new();
        while let Some(item) = channel.responses.next().await {
            observed.push(item.unwrap());
        }
        assert_eq!(observed, vec!["a", "b", "c"]);
    }

    /// A handler that produces its outbound sequence before the inbound one
    /// finishes must still drain the remaining inbound frames (§4.3: "MUST
    /// still drain inbound requests until end-of-stream from the peer").
    #[tokio::test]
    async fn handler_finishing_early_still_drains_inbound() {
        let (caller_transport, responder_transport) = InMemoryTransport::pair();
        let caller = Endpoint::new(Arc::new(caller_transport), EndpointConfig::default());
        let responder = Endpoint::new(Arc::new(responder_transport), EndpointConfig::default());

        responder
            .responder()
            .register_bidi(
                "Chat",
                "Greet",
                super::BidiHandler::new(string_codec(), string_codec(), |_requests| {
                    futures::stream::once(async { Ok("hello".to_string()) })
                }),
            )
            .unwrap();

        let mut channel = caller
            .caller()
            .bidi_stream::<String, String>("Chat", "Greet", string_codec(), string_codec())
            .await
            .unwrap();

        assert_eq!(channel.responses.next().await.unwrap().unwrap(), "hello");
        assert!(channel.responses.next().await.is_none());

        // The handler's outbound half closed before its inbound half did;
        // sends after that must not hang or error on the caller side.
        channel.requests.send("still listening?".to_string()).await.unwrap();
        channel.requests.close();
    }

    #[tokio::test]
    async fn deadline_exceeded_when_handler_outlives_it() {
        let (caller_transport, responder_transport) = InMemoryTransport::pair();
        let caller = Endpoint::new(Arc::new(caller_transport), EndpointConfig::default());
        let responder = Endpoint::new(Arc::new(responder_transport), EndpointConfig::default());

        responder
            .responder()
            .register_bidi(
                "Chat",
                "Slow",
                super::BidiHandler::new(string_codec(), string_codec(), |_requests| {
                    futures::stream::once(async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok("late".to_string())
                    })
                }),
            )
            .unwrap();

        let mut channel = caller
            .caller()
            .bidi_stream_with_deadline::<String, String>(
                "Chat",
                "Slow",
                string_codec(),
                string_codec(),
                Duration::from_millis(20),
            )
            .await
            .unwrap();
        channel.requests.close();

        let first = channel.responses.next().await.unwrap();
        assert_eq!(first.unwrap_err().to_status().code, StatusCode::DeadlineExceeded);
    }
}
