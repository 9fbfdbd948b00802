//! Plumbing shared by all four call-pattern modules (§4.3, §4.4, §4.5).
//!
//! Every call — whichever pattern it is — runs its core logic as a spawned
//! task reachable only through channels, per §9's "separate handler
//! execution from stream dispatch": the caller-visible future/stream/sink is
//! a thin handle whose `Drop` signals a [`CancellationToken`], never a type
//! the public API lets re-enter the dispatcher.

use crate::cancel::CancellationToken;
use crate::codec::Codec;
use crate::metadata::Metadata;
use crate::middleware::{CallContext, MiddlewareChain};
use crate::mux::Multiplexer;
use crate::status::{Status, StatusCode};
use crate::wire::{DirectObject, Frame, StreamId, TransportMessage};
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One inbound event as seen by either side of a call, after folding in the
/// multiplexer's synthetic-abort bookkeeping (§4.2, §7 class 4).
pub(crate) enum Inbound {
    /// Non-terminal metadata (the responder's initial metadata, from the
    /// caller's point of view).
    Metadata(Metadata),
    Payload(Bytes),
    Direct(DirectObject),
    /// Trailing metadata carrying a terminal status (§4.1).
    Trailer(Status),
    /// The bare end-of-stream marker with no payload.
    EndOfStream,
    /// The inbox closed with no trailer ever observed — either the
    /// multiplexer aborted the stream (§4.2) or the peer transport dropped
    /// without sending one (§7 class 4).
    Closed(Status),
}

/// Pull the next event for `stream_id` out of `inbox`, consulting the
/// multiplexer for a synthetic abort status if the channel has closed.
///
/// Every inbound frame is first run through `chain`'s per-frame hook (§4.7:
/// "per-frame data pass-through (stream frames, both directions)") before
/// being folded into an [`Inbound`] variant. This one funnel is reached by
/// both the caller reading responses and the responder reading requests, so
/// routing it here covers both directions of frame flow without duplicating
/// the hook call at every call-pattern's read site. A middleware that
/// rejects a frame short-circuits the call exactly as §4.7 describes: the
/// rejection becomes the call's terminal status, as if the peer had sent
/// that trailer itself.
pub(crate) async fn next_inbound(
    mux: &Multiplexer,
    stream_id: StreamId,
    inbox: &mut mpsc::Receiver<TransportMessage>,
    chain: &MiddlewareChain,
    ctx: &CallContext,
) -> Inbound {
    match inbox.recv().await {
        Some(TransportMessage { frame, .. }) => {
            if let Err(err) = chain.on_frame(ctx, &frame).await {
                return Inbound::Closed(err.to_status());
            }
            match frame {
                Frame::Metadata { metadata, end_stream } => {
                    if end_stream {
                        match metadata.status() {
                            Some(status) => Inbound::Trailer(status),
                            None => Inbound::Trailer(Status::new(
                                StatusCode::Internal,
                                "trailing metadata carried no grpc-status",
                            )),
                        }
                    } else {
                        Inbound::Metadata(metadata)
                    }
                }
                Frame::Payload { bytes, .. } => Inbound::Payload(bytes),
                Frame::Direct { object, .. } => Inbound::Direct(object),
                Frame::EndOfStream => Inbound::EndOfStream,
                // A peer-sent abort folds into the same terminal variant a
                // synthetic mux-side abort produces (§4.2, §5) — from the
                // reader's point of view both mean "this stream is done,
                // and here is why," whether the multiplexer manufactured
                // the status locally or the peer sent it across the wire.
                Frame::Reset { status } => Inbound::Closed(status),
            }
        }
        None => {
            let status = mux
                .take_abort_status(stream_id)
                .unwrap_or_else(|| Status::new(StatusCode::Unavailable, "stream closed without a trailer"));
            Inbound::Closed(status)
        }
    }
}

/// Caller-side: allocate a stream and send its initial metadata carrying the
/// method path and, if set, a `grpc-timeout` deadline (§4.1, §4.3 New ->
/// Open, §5).
pub(crate) async fn open_caller_stream(
    mux: &Multiplexer,
    service: &str,
    method: &str,
    deadline: Option<Duration>,
) -> Result<(StreamId, mpsc::Receiver<TransportMessage>)> {
    let stream_id = mux.create_stream();
    let inbox = mux
        .messages_for(stream_id)
        .expect("muxrpc: freshly created stream always has a registered inbox");
    let mut metadata = Metadata::for_method_path(service, method);
    if let Some(deadline) = deadline {
        metadata.push_deadline(deadline);
    }
    mux.send_metadata(stream_id, metadata, false).await?;
    Ok((stream_id, inbox))
}

/// Responder-side handle to one in-flight call, handed to pattern-specific
/// dispatch adaptors (never to the user handler directly — §9).
pub struct ResponderCall {
    pub(crate) mux: Arc<Multiplexer>,
    pub(crate) stream_id: StreamId,
    pub(crate) cancel: CancellationToken,
    /// Set when `cancel` was armed from a `grpc-timeout` deadline rather
    /// than an ordinary cancellation, so dispatch can report
    /// `DEADLINE_EXCEEDED` instead of `CANCELLED` (§5).
    deadline_expired: Option<Arc<AtomicBool>>,
    sent_initial: bool,
}

impl ResponderCall {
    pub(crate) fn new(
        mux: Arc<Multiplexer>,
        stream_id: StreamId,
        cancel: CancellationToken,
        deadline_expired: Option<Arc<AtomicBool>>,
    ) -> Self {
        ResponderCall { mux, stream_id, cancel, deadline_expired, sent_initial: false }
    }

    /// The status to report when `self.cancel` has fired (§4.3, §5): the
    /// handler-cancelled case's `CANCELLED`, or `DEADLINE_EXCEEDED` if a
    /// deadline timer was the one that tripped it.
    pub(crate) fn cancellation_status(&self) -> Status {
        let expired = self.deadline_expired.as_ref().map(|f| f.load(Ordering::Acquire)).unwrap_or(false);
        if expired {
            Status::new(StatusCode::DeadlineExceeded, "deadline exceeded")
        } else {
            Status::new(StatusCode::Cancelled, "handler cancelled")
        }
    }

    /// Send the responder's initial metadata, exactly once, lazily before
    /// the first response payload (§4.3: "Responder sends initial
    /// metadata, ... response payload(s), trailing metadata").
    pub(crate) async fn ensure_initial_metadata(&mut self) -> Result<()> {
        if !self.sent_initial {
            self.mux.send_metadata(self.stream_id, Metadata::new(), false).await?;
            self.sent_initial = true;
        }
        Ok(())
    }

    pub(crate) async fn send_response_payload(&mut self, bytes: Bytes) -> Result<()> {
        self.ensure_initial_metadata().await?;
        self.mux.send_payload(self.stream_id, bytes, false).await
    }

    pub(crate) async fn send_trailer(&mut self, status: Status) -> Result<()> {
        self.ensure_initial_metadata().await?;
        self.mux.send_metadata(self.stream_id, Metadata::for_status(&status), true).await
    }
}

/// Encode `value` or turn a codec failure into the `INTERNAL` status the
/// wire format requires for it (§6: "failures surface as `INTERNAL` during
/// call execution").
pub(crate) fn encode_or_internal<T>(codec: &dyn Codec<T>, value: &T) -> Result<Bytes> {
    codec.encode(value).map_err(|_| Error::Status(Status::new(StatusCode::Internal, "encode failed")))
}

pub(crate) fn decode_or_internal<T>(codec: &dyn Codec<T>, bytes: &[u8]) -> Result<T> {
    codec.decode(bytes).map_err(|_| Error::Status(Status::new(StatusCode::Internal, "decode failed")))
}

/// Drain the responder-side inbound channel to end-of-stream, ignoring
/// anything it yields. Used to satisfy §4.3 bidi's requirement that a
/// handler returning its outbound sequence early must still drain inbound
/// requests until the peer's end-of-stream, and by the ad-hoc/unimplemented
/// fast paths that reject a call without ever looking at its body.
pub(crate) async fn drain_to_end_of_stream(
    mux: &Multiplexer,
    stream_id: StreamId,
    inbox: &mut mpsc::Receiver<TransportMessage>,
    chain: &MiddlewareChain,
    ctx: &CallContext,
) {
    loop {
        match next_inbound(mux, stream_id, inbox, chain, ctx).await {
            Inbound::Trailer(_) | Inbound::EndOfStream | Inbound::Closed(_) => return,
            Inbound::Metadata(_) | Inbound::Payload(_) | Inbound::Direct(_) => continue,
        }
    }
}
