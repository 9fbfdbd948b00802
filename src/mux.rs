//! Stream multiplexer (§4.2): routes inbound frames from one [`Transport`]
//! into per-stream inboxes, allocates stream IDs, and enforces the
//! transport-close → synthetic-`UNAVAILABLE` invariant.

use crate::metadata::Metadata;
use crate::status::{Status, StatusCode};
use crate::transport::Transport;
use crate::wire::{Frame, StreamId, TransportMessage};
use crate::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Configuration for a [`Multiplexer`], per §5's bounded-watermark
/// requirement.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Per-stream inbox capacity. When a producer would exceed this, the
    /// runtime drops that stream with `RESOURCE_EXHAUSTED` (§5) rather than
    /// blocking the multiplexer's single dispatch loop.
    pub inbox_capacity: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        MultiplexerConfig { inbox_capacity: 64 }
    }
}

struct Inbox {
    tx: mpsc::Sender<TransportMessage>,
    rx: Mutex<Option<mpsc::Receiver<TransportMessage>>>,
}

struct MuxState {
    transport: Arc<dyn Transport>,
    config: MultiplexerConfig,
    inboxes: Mutex<HashMap<StreamId, Arc<Inbox>>>,
    /// Terminal status recorded when an inbox was closed abnormally (by the
    /// multiplexer, not by the peer sending a real trailer) — resource
    /// exhaustion or a transport-level close. A stream's owning state
    /// machine consults this when its inbox closes without ever having
    /// observed trailing metadata.
    aborted: Mutex<HashMap<StreamId, Status>>,
    new_streams_tx: mpsc::UnboundedSender<StreamId>,
    new_streams_rx: Mutex<Option<mpsc::UnboundedReceiver<StreamId>>>,
    closed: AtomicBool,
}

/// Routes inbound frames to per-stream inboxes and fans outbound
/// operations through to the underlying transport (§4.2).
pub struct Multiplexer {
    state: Arc<MuxState>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl Multiplexer {
    pub fn new(transport: Arc<dyn Transport>, config: MultiplexerConfig) -> Arc<Multiplexer> {
        let (new_streams_tx, new_streams_rx) = mpsc::unbounded_channel();
        let state = Arc::new(MuxState {
            transport,
            config,
            inboxes: Mutex::new(HashMap::new()),
            aborted: Mutex::new(HashMap::new()),
            new_streams_tx,
            new_streams_rx: Mutex::new(Some(new_streams_rx)),
            closed: AtomicBool::new(false),
        });

        let dispatch_state = state.clone();
        let mut incoming = dispatch_state.transport.incoming_frames();
        let task = tokio::spawn(async move {
            while let Some(msg) = incoming.recv().await {
                dispatch_state.route(msg);
            }
            dispatch_state.shutdown(StatusCode::Unavailable, "transport connection closed");
        });

        Arc::new(Multiplexer { state, dispatch_task: Mutex::new(Some(task)) })
    }

    /// Allocate a fresh stream ID and register its inbox (§4.2
    /// `createStream()`).
    pub fn create_stream(&self) -> StreamId {
        let id = self.state.transport.create_stream();
        self.state.register_inbox(id);
        trace!(stream = %id, "allocated stream");
        id
    }

    /// Take ownership of the inbox receiver for `stream_id` (§4.2
    /// `messagesFor`). Valid for a locally-allocated stream immediately
    /// after `create_stream`, or for a remote-initiated stream after it has
    /// been observed via [`Multiplexer::accept`].
    pub fn messages_for(&self, stream_id: StreamId) -> Option<mpsc::Receiver<TransportMessage>> {
        let inboxes = self.state.inboxes.lock().unwrap();
        let inbox = inboxes.get(&stream_id)?;
        inbox.rx.lock().unwrap().take()
    }

    /// If this stream's inbox was closed by the multiplexer itself (not by
    /// a real trailer from the peer), the status it was closed with.
    pub fn take_abort_status(&self, stream_id: StreamId) -> Option<Status> {
        self.state.aborted.lock().unwrap().remove(&stream_id)
    }

    /// Wait for the next remote-initiated stream (§4.5 dispatch). Returns
    /// `None` once the multiplexer is closed and no further streams will
    /// arrive.
    pub async fn accept(&self) -> Option<StreamId> {
        let mut rx = self.state.new_streams_rx.lock().unwrap().take()?;
        let result = rx.recv().await;
        *self.state.new_streams_rx.lock().unwrap() = Some(rx);
        result
    }

    pub async fn send_metadata(&self, stream_id: StreamId, metadata: Metadata, end_stream: bool) -> Result<()> {
        self.state.transport.send_metadata(stream_id, metadata, end_stream).await
    }

    pub async fn send_payload(&self, stream_id: StreamId, bytes: Bytes, end_stream: bool) -> Result<()> {
        self.state.transport.send_payload(stream_id, bytes, end_stream).await
    }

    pub async fn send_direct(
        &self,
        stream_id: StreamId,
        object: crate::wire::DirectObject,
        end_stream: bool,
    ) -> Result<()> {
        self.state.transport.send_direct(stream_id, object, end_stream).await
    }

    pub async fn finish_sending(&self, stream_id: StreamId) -> Result<()> {
        self.state.transport.finish_sending(stream_id).await
    }

    /// Send a peer-visible abort for `stream_id` (§5). Used by a caller
    /// handle's `Drop` to tell the responder it can stop producing, since
    /// a local-only `CancellationToken` never crosses the wire on its own.
    pub async fn reset_stream(&self, stream_id: StreamId, status: Status) -> Result<()> {
        self.state.transport.reset(stream_id, status).await
    }

    /// Release a stream ID once both directions have reached a terminal
    /// state. Returns `false` if already released (§4.2).
    pub fn release_stream_id(&self, stream_id: StreamId) -> bool {
        self.state.inboxes.lock().unwrap().remove(&stream_id);
        self.state.aborted.lock().unwrap().remove(&stream_id);
        self.state.transport.release_stream_id(stream_id)
    }

    pub fn supports_zero_copy(&self) -> bool {
        self.state.transport.supports_zero_copy()
    }

    /// Close the multiplexer: every still-open inbox is closed with a
    /// synthetic `UNAVAILABLE` trailer (§4.2), and the transport itself is
    /// closed.
    pub async fn close(&self) {
        self.state.transport.close().await;
        self.state.shutdown(StatusCode::Unavailable, "multiplexer closed");
        if let Some(task) = self.dispatch_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl MuxState {
    fn register_inbox(&self, stream_id: StreamId) {
        let (tx, rx) = mpsc::channel(self.config.inbox_capacity.max(1));
        let inbox = Arc::new(Inbox { tx, rx: Mutex::new(Some(rx)) });
        self.inboxes.lock().unwrap().insert(stream_id, inbox);
    }

    fn route(&self, msg: TransportMessage) {
        let stream_id = msg.stream_id;
        let inbox = {
            let inboxes = self.inboxes.lock().unwrap();
            inboxes.get(&stream_id).cloned()
        };

        let inbox = match inbox {
            Some(inbox) => inbox,
            None if msg.frame.is_metadata() => {
                // First frame for a previously-unseen ID: a remote-initiated
                // stream announcing itself (§6).
                self.register_inbox(stream_id);
                let inbox = self.inboxes.lock().unwrap().get(&stream_id).cloned().unwrap();
                if self.new_streams_tx.send(stream_id).is_err() {
                    debug!(stream = %stream_id, "no responder listening for new streams");
                }
                inbox
            }
            None => {
                // §4.2 invariant (a): a frame for a stream never allocated
                // or announced. Drop it; this is a peer protocol violation,
                // not something the multiplexer can recover a stream from.
                warn!(stream = %stream_id, "dropping frame for unknown stream");
                return;
            }
        };

        match inbox.tx.try_send(msg) {
            Ok(()) => {}
            Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                warn!(stream = %stream_id, "inbox watermark exceeded, aborting stream");
                self.abort_stream(stream_id, StatusCode::ResourceExhausted, "inbox backpressure watermark exceeded");
            }
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                trace!(stream = %stream_id, "inbox receiver already dropped");
            }
        }
    }

    fn abort_stream(&self, stream_id: StreamId, code: StatusCode, message: &str) {
        self.aborted
            .lock()
            .unwrap()
            .insert(stream_id, Status::new(code, message.to_string()));
        self.inboxes.lock().unwrap().remove(&stream_id);
    }

    /// §4.2: "After close(), all in-flight inboxes are closed with an
    /// UNAVAILABLE synthetic trailer."
    fn shutdown(&self, code: StatusCode, message: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let stale: Vec<StreamId> = self.inboxes.lock().unwrap().keys().copied().collect();
        for stream_id in stale {
            self.abort_stream(stream_id, code, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::inmemory::InMemoryTransport;

    #[tokio::test]
    async fn create_stream_registers_an_inbox() {
        let (caller_transport, _responder_transport) = InMemoryTransport::pair();
        let mux = Multiplexer::new(Arc::new(caller_transport), MultiplexerConfig::default());
        let stream_id = mux.create_stream();
        assert!(mux.messages_for(stream_id).is_some());
    }

    #[tokio::test]
    async fn unannounced_frame_is_dropped_not_delivered() {
        let (caller_transport, responder_transport) = InMemoryTransport::pair();
        let caller_transport = Arc::new(caller_transport);
        let mux = Multiplexer::new(caller_transport.clone(), MultiplexerConfig::default());

        // Responder sends a payload for a stream id the caller mux never
        // allocated or was told about.
        responder_transport
            .send_payload(StreamId(2), Bytes::from_static(b"x"), false)
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(mux.messages_for(StreamId(2)).is_none());
    }

    #[tokio::test]
    async fn remote_initiated_stream_is_observable_via_accept() {
        let (caller_transport, responder_transport) = InMemoryTransport::pair();
        let responder_transport = Arc::new(responder_transport);
        let responder_mux = Multiplexer::new(responder_transport, MultiplexerConfig::default());

        caller_transport
            .send_metadata(StreamId(1), Metadata::for_method_path("Echo", "Say"), false)
            .await
            .unwrap();

        let accepted = responder_mux.accept().await;
        assert_eq!(accepted, Some(StreamId(1)));
    }

    #[tokio::test]
    async fn close_aborts_live_streams_with_unavailable() {
        let (caller_transport, _responder_transport) = InMemoryTransport::pair();
        let mux = Multiplexer::new(Arc::new(caller_transport), MultiplexerConfig::default());
        let stream_id = mux.create_stream();
        mux.close().await;
        assert_eq!(
            mux.take_abort_status(stream_id).map(|s| s.code),
            Some(StatusCode::Unavailable)
        );
    }
}
