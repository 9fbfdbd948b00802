//! An in-process, in-memory pipe transport: the reference [`Transport`]
//! implementation this crate ships (see the module-level doc on
//! [`super`]).

use super::{Transport, TransportRole};
use crate::wire::{DirectObject, Frame, StreamId, TransportMessage};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// One half of an in-memory pipe pair. Construct both halves together with
/// [`InMemoryTransport::pair`] — one plays `Role::Caller`, the other
/// `Role::Responder`, mirroring how a real socket pair would be handed to
/// each side of a connection.
pub struct InMemoryTransport {
    role: TransportRole,
    outbound_tx: mpsc::UnboundedSender<TransportMessage>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportMessage>>>,
    next_id: AtomicU64,
    finished_sending: Mutex<HashSet<StreamId>>,
    released: Mutex<HashSet<StreamId>>,
    closed: AtomicBool,
}

impl InMemoryTransport {
    /// Build a connected caller/responder pair sharing two unbounded pipes,
    /// one per direction.
    pub fn pair() -> (InMemoryTransport, InMemoryTransport) {
        let (c2r_tx, c2r_rx) = mpsc::unbounded_channel();
        let (r2c_tx, r2c_rx) = mpsc::unbounded_channel();

        let caller = InMemoryTransport {
            role: TransportRole::Caller,
            outbound_tx: c2r_tx,
            inbound_rx: Mutex::new(Some(r2c_rx)),
            next_id: AtomicU64::new(1),
            finished_sending: Mutex::new(HashSet::new()),
            released: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        };
        let responder = InMemoryTransport {
            role: TransportRole::Responder,
            outbound_tx: r2c_tx,
            inbound_rx: Mutex::new(Some(c2r_rx)),
            next_id: AtomicU64::new(2),
            finished_sending: Mutex::new(HashSet::new()),
            released: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        };
        (caller, responder)
    }

    /// Programming-error guard for §4.2 invariant (b): sending after local
    /// end-of-stream is a bug in the calling code, not a wire-level event.
    fn assert_not_finished(&self, stream_id: StreamId) {
        let finished = self.finished_sending.lock().unwrap();
        assert!(
            !finished.contains(&stream_id),
            "muxrpc: send on stream {stream_id} after local end-of-stream"
        );
    }

    fn mark_finished(&self, stream_id: StreamId, end_stream: bool) {
        if end_stream {
            self.finished_sending.lock().unwrap().insert(stream_id);
        }
    }

    fn send(&self, msg: TransportMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Unavailable("transport closed".into()));
        }
        self.outbound_tx
            .send(msg)
            .map_err(|_| Error::Unavailable("peer transport dropped".into()))
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn create_stream(&self) -> StreamId {
        let id = self.next_id.fetch_add(2, Ordering::SeqCst);
        StreamId(id)
    }

    async fn send_metadata(
        &self,
        stream_id: StreamId,
        metadata: crate::metadata::Metadata,
        end_stream: bool,
    ) -> Result<()> {
        self.assert_not_finished(stream_id);
        self.send(TransportMessage::new(stream_id, Frame::Metadata { metadata, end_stream }))?;
        self.mark_finished(stream_id, end_stream);
        Ok(())
    }

    async fn send_payload(&self, stream_id: StreamId, bytes: bytes::Bytes, end_stream: bool) -> Result<()> {
        self.assert_not_finished(stream_id);
        self.send(TransportMessage::new(stream_id, Frame::Payload { bytes, end_stream }))?;
        self.mark_finished(stream_id, end_stream);
        Ok(())
    }

    async fn send_direct(
        &self,
        stream_id: StreamId,
        object: DirectObject,
        end_stream: bool,
    ) -> Result<()> {
        self.assert_not_finished(stream_id);
        self.send(TransportMessage::new(stream_id, Frame::Direct { object, end_stream }))?;
        self.mark_finished(stream_id, end_stream);
        Ok(())
    }

    async fn finish_sending(&self, stream_id: StreamId) -> Result<()> {
        if self.finished_sending.lock().unwrap().contains(&stream_id) {
            return Ok(());
        }
        self.send(TransportMessage::new(stream_id, Frame::EndOfStream))?;
        self.mark_finished(stream_id, true);
        Ok(())
    }

    async fn reset(&self, stream_id: StreamId, status: crate::status::Status) -> Result<()> {
        // Deliberately skips `assert_not_finished`: a reset is a control
        // signal the local side can send regardless of whether it already
        // marked itself done sending payloads.
        self.send(TransportMessage::new(stream_id, Frame::Reset { status }))
    }

    fn release_stream_id(&self, stream_id: StreamId) -> bool {
        let mut released = self.released.lock().unwrap();
        if released.contains(&stream_id) {
            return false;
        }
        released.insert(stream_id);
        self.finished_sending.lock().unwrap().remove(&stream_id);
        true
    }

    fn incoming_frames(&self) -> mpsc::UnboundedReceiver<TransportMessage> {
        self.inbound_rx
            .lock()
            .unwrap()
            .take()
            .expect("muxrpc: incoming_frames() called more than once on this transport")
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping our half of the sender makes the peer's receiver observe
        // end-of-stream for every stream it still has open; the
        // multiplexer turns that into a synthetic UNAVAILABLE trailer.
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn role(&self) -> TransportRole {
        self.role
    }

    fn supports_zero_copy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;

    #[tokio::test]
    async fn stream_ids_follow_role_parity() {
        let (caller, responder) = InMemoryTransport::pair();
        assert_eq!(caller.create_stream(), StreamId(1));
        assert_eq!(caller.create_stream(), StreamId(3));
        assert_eq!(responder.create_stream(), StreamId(2));
        assert_eq!(responder.create_stream(), StreamId(4));
    }

    #[tokio::test]
    async fn frames_cross_to_the_peer() {
        let (caller, responder) = InMemoryTransport::pair();
        let stream_id = caller.create_stream();
        caller
            .send_metadata(stream_id, Metadata::for_method_path("Echo", "Say"), false)
            .await
            .unwrap();

        let mut inbound = responder.incoming_frames();
        let msg = inbound.recv().await.unwrap();
        assert_eq!(msg.stream_id, stream_id);
        assert!(msg.frame.is_metadata());
    }

    #[tokio::test]
    #[should_panic(expected = "after local end-of-stream")]
    async fn sending_after_end_of_stream_panics() {
        let (caller, _responder) = InMemoryTransport::pair();
        let stream_id = caller.create_stream();
        caller
            .send_payload(stream_id, bytes::Bytes::from_static(b"x"), true)
            .await
            .unwrap();
        let _ = caller
            .send_payload(stream_id, bytes::Bytes::from_static(b"y"), false)
            .await;
    }

    #[tokio::test]
    async fn release_is_not_idempotent_true_twice() {
        let (caller, _responder) = InMemoryTransport::pair();
        let stream_id = caller.create_stream();
        assert!(caller.release_stream_id(stream_id));
        assert!(!caller.release_stream_id(stream_id));
    }
}
