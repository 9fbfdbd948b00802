//! Transport abstraction layer (§6).
//!
//! `muxrpc-core` knows nothing about concrete wire formats. A transport
//! implementation — TCP/HTTP2, WebSocket, a process-local isolate channel —
//! satisfies the [`Transport`] trait and is handed to an
//! [`crate::endpoint::Endpoint`]; everything above that line (multiplexer,
//! call state machines, caller/responder endpoints) is identical regardless
//! of which transport is plugged in.
//!
//! This module also ships [`inmemory::InMemoryTransport`], a pair of
//! connected in-process pipes. It is deliberately the simplest possible
//! transport (no framing, no I/O) and exists so this crate has at least one
//! reference implementation to exercise the trait against and so its own
//! test suite can drive full caller/responder round trips without a real
//! network.

pub mod inmemory;

use crate::wire::{StreamId, TransportMessage};
use crate::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Which side of a connection this transport instance represents (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRole {
    Caller,
    Responder,
}

/// Transport-agnostic message flow, consumed by [`crate::mux::Multiplexer`]
/// (§6). Every concrete transport backend implements this trait.
///
/// # Thread safety
///
/// Implementations must be `Send + Sync`: the multiplexer may call
/// `send_*` from any call's owning task concurrently with the background
/// task draining `incoming_frames()`.
///
/// # Ordering
///
/// Implementations MUST preserve per-stream, per-direction frame order
/// (§6). Across streams, no ordering is required.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Allocate a fresh stream ID for a new locally-initiated stream,
    /// following this transport's role parity (§3).
    fn create_stream(&self) -> StreamId;

    /// Send a metadata frame on `stream_id`.
    async fn send_metadata(
        &self,
        stream_id: StreamId,
        metadata: crate::metadata::Metadata,
        end_stream: bool,
    ) -> Result<()>;

    /// Send a payload frame on `stream_id`.
    async fn send_payload(&self, stream_id: StreamId, bytes: bytes::Bytes, end_stream: bool) -> Result<()>;

    /// Send a direct-object frame. Only implemented by transports reporting
    /// `supports_zero_copy() == true`; others return
    /// `Error::Protocol` if called (call sites must check the capability
    /// first — §9).
    async fn send_direct(
        &self,
        stream_id: StreamId,
        object: crate::wire::DirectObject,
        end_stream: bool,
    ) -> Result<()> {
        let _ = (stream_id, object, end_stream);
        Err(crate::Error::Protocol(
            "transport does not support zero-copy direct frames".into(),
        ))
    }

    /// Mark that the local side has nothing further to send on this stream,
    /// without necessarily terminating the remote-reading side.
    async fn finish_sending(&self, stream_id: StreamId) -> Result<()>;

    /// Abort `stream_id` out-of-band, independent of whichever half (if
    /// any) has already called `finish_sending` (§5). This is how a
    /// dropped caller handle reaches the peer: unlike `send_metadata` /
    /// `send_payload`, implementations MUST accept this even after the
    /// local side marked itself finished.
    async fn reset(&self, stream_id: StreamId, status: crate::status::Status) -> Result<()>;

    /// Release a stream ID after both directions have reached a terminal
    /// state. Returns `false` if the ID was already released or was never
    /// allocated (§4.2).
    fn release_stream_id(&self, stream_id: StreamId) -> bool;

    /// The full inbound frame stream for this connection — every frame for
    /// every stream, including remote-initiated ones (surfaced by their
    /// first, previously-unseen stream ID, per §6). The multiplexer is the
    /// only consumer.
    fn incoming_frames(&self) -> mpsc::UnboundedReceiver<TransportMessage>;

    /// Close the transport. All live streams MUST eventually observe a
    /// synthetic `UNAVAILABLE` trailer (§6, §7 class 4).
    async fn close(&self);

    fn is_closed(&self) -> bool;

    fn role(&self) -> TransportRole;

    /// Whether this transport supports direct-object frames bypassing
    /// encode/decode (§3, §9).
    fn supports_zero_copy(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::inmemory::InMemoryTransport;
    use super::*;

    #[tokio::test]
    async fn paired_transport_roles_differ() {
        let (caller, responder) = InMemoryTransport::pair();
        assert_eq!(caller.role(), TransportRole::Caller);
        assert_eq!(responder.role(), TransportRole::Responder);
    }
}
