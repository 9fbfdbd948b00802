//! Wire model: stream identifiers and the frame union every transport
//! exchanges with the multiplexer (§3, §4.1).

use crate::metadata::Metadata;
use crate::status::Status;
use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A stream identifier, unique per direction within one transport
/// connection (§3). The caller side allocates odd IDs, the responder side
/// even IDs; callers never construct one directly — they come from
/// [`crate::mux::Multiplexer::create_stream`] or a transport's
/// `incoming_frames()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side of a connection allocated a given stream ID (§3's parity
/// rule).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Allocates odd stream IDs; the invoking side.
    Caller,
    /// Allocates even stream IDs; the serving side.
    Responder,
}

impl Role {
    /// First ID this role allocates, and the stride between successive
    /// allocations (both are 2, starting at 1 for callers and 2 for
    /// responders — §3).
    pub fn first_id(self) -> u64 {
        match self {
            Role::Caller => 1,
            Role::Responder => 2,
        }
    }

    pub fn owns(self, id: StreamId) -> bool {
        match self {
            Role::Caller => id.0 % 2 == 1,
            Role::Responder => id.0 % 2 == 0,
        }
    }
}

/// A native, in-process object reference carried by a direct-object frame
/// (§3, zero-copy). Only meaningful on transports reporting
/// `supports_zero_copy()`; see `Transport::supports_zero_copy` in
/// [`crate::transport`]. `muxrpc-core` makes no correctness guarantee based
/// on identity once such a reference crosses an actually-remote boundary
/// (§9) — transports that can't honour that must fall back to encoding.
pub type DirectObject = Arc<dyn Any + Send + Sync>;

/// A single transport message: the tagged union described in §3.
#[derive(Clone)]
pub enum Frame {
    /// Initial or trailing metadata. `end_stream` marks this as the final
    /// frame sent in this direction on this stream.
    Metadata { metadata: Metadata, end_stream: bool },
    /// An opaque, length-delimited payload. Must be delivered whole — a
    /// transport that fragments on the wire reassembles before handing this
    /// to the multiplexer (§4.1).
    Payload { bytes: Bytes, end_stream: bool },
    /// A native object reference, valid only on zero-copy transports.
    Direct { object: DirectObject, end_stream: bool },
    /// A bare end-of-stream marker with no payload (used by cancellation
    /// and by client/server halves that finish sending without a final
    /// payload attached).
    EndOfStream,
    /// An out-of-band abort sent by either side to tear a stream down
    /// without waiting for the normal trailer handshake — the wire
    /// counterpart of a dropped caller handle (§5). Always terminal.
    Reset { status: Status },
}

impl Frame {
    pub fn end_stream(&self) -> bool {
        match self {
            Frame::Metadata { end_stream, .. } => *end_stream,
            Frame::Payload { end_stream, .. } => *end_stream,
            Frame::Direct { end_stream, .. } => *end_stream,
            Frame::EndOfStream => true,
            Frame::Reset { .. } => true,
        }
    }

    pub fn is_metadata(&self) -> bool {
        matches!(self, Frame::Metadata { .. })
    }

    pub fn is_payload(&self) -> bool {
        matches!(self, Frame::Payload { .. })
    }

    pub fn into_metadata(self) -> Option<Metadata> {
        match self {
            Frame::Metadata { metadata, .. } => Some(metadata),
            _ => None,
        }
    }

    pub fn into_payload(self) -> Option<Bytes> {
        match self {
            Frame::Payload { bytes, .. } => Some(bytes),
            _ => None,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Metadata { metadata, end_stream } => f
                .debug_struct("Metadata")
                .field("len", &metadata.len())
                .field("end_stream", end_stream)
                .finish(),
            Frame::Payload { bytes, end_stream } => f
                .debug_struct("Payload")
                .field("bytes", &bytes.len())
                .field("end_stream", end_stream)
                .finish(),
            Frame::Direct { end_stream, .. } => {
                f.debug_struct("Direct").field("end_stream", end_stream).finish()
            }
            Frame::EndOfStream => write!(f, "EndOfStream"),
            Frame::Reset { status } => f.debug_struct("Reset").field("code", &status.code).finish(),
        }
    }
}

/// A frame bound to the stream it belongs to, as delivered by
/// `Transport::incoming_frames()` and as routed by the multiplexer (§3:
/// "Every frame carries its stream ID").
#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub stream_id: StreamId,
    pub frame: Frame,
}

impl TransportMessage {
    pub fn new(stream_id: StreamId, frame: Frame) -> Self {
        TransportMessage { stream_id, frame }
    }
}
