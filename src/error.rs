//! Error types for muxrpc-core.

use crate::status::StatusCode;
use thiserror::Error;

/// Result type alias for muxrpc-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy (§7). Local programming faults panic rather than
/// surfacing here (see `mux::Multiplexer::send_payload` and friends);
/// everything in this enum is a value an async caller can legitimately
/// observe and recover from.
#[derive(Debug, Error)]
pub enum Error {
    /// `(service, method)` not found in the registry at dispatch time.
    #[error("method not found: {0}")]
    Unimplemented(String),

    /// Duplicate `(service, method)` registration, or any other
    /// registration-time misconfiguration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A handler returned, or the runtime synthesised, a non-OK terminal
    /// status.
    #[error("{0}")]
    Status(crate::status::Status),

    /// The transport reported a connection failure (§7 class 4). Carries
    /// `StatusCode::Unavailable` implicitly; callers that need the status
    /// object should go through `Error::into_status`.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// A codec's `encode`/`decode` failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The remote peer violated the wire protocol (§7 class 2): unexpected
    /// frame order, payload after trailer, more than one response on a
    /// unary call, etc.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The call was cancelled, locally or via deadline expiry.
    #[error("call cancelled")]
    Cancelled,

    /// The call's deadline elapsed before completion.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// I/O failure from a concrete transport implementation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map this error onto the wire status it would produce in trailing
    /// metadata, per the propagation policy in §7.
    pub fn to_status(&self) -> crate::status::Status {
        use crate::status::Status;
        match self {
            Error::Unimplemented(msg) => Status::new(StatusCode::Unimplemented, msg.clone()),
            Error::Config(msg) => Status::new(StatusCode::Internal, msg.clone()),
            Error::Status(status) => status.clone(),
            Error::Unavailable(msg) => Status::new(StatusCode::Unavailable, msg.clone()),
            Error::Codec(msg) => Status::new(StatusCode::Internal, msg.clone()),
            Error::Protocol(msg) => Status::new(StatusCode::Internal, msg.clone()),
            Error::Cancelled => Status::new(StatusCode::Cancelled, "call cancelled"),
            Error::DeadlineExceeded => Status::new(StatusCode::DeadlineExceeded, "deadline exceeded"),
            Error::Io(e) => Status::new(StatusCode::Unavailable, e.to_string()),
        }
    }
}

impl From<crate::status::Status> for Error {
    fn from(status: crate::status::Status) -> Self {
        match status.code {
            StatusCode::Ok => Error::Status(status),
            StatusCode::Cancelled => Error::Cancelled,
            StatusCode::DeadlineExceeded => Error::DeadlineExceeded,
            StatusCode::Unimplemented => {
                Error::Unimplemented(status.message.unwrap_or_default())
            }
            StatusCode::Unavailable => Error::Unavailable(status.message.unwrap_or_default()),
            _ => Error::Status(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unimplemented_maps_to_unimplemented_status() {
        let err = Error::Unimplemented("Nope/Nope".into());
        let status = err.to_status();
        assert_eq!(status.code, StatusCode::Unimplemented);
    }

    #[test]
    fn cancelled_round_trips() {
        let status = crate::status::Status::new(StatusCode::Cancelled, "dropped");
        let err: Error = status.into();
        assert!(matches!(err, Error::Cancelled));
    }
}
