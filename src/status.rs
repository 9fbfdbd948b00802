//! gRPC-style status codes carried in trailing metadata.

use std::fmt;

/// Terminal status code for a call, carried as `grpc-status` in trailing
/// metadata (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl StatusCode {
    /// Whether this status represents a successful terminal call.
    pub fn is_ok(self) -> bool {
        matches!(self, StatusCode::Ok)
    }

    /// Numeric wire value, as carried in `grpc-status`.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Parse a numeric `grpc-status` value, defaulting unknown codes to
    /// `Unknown` rather than failing — a responder on a newer version of
    /// this crate may emit a code this one doesn't recognise yet.
    pub fn from_code(code: u16) -> StatusCode {
        match code {
            0 => StatusCode::Ok,
            1 => StatusCode::Cancelled,
            2 => StatusCode::Unknown,
            3 => StatusCode::InvalidArgument,
            4 => StatusCode::DeadlineExceeded,
            5 => StatusCode::NotFound,
            6 => StatusCode::AlreadyExists,
            7 => StatusCode::PermissionDenied,
            8 => StatusCode::ResourceExhausted,
            9 => StatusCode::FailedPrecondition,
            10 => StatusCode::Aborted,
            11 => StatusCode::OutOfRange,
            12 => StatusCode::Unimplemented,
            13 => StatusCode::Internal,
            14 => StatusCode::Unavailable,
            15 => StatusCode::DataLoss,
            16 => StatusCode::Unauthenticated,
            _ => StatusCode::Unknown,
        }
    }

    /// Symbolic name, as used in diagnostics and in `grpc-message`-adjacent
    /// logging (mirrors `WorkerStatus::as_str` in the teacher's
    /// `model_worker::protocol`).
    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::DataLoss => "DATA_LOSS",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.as_str(), self.code())
    }
}

/// A terminal status: code plus an optional human-readable message,
/// travelling together as `(grpc-status, grpc-message)` in trailing
/// metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub message: Option<String>,
}

impl Status {
    pub fn ok() -> Self {
        Status { code: StatusCode::Ok, message: None }
    }

    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Status { code, message: Some(message.into()) }
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {}", self.code, msg),
            None => write!(f, "{}", self.code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_numeric_code() {
        for code in 0..=16u16 {
            let status = StatusCode::from_code(code);
            assert_eq!(status.code(), code);
        }
    }

    #[test]
    fn unknown_numeric_code_defaults_to_unknown() {
        assert_eq!(StatusCode::from_code(999), StatusCode::Unknown);
    }

    #[test]
    fn ok_status_has_no_required_message() {
        let status = Status::ok();
        assert!(status.is_ok());
        assert_eq!(status.message, None);
    }
}
