//! Metadata header lists and the well-known entries the wire model reserves
//! (§3, §4.1, §6).

use std::time::Duration;

/// Well-known, case-insensitive header name carrying the `/service/method`
/// path on a client-initiated stream's initial metadata.
pub const PATH: &str = ":path";
/// Content-type header, pass-through but well-known.
pub const CONTENT_TYPE: &str = "content-type";
/// Numeric terminal status, required on trailing metadata.
pub const GRPC_STATUS: &str = "grpc-status";
/// Human-readable status detail, present when `grpc-status` is non-OK.
pub const GRPC_MESSAGE: &str = "grpc-message";
/// Deadline header, `grpc-timeout`-style (§5).
pub const GRPC_TIMEOUT: &str = "grpc-timeout";

const WELL_KNOWN: &[&str] = &[PATH, CONTENT_TYPE, GRPC_STATUS, GRPC_MESSAGE, GRPC_TIMEOUT];

fn is_well_known(name: &str) -> bool {
    WELL_KNOWN.iter().any(|wk| wk.eq_ignore_ascii_case(name))
}

/// An ordered list of `(name, value)` header pairs (§3). Names are
/// case-insensitive for the well-known entries above and case-preserving
/// otherwise, matching §3's rule precisely: lookups normalise a well-known
/// name before comparing, but iteration and `-bin` binary values are
/// returned exactly as inserted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Metadata { entries: Vec::new() }
    }

    /// Append a header pair, preserving insertion order (§3: "ordered").
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    /// First value for `name`, matching case-insensitively when `name` is
    /// one of the well-known entries and case-sensitively otherwise.
    pub fn get(&self, name: &str) -> Option<&str> {
        let well_known = is_well_known(name);
        self.entries
            .iter()
            .find(|(n, _)| if well_known { n.eq_ignore_ascii_case(name) } else { n == name })
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Convenience constructor for the initial metadata of a client-initiated
    /// stream: a single `:path` entry (§4.1: "MUST include `:path =
    /// /<service>/<method>`").
    pub fn for_method_path(service: &str, method: &str) -> Self {
        Metadata::new().with(PATH, format!("/{service}/{method}"))
    }

    /// Append a `grpc-timeout` entry carrying `deadline` as whole
    /// milliseconds (§4.1, §5: "Deadlines are expressed as headers
    /// (`grpc-timeout`-style)").
    pub fn push_deadline(&mut self, deadline: Duration) {
        self.push(GRPC_TIMEOUT, format!("{}m", deadline.as_millis()));
    }

    /// Parse the `grpc-timeout` entry back into a [`Duration`], if present.
    pub fn deadline(&self) -> Option<Duration> {
        let raw = self.get(GRPC_TIMEOUT)?;
        let millis: u64 = raw.strip_suffix('m')?.parse().ok()?;
        Some(Duration::from_millis(millis))
    }

    /// Parse `(service, method)` from this metadata's `:path` entry, if
    /// present. Used by the responder dispatcher (§4.5).
    pub fn method_path(&self) -> Option<(String, String)> {
        let path = self.get(PATH)?;
        let trimmed = path.strip_prefix('/')?;
        let (service, method) = trimmed.split_once('/')?;
        Some((service.to_string(), method.to_string()))
    }

    /// Convenience constructor for trailing metadata carrying a terminal
    /// status (§4.1: trailer MUST include `grpc-status`, SHOULD include
    /// `grpc-message` when non-OK).
    pub fn for_status(status: &crate::status::Status) -> Self {
        let mut md = Metadata::new().with(GRPC_STATUS, status.code.code().to_string());
        if let Some(msg) = &status.message {
            if !status.is_ok() {
                md.push(GRPC_MESSAGE, msg.clone());
            }
        }
        md
    }

    /// Parse a terminal status out of trailing metadata, if `grpc-status` is
    /// present.
    pub fn status(&self) -> Option<crate::status::Status> {
        let code = self.get(GRPC_STATUS)?.parse::<u16>().ok()?;
        let message = self.get(GRPC_MESSAGE).map(|s| s.to_string());
        Some(crate::status::Status {
            code: crate::status::StatusCode::from_code(code),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{Status, StatusCode};

    #[test]
    fn method_path_round_trips() {
        let md = Metadata::for_method_path("Echo", "Say");
        assert_eq!(md.method_path(), Some(("Echo".to_string(), "Say".to_string())));
    }

    #[test]
    fn well_known_lookup_is_case_insensitive() {
        let md = Metadata::new().with("Content-Type", "application/grpc");
        assert_eq!(md.get("content-type"), Some("application/grpc"));
    }

    #[test]
    fn other_headers_are_case_preserving() {
        let md = Metadata::new().with("X-Custom", "v");
        assert_eq!(md.get("x-custom"), None);
        assert_eq!(md.get("X-Custom"), Some("v"));
    }

    #[test]
    fn status_round_trips_through_trailer() {
        let status = Status::new(StatusCode::NotFound, "no such widget");
        let md = Metadata::for_status(&status);
        assert_eq!(md.status(), Some(status));
    }

    #[test]
    fn ok_status_omits_message() {
        let md = Metadata::for_status(&Status::ok());
        assert_eq!(md.get(GRPC_MESSAGE), None);
    }

    #[test]
    fn deadline_round_trips() {
        let mut md = Metadata::new();
        md.push_deadline(std::time::Duration::from_millis(2500));
        assert_eq!(md.deadline(), Some(std::time::Duration::from_millis(2500)));
    }

    #[test]
    fn missing_deadline_is_none() {
        assert_eq!(Metadata::new().deadline(), None);
    }
}
