//! Per-request state carried through the pipeline

use bytes::Bytes;
use http::request::Parts;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const ID_WIDTH: usize = 4;

/// Short base-36 identifier used to correlate log lines of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(String);

impl RequestId {
    /// Render `n` in base 36, keeping the last four digits, zero padded
    pub fn from_sequence(n: u64) -> Self {
        const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

        let mut out = [b'0'; ID_WIDTH];
        let mut rest = n;
        for slot in out.iter_mut().rev() {
            *slot = DIGITS[(rest % 36) as usize];
            rest /= 36;
        }
        Self(String::from_utf8_lossy(&out).into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonic source of request ids, starting at 1
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    counter: AtomicU64,
}

impl RequestIdGenerator {
    pub fn next_id(&self) -> RequestId {
        RequestId::from_sequence(self.counter.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Terminal failure of a request, sent to the client as JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorRecord {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// The inbound request once it has been recorded
#[derive(Debug)]
pub struct RequestContext {
    pub id: RequestId,
    pub head: Parts,
    /// Buffered body, only for requests that carry one
    pub body: Option<Bytes>,
}

impl RequestContext {
    /// Origin-form target of the inbound request
    pub fn path(&self) -> &str {
        self.head
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_format() {
        assert_eq!(RequestId::from_sequence(1).as_str(), "0001");
        assert_eq!(RequestId::from_sequence(35).as_str(), "000z");
        assert_eq!(RequestId::from_sequence(36).as_str(), "0010");
        assert_eq!(RequestId::from_sequence(36u64.pow(4) - 1).as_str(), "zzzz");
        // Wraps to the last four digits
        assert_eq!(RequestId::from_sequence(36u64.pow(4)).as_str(), "0000");
    }

    #[test]
    fn test_request_ids_are_sequential() {
        let ids = RequestIdGenerator::default();
        assert_eq!(ids.next_id().to_string(), "0001");
        assert_eq!(ids.next_id().to_string(), "0002");
    }

    #[test]
    fn test_error_record_json() {
        let record = ErrorRecord::new(502, "host header NOT present");
        assert_eq!(
            serde_json::to_string(&record).unwrap(),
            r#"{"code":502,"message":"host header NOT present"}"#
        );

        let record = ErrorRecord::new(502, "host to ip resolve error").with_detail("boom");
        assert_eq!(
            serde_json::to_string(&record).unwrap(),
            r#"{"code":502,"message":"host to ip resolve error","detail":"boom"}"#
        );
    }
}
