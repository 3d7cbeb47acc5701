//! Boundary policy for guarded requests.

use sha2::{Digest, Sha256};
use tb_config::IdempotencySettings;

pub const HEADER_NAME: &str = "Idempotency-Key";

pub const MSG_BLANK_KEY: &str = "Missing Idempotency-Key header.";
pub const MSG_TOO_LARGE: &str = "Request payload is too large for idempotency.";
pub const MSG_CONFLICT: &str = "Idempotency key was used with a different request.";
pub const MSG_IN_PROGRESS: &str = "Request is already in progress.";
pub const MSG_FAILED: &str = "Idempotency handling failed.";

/// Fingerprint of a request: uppercase hex SHA-256 of
/// `"{method}\n{path}{?query}\n{body}"`.
pub fn request_hash(method: &str, path: &str, query: Option<&str>, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        hasher.update(b"?");
        hasher.update(query.as_bytes());
    }
    hasher.update(b"\n");
    hasher.update(body);
    hex::encode_upper(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyHeader<'a> {
    /// No header; request passes through unguarded
    Missing,
    /// Header present but blank; rejected with 400
    Blank,
    Present(&'a str),
}

impl<'a> KeyHeader<'a> {
    pub fn parse(value: Option<&'a str>) -> Self {
        match value.map(str::trim) {
            None => Self::Missing,
            Some("") => Self::Blank,
            Some(key) => Self::Present(key),
        }
    }
}

/// What to do with the stored key once the handler has responded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseDisposition {
    Complete(String),
    Remove(&'static str),
}

#[derive(Debug, Clone)]
pub struct GuardPolicy {
    pub enabled: bool,
    pub max_body_bytes: usize,
    pub max_response_bytes: usize,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self::from(&IdempotencySettings::default())
    }
}

impl From<&IdempotencySettings> for GuardPolicy {
    fn from(settings: &IdempotencySettings) -> Self {
        Self {
            enabled: settings.enabled,
            max_body_bytes: settings.max_body_bytes,
            max_response_bytes: settings.max_response_bytes,
        }
    }
}

impl GuardPolicy {
    /// Only mutating methods are guarded.
    pub fn applies_to(&self, method: &str) -> bool {
        self.enabled && matches!(method, "POST" | "PUT" | "PATCH" | "DELETE")
    }

    /// Read limit for request bodies. Zero means unbounded.
    pub fn body_limit(&self) -> usize {
        limit_or_unbounded(self.max_body_bytes)
    }

    pub fn declared_length_too_large(&self, content_length: Option<u64>) -> bool {
        match content_length {
            Some(len) => len > self.body_limit() as u64,
            None => false,
        }
    }

    /// Only 2xx UTF-8 responses within the size bound are recorded.
    pub fn disposition(&self, status: u16, body: &[u8]) -> ResponseDisposition {
        if !(200..300).contains(&status) {
            return ResponseDisposition::Remove("unsuccessful response");
        }
        if body.len() > limit_or_unbounded(self.max_response_bytes) {
            return ResponseDisposition::Remove("response exceeds max size");
        }
        match std::str::from_utf8(body) {
            Ok(text) => ResponseDisposition::Complete(text.to_string()),
            Err(_) => ResponseDisposition::Remove("response body is not UTF-8"),
        }
    }
}

fn limit_or_unbounded(limit: usize) -> usize {
    if limit == 0 {
        usize::MAX
    } else {
        limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_hash_is_stable_and_sensitive() {
        let a = request_hash("POST", "/api/notes", Some("draft=1"), br#"{"t":1}"#);
        assert_eq!(a.len(), 64);
        assert_eq!(a, a.to_uppercase());
        assert_eq!(a, request_hash("POST", "/api/notes", Some("draft=1"), br#"{"t":1}"#));

        assert_ne!(a, request_hash("PUT", "/api/notes", Some("draft=1"), br#"{"t":1}"#));
        assert_ne!(a, request_hash("POST", "/api/notes", None, br#"{"t":1}"#));
        assert_ne!(a, request_hash("POST", "/api/notes", Some("draft=1"), br#"{"t":2}"#));
    }

    #[test]
    fn test_request_hash_matches_known_digest() {
        assert_eq!(
            request_hash("POST", "/api/notes", Some("draft=1"), br#"{"t":1}"#),
            "56836221129A0D560E7A671A464310B650F7930F3E2844EABE322BD2BCB8810F"
        );
        assert_eq!(request_hash("GET", "/", None, b""), request_hash("GET", "/", Some(""), b""));
    }

    #[test]
    fn test_key_header_parsing() {
        assert_eq!(KeyHeader::parse(None), KeyHeader::Missing);
        assert_eq!(KeyHeader::parse(Some("   ")), KeyHeader::Blank);
        assert_eq!(KeyHeader::parse(Some(" abc ")), KeyHeader::Present("abc"));
    }

    #[test]
    fn test_policy_methods() {
        let policy = GuardPolicy::default();
        for method in ["POST", "PUT", "PATCH", "DELETE"] {
            assert!(policy.applies_to(method));
        }
        assert!(!policy.applies_to("GET"));

        let disabled = GuardPolicy {
            enabled: false,
            ..GuardPolicy::default()
        };
        assert!(!disabled.applies_to("POST"));
    }

    #[test]
    fn test_disposition() {
        let policy = GuardPolicy {
            enabled: true,
            max_body_bytes: 10,
            max_response_bytes: 4,
        };

        assert_eq!(policy.disposition(201, b"ok"), ResponseDisposition::Complete("ok".to_string()));
        assert!(matches!(policy.disposition(500, b"ok"), ResponseDisposition::Remove(_)));
        assert!(matches!(policy.disposition(200, b"too long"), ResponseDisposition::Remove(_)));
        assert!(matches!(policy.disposition(200, &[0xff, 0xfe]), ResponseDisposition::Remove(_)));

        assert!(policy.declared_length_too_large(Some(11)));
        assert!(!policy.declared_length_too_large(Some(10)));
        assert!(!policy.declared_length_too_large(None));
    }
}
