//! Per-call request context: who is asking and from where.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const FINGERPRINT_HEX_LEN: usize = 16;

/// Source address and device fingerprint supplied with every call.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestContext {
    origin: String,
    fingerprint: String,
}

impl RequestContext {
    #[must_use]
    pub fn new(origin: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            fingerprint: fingerprint.into(),
        }
    }

    /// Build a context from the raw client-identifying headers.
    #[must_use]
    pub fn from_client(
        origin: impl Into<String>,
        user_agent: Option<&str>,
        accept_language: Option<&str>,
        accept_encoding: Option<&str>,
    ) -> Self {
        Self::new(
            origin,
            device_fingerprint(
                user_agent.unwrap_or_default(),
                accept_language.unwrap_or_default(),
                accept_encoding.unwrap_or_default(),
            ),
        )
    }

    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// The binding a session created from this context is tied to.
    #[must_use]
    pub fn binding(&self) -> SessionBinding {
        SessionBinding {
            origin: self.origin.clone(),
            fingerprint: self.fingerprint.clone(),
        }
    }
}

impl fmt::Display for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.origin, self.fingerprint)
    }
}

/// Source address plus device fingerprint a session is pinned to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBinding {
    pub origin: String,
    pub fingerprint: String,
}

/// Stable short hash over the headers that identify a client.
///
/// SHA-256 of `User-Agent|Accept-Language|Accept-Encoding`, truncated to the
/// first 16 hex characters.
#[must_use]
pub fn device_fingerprint(user_agent: &str, accept_language: &str, accept_encoding: &str) -> String {
    let digest = Sha256::digest(format!("{user_agent}|{accept_language}|{accept_encoding}"));
    let mut encoded = hex::encode(digest);
    encoded.truncate(FINGERPRINT_HEX_LEN);
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = device_fingerprint("Mozilla/5.0", "en-US", "gzip");
        let b = device_fingerprint("Mozilla/5.0", "en-US", "gzip");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_changes_with_any_header() {
        let base = device_fingerprint("Mozilla/5.0", "en-US", "gzip");
        assert_ne!(base, device_fingerprint("curl/8.0", "en-US", "gzip"));
        assert_ne!(base, device_fingerprint("Mozilla/5.0", "de-DE", "gzip"));
        assert_ne!(base, device_fingerprint("Mozilla/5.0", "en-US", "br"));
    }

    #[test]
    fn missing_headers_hash_as_empty() {
        let ctx = RequestContext::from_client("10.0.0.1", None, None, None);
        assert_eq!(ctx.fingerprint(), device_fingerprint("", "", ""));
        assert_eq!(ctx.origin(), "10.0.0.1");
        assert_eq!(ctx.binding().origin, "10.0.0.1");
    }
}
