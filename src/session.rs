//! Intercepted exchanges as seen by the tap
//!
//! The host engine hands us one exchange at two points in its life: a
//! [`PendingRequest`] just before it is sent upstream (the only point where we
//! may attach flags) and a [`Session`] once the response has completed. Both
//! views carry the same [`SessionId`].

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Flag consumed by the host engine to send a request through another proxy.
pub const OVERRIDE_GATEWAY_FLAG: &str = "X-OverrideGateway";

/// Completed sessions are shared between every subscriber of a stream.
pub type SharedSession = Arc<Session>;

/// Per-request correlation id assigned by the host engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Metadata shared by both views of an exchange.
pub trait Exchange {
    fn full_url(&self) -> &str;

    /// Whether the host engine itself classified the connection as HTTPS.
    fn is_https(&self) -> bool;
}

/// Pre-send view of an exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub id: SessionId,
    pub method: String,
    pub full_url: String,
    pub is_https: bool,
    pub flags: HashMap<Cow<'static, str>, String>,
}

impl PendingRequest {
    pub fn new(id: SessionId, method: impl Into<String>, full_url: impl Into<String>) -> Self {
        Self {
            id,
            method: method.into(),
            full_url: full_url.into(),
            is_https: false,
            flags: HashMap::new(),
        }
    }

    pub fn with_https(mut self, is_https: bool) -> Self {
        self.is_https = is_https;
        self
    }

    pub fn set_flag(&mut self, key: impl Into<Cow<'static, str>>, value: impl Into<String>) {
        self.flags.insert(key.into(), value.into());
    }

    pub fn flag(&self, key: &str) -> Option<&str> {
        self.flags.get(key).map(String::as_str)
    }

    /// Gateway the host engine should route this request through, if any.
    pub fn gateway_override(&self) -> Option<&str> {
        self.flag(OVERRIDE_GATEWAY_FLAG)
    }
}

impl Exchange for PendingRequest {
    fn full_url(&self) -> &str {
        &self.full_url
    }

    fn is_https(&self) -> bool {
        self.is_https
    }
}

/// Completed, read-only view of an exchange
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub completed_at: DateTime<Utc>,
    pub method: String,
    pub full_url: String,
    pub path_and_query: String,
    pub is_https: bool,
    /// Response content type without parameters (`text/plain`, not
    /// `text/plain; charset=UTF-8`).
    pub response_mime_type: String,
    pub request_body: Bytes,
    pub response_body: Bytes,
    pub flags: HashMap<Cow<'static, str>, String>,
}

impl Session {
    pub fn new(id: SessionId, method: impl Into<String>, full_url: impl Into<String>) -> Self {
        let full_url = full_url.into();
        Self {
            id,
            completed_at: Utc::now(),
            method: method.into(),
            path_and_query: path_and_query_of(&full_url),
            full_url,
            is_https: false,
            response_mime_type: String::new(),
            request_body: Bytes::new(),
            response_body: Bytes::new(),
            flags: HashMap::new(),
        }
    }

    /// Builds the completed view from the request the engine dispatched,
    /// carrying over any flags attached before send.
    pub fn complete(request: PendingRequest) -> Self {
        let mut session = Self::new(request.id, request.method, request.full_url);
        session.is_https = request.is_https;
        session.flags = request.flags;
        session
    }

    pub fn with_https(mut self, is_https: bool) -> Self {
        self.is_https = is_https;
        self
    }

    pub fn with_request_body(mut self, body: impl Into<Bytes>) -> Self {
        self.request_body = body.into();
        self
    }

    /// Sets the response, deriving the MIME type from a `Content-Type` value.
    pub fn with_response(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.response_mime_type = mime_type_of(content_type).to_string();
        self.response_body = body.into();
        self
    }

    pub fn request_body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.request_body)
    }

    pub fn response_body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.response_body)
    }

    pub fn flag(&self, key: &str) -> Option<&str> {
        self.flags.get(key).map(String::as_str)
    }

    pub fn into_shared(self) -> SharedSession {
        Arc::new(self)
    }
}

impl Exchange for Session {
    fn full_url(&self) -> &str {
        &self.full_url
    }

    fn is_https(&self) -> bool {
        self.is_https
    }
}

/// Strips parameters from a `Content-Type` header value.
pub fn mime_type_of(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
}

/// Path plus query of an absolute URL; falls back to the text after the
/// authority when the URL does not parse.
pub fn path_and_query_of(full_url: &str) -> String {
    if let Ok(parsed) = url::Url::parse(full_url) {
        if parsed.cannot_be_a_base() {
            return full_url.to_string();
        }
        return match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        };
    }

    let after_scheme = full_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(full_url);
    match after_scheme.find('/') {
        Some(index) => after_scheme[index..].to_string(),
        None => "/".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_and_query_from_url() {
        assert_eq!(
            path_and_query_of("http://203.104.209.71/kcsapi/api_port/port?x=1"),
            "/kcsapi/api_port/port?x=1"
        );
        assert_eq!(path_and_query_of("https://example.com"), "/");
        assert_eq!(path_and_query_of("example.com/kcsapi/a"), "/kcsapi/a");
    }

    #[test]
    fn test_mime_type_strips_parameters() {
        assert_eq!(mime_type_of("text/plain; charset=UTF-8"), "text/plain");
        assert_eq!(mime_type_of("text/plain"), "text/plain");
        assert_eq!(mime_type_of(""), "");
    }

    #[test]
    fn test_complete_carries_flags() {
        let mut request = PendingRequest::new(SessionId(7), "POST", "http://host/kcsapi/x")
            .with_https(true);
        request.set_flag(OVERRIDE_GATEWAY_FLAG, "10.0.0.1:8080");

        let session = Session::complete(request);
        assert_eq!(session.id, SessionId(7));
        assert!(session.is_https);
        assert_eq!(session.path_and_query, "/kcsapi/x");
        assert_eq!(session.flag(OVERRIDE_GATEWAY_FLAG), Some("10.0.0.1:8080"));
    }
}
