//! Game-API session filter
//!
//! Derives a second multicast stream from the session source that only
//! carries API calls: path under the API prefix *and* an exact response MIME
//! type match. The derived stream has its own connect/disconnect lifecycle.

use crate::config::ApiFilterConfig;
use crate::metrics::Metrics;
use crate::session::{Session, SharedSession};
use crate::stream::{Connection, Multicast, Subscription};
use std::sync::Arc;

/// Two-part API predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRule {
    pub path_prefix: String,
    pub mime_type: String,
}

impl ApiRule {
    pub fn new(path_prefix: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn matches(&self, session: &Session) -> bool {
        session.path_and_query.starts_with(&self.path_prefix)
            && session.response_mime_type == self.mime_type
    }
}

impl From<&ApiFilterConfig> for ApiRule {
    fn from(config: &ApiFilterConfig) -> Self {
        Self::new(config.path_prefix.clone(), config.mime_type.clone())
    }
}

pub struct ApiFilter {
    rule: Arc<ApiRule>,
    output: Multicast<SharedSession>,
    _upstream: Subscription,
}

impl ApiFilter {
    /// Subscribes to `source`; matching sessions are republished on
    /// [`ApiFilter::stream`] once it is connected.
    pub fn attach(source: &Multicast<SharedSession>, rule: ApiRule, metrics: Arc<Metrics>) -> Self {
        let rule = Arc::new(rule);
        let output = Multicast::new("api-sessions");

        let predicate = rule.clone();
        let sink = output.clone();
        let upstream = source.subscribe(move |session: &SharedSession| {
            if !predicate.matches(session) {
                return;
            }
            tracing::debug!(
                session_id = %session.id,
                method = %session.method,
                url = %session.full_url,
                request_bytes = session.request_body.len(),
                response_bytes = session.response_body.len(),
                "API session"
            );
            if sink.publish(session.clone()) {
                metrics.record_api_session();
            }
        });

        Self {
            rule,
            output,
            _upstream: upstream,
        }
    }

    pub fn rule(&self) -> &ApiRule {
        &self.rule
    }

    pub fn stream(&self) -> &Multicast<SharedSession> {
        &self.output
    }

    #[must_use = "dropping the connection disconnects the stream"]
    pub fn connect(&self) -> Connection {
        self.output.connect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;
    use parking_lot::Mutex;

    fn session(id: u64, url: &str, content_type: &str) -> SharedSession {
        Session::new(SessionId(id), "POST", url)
            .with_response(content_type, "svdata={}")
            .into_shared()
    }

    fn kcsapi_rule() -> ApiRule {
        ApiRule::new("/kcsapi", "text/plain")
    }

    #[test]
    fn test_rule_requires_both_conditions() {
        let rule = kcsapi_rule();
        assert!(rule.matches(&session(1, "http://h/kcsapi/api_port/port", "text/plain")));
        assert!(!rule.matches(&session(2, "http://h/kcsapi/api_port/port", "application/json")));
        assert!(!rule.matches(&session(3, "http://h/kcs/image.png", "text/plain")));
        assert!(!rule.matches(&session(4, "http://h/other/kcsapi", "text/plain")));
    }

    #[test]
    fn test_mime_parameters_are_ignored() {
        let rule = kcsapi_rule();
        assert!(rule.matches(&session(1, "http://h/kcsapi/x", "text/plain; charset=UTF-8")));
    }

    #[test]
    fn test_filter_preserves_order_and_drops_non_api() {
        let source = Multicast::new("sessions");
        let filter = ApiFilter::attach(&source, kcsapi_rule(), Arc::new(Metrics::new()));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = filter
            .stream()
            .subscribe(move |s: &SharedSession| sink.lock().push(s.id.0));

        let _source_conn = source.connect();
        let _api_conn = filter.connect();

        source.publish(session(1, "http://h/kcsapi/a", "text/plain"));
        source.publish(session(2, "http://h/kcs/b.swf", "application/x-shockwave-flash"));
        source.publish(session(3, "http://h/kcsapi/c", "text/plain"));
        source.publish(session(4, "http://h/kcsapi/d", "text/html"));
        source.publish(session(5, "http://h/kcsapi/e", "text/plain"));

        assert_eq!(*seen.lock(), vec![1, 3, 5]);
    }

    #[test]
    fn test_filter_stream_needs_its_own_connect() {
        let source = Multicast::new("sessions");
        let metrics = Arc::new(Metrics::new());
        let filter = ApiFilter::attach(&source, kcsapi_rule(), metrics.clone());

        let seen = Arc::new(Mutex::new(0usize));
        let sink = seen.clone();
        let _sub = filter
            .stream()
            .subscribe(move |_: &SharedSession| *sink.lock() += 1);

        let _source_conn = source.connect();
        source.publish(session(1, "http://h/kcsapi/a", "text/plain"));
        assert_eq!(*seen.lock(), 0);

        let _api_conn = filter.connect();
        source.publish(session(2, "http://h/kcsapi/a", "text/plain"));
        assert_eq!(*seen.lock(), 1);
        assert_eq!(metrics.api_sessions_total.get(), 1);
    }
}
