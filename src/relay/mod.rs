//! Stats relay
//!
//! Observes the API session stream and forwards a redacted copy of
//! whitelisted sessions to the external statistics collector. Uploads are
//! spawned onto the runtime and never awaited; their failures are logged and
//! counted here and go no further. The relay never filters or blocks the
//! stream it observes.

pub mod collector;
pub mod redact;

pub use collector::{HttpCollector, RelayPayload, StatsCollector};
pub use redact::{redact_tokens, redact_url};

use crate::metrics::Metrics;
use crate::session::{Session, SharedSession};
use crate::settings::RelayToggles;
use crate::stream::{Multicast, Subscription};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;

/// Client identifier sent with every upload.
pub const DEFAULT_AGENT: &str = "LZXNXVGPejgSnEXLH2ur";

pub const DEFAULT_ENDPOINT: &str = "http://api.kancolle-db.net/2/";

const DEFAULT_WHITELIST: &[&str] = &[
    "api_port/port",
    "api_get_member/kdock",
    "api_get_member/ship2",
    "api_get_member/ship3",
    "api_req_hensei/change",
    "api_req_kousyou/createship",
    "api_req_kousyou/getship",
    "api_req_kousyou/createitem",
    "api_req_map/start",
    "api_req_map/next",
    "api_req_sortie/battle",
    "api_req_battle_midnight/battle",
    "api_req_battle_midnight/sp_midnight",
    "api_req_sortie/night_to_day",
    "api_req_sortie/battleresult",
    "api_req_practice/battle",
    "api_req_practice/battle_result",
    "api_req_combined_battle/battle",
    "api_req_combined_battle/airbattle",
    "api_req_combined_battle/midnight_battle",
    "api_req_combined_battle/battleresult",
];

/// Ordered API path fragments eligible for relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointWhitelist {
    entries: Vec<String>,
}

impl EndpointWhitelist {
    pub fn new(entries: Vec<String>) -> Self {
        Self { entries }
    }

    pub fn default_entries() -> Vec<String> {
        DEFAULT_WHITELIST.iter().map(|s| s.to_string()).collect()
    }

    /// First entry, in whitelist order, found in `url`.
    pub fn first_match(&self, url: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| url.contains(entry.as_str()))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for EndpointWhitelist {
    fn default() -> Self {
        Self::new(Self::default_entries())
    }
}

pub struct StatsRelay {
    whitelist: EndpointWhitelist,
    agent: String,
    toggles: Arc<RelayToggles>,
    collector: Arc<dyn StatsCollector>,
    metrics: Arc<Metrics>,
    runtime: Handle,
}

impl StatsRelay {
    pub fn new(
        whitelist: EndpointWhitelist,
        agent: impl Into<String>,
        toggles: Arc<RelayToggles>,
        collector: Arc<dyn StatsCollector>,
        metrics: Arc<Metrics>,
        runtime: Handle,
    ) -> Self {
        Self {
            whitelist,
            agent: agent.into(),
            toggles,
            collector,
            metrics,
            runtime,
        }
    }

    /// Observes every session delivered on `stream`.
    #[must_use = "dropping the subscription detaches the relay"]
    pub fn attach(self: &Arc<Self>, stream: &Multicast<SharedSession>) -> Subscription {
        let relay = self.clone();
        stream.subscribe(move |session: &SharedSession| {
            relay.observe(session);
        })
    }

    /// Builds the payload for `session` when relaying is on and its URL hits
    /// the whitelist. At most one payload per session.
    pub fn payload_for(&self, session: &Session) -> Option<RelayPayload> {
        let access_key = self.toggles.active_key()?;
        self.whitelist.first_match(&session.full_url)?;

        Some(RelayPayload {
            token: access_key.as_str().to_owned(),
            agent: self.agent.clone(),
            url: redact_url(&session.full_url).into_owned(),
            request_body: redact_tokens(&session.request_body_text()).into_owned(),
            response_body: session.response_body_text().into_owned(),
        })
    }

    /// Dispatches an upload for `session` if it qualifies. Returns whether an
    /// upload was started; its outcome is never reported back.
    pub fn observe(&self, session: &Session) -> bool {
        let Some(payload) = self.payload_for(session) else {
            return false;
        };

        tracing::debug!(session_id = %session.id, url = %payload.url, "Relaying session to stats collector");
        self.metrics.record_relay_dispatch();

        let collector = self.collector.clone();
        let metrics = self.metrics.clone();
        let session_id = session.id;
        self.runtime.spawn(async move {
            let started = Instant::now();
            let result = collector.upload(payload).await;
            metrics.record_relay_outcome(started.elapsed(), result.is_ok());
            match result {
                Ok(()) => {
                    tracing::debug!(session_id = %session_id, "Stats upload completed");
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Stats upload failed");
                }
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::collector::MockStatsCollector;
    use super::*;
    use crate::error::RelayError;
    use crate::session::SessionId;
    use tokio::sync::mpsc;

    fn api_session(url: &str, body: &str) -> Session {
        Session::new(SessionId(1), "POST", url)
            .with_request_body(body.to_string())
            .with_response("text/plain", "svdata={\"api_result\":1}")
    }

    fn relay_with(
        collector: MockStatsCollector,
        toggles: RelayToggles,
        whitelist: EndpointWhitelist,
    ) -> StatsRelay {
        StatsRelay::new(
            whitelist,
            DEFAULT_AGENT,
            Arc::new(toggles),
            Arc::new(collector),
            Arc::new(Metrics::new()),
            Handle::current(),
        )
    }

    #[test]
    fn test_first_match_respects_order() {
        let whitelist = EndpointWhitelist::new(vec!["api_req_sortie/battle".into(), "battle".into()]);
        assert_eq!(
            whitelist.first_match("http://h/kcsapi/api_req_sortie/battleresult"),
            Some("api_req_sortie/battle")
        );
        assert_eq!(whitelist.first_match("http://h/kcsapi/api_req_practice/battle"), Some("battle"));
        assert_eq!(whitelist.first_match("http://h/kcsapi/api_start2"), None);
    }

    #[test]
    fn test_default_whitelist() {
        let whitelist = EndpointWhitelist::default();
        assert_eq!(whitelist.len(), 21);
        assert!(whitelist.first_match("http://h/kcsapi/api_port/port").is_some());
    }

    #[tokio::test]
    async fn test_disabled_relay_never_uploads() {
        for toggles in [
            RelayToggles::new(false, Some("key".into())),
            RelayToggles::new(true, Some(String::new())),
            RelayToggles::new(true, None),
        ] {
            let mut collector = MockStatsCollector::new();
            collector.expect_upload().never();
            let relay = relay_with(collector, toggles, EndpointWhitelist::default());

            assert!(!relay.observe(&api_session("http://h/kcsapi/api_port/port", "api_verno=1")));
        }
    }

    #[tokio::test]
    async fn test_unlisted_endpoint_is_not_relayed() {
        let mut collector = MockStatsCollector::new();
        collector.expect_upload().never();
        let relay = relay_with(
            collector,
            RelayToggles::new(true, Some("key".into())),
            EndpointWhitelist::default(),
        );

        assert!(!relay.observe(&api_session("http://h/kcsapi/api_start2", "")));
    }

    #[tokio::test]
    async fn test_payload_is_redacted() {
        let relay = relay_with(
            MockStatsCollector::new(),
            RelayToggles::new(true, Some("access".into())),
            EndpointWhitelist::default(),
        );

        let payload = relay
            .payload_for(&api_session(
                "http://h/kcsapi/api_port/port",
                "api%5Ftoken=0a1b2c&api%5Fverno=1&api%5Fport=123",
            ))
            .unwrap();

        assert_eq!(payload.token, "access");
        assert_eq!(payload.agent, DEFAULT_AGENT);
        assert_eq!(payload.url, "http://h/kcsapi/api_port/port");
        assert_eq!(payload.request_body, "api%5Fverno=1&api%5Fport=123");
        assert_eq!(payload.response_body, "svdata={\"api_result\":1}");
    }

    #[tokio::test]
    async fn test_token_in_url_query_is_redacted() {
        let relay = relay_with(
            MockStatsCollector::new(),
            RelayToggles::new(true, Some("access".into())),
            EndpointWhitelist::default(),
        );

        let payload = relay
            .payload_for(&api_session(
                "http://h/kcsapi/api_port/port?api_token=deadbeef&api_verno=1",
                "api_verno=1",
            ))
            .unwrap();

        assert!(!redact::contains_token(&payload.url));
        assert!(!payload.url.contains("deadbeef"));
        assert_eq!(payload.url, "http://h/kcsapi/api_port/port?api_verno=1");
    }

    #[tokio::test]
    async fn test_multiple_fragments_upload_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut collector = MockStatsCollector::new();
        collector.expect_upload().times(1).returning(move |payload| {
            let _ = tx.send(payload);
            Ok(())
        });
        let relay = relay_with(
            collector,
            RelayToggles::new(true, Some("key".into())),
            EndpointWhitelist::default(),
        );

        // matches api_req_sortie/battle and api_req_sortie/battleresult
        let session = api_session("http://h/kcsapi/api_req_sortie/battleresult", "api_token=ff");
        assert!(relay.observe(&session));

        let payload = rx.recv().await.unwrap();
        assert_eq!(payload.request_body, "");
        assert!(rx.try_recv().is_err());
        assert_eq!(relay.metrics.relay_dispatched_total.get(), 1);
    }

    #[tokio::test]
    async fn test_upload_failure_is_swallowed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut collector = MockStatsCollector::new();
        collector.expect_upload().times(2).returning(move |_| {
            let _ = tx.send(());
            Err(RelayError::Status(503))
        });
        let relay = relay_with(
            collector,
            RelayToggles::new(true, Some("key".into())),
            EndpointWhitelist::default(),
        );

        assert!(relay.observe(&api_session("http://h/kcsapi/api_port/port", "")));
        assert!(relay.observe(&api_session("http://h/kcsapi/api_get_member/kdock", "")));

        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        // the outcome is recorded after upload returns
        for _ in 0..100 {
            if relay.metrics.relay_failed_total.get() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(relay.metrics.relay_failed_total.get(), 2);
    }
}
