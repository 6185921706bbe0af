//! Per-request upstream gateway routing
//!
//! Runs on the host engine's dispatch path right before a request is sent, so
//! it only reads a settings snapshot, formats one string and sets one flag.

use crate::classifier::is_secure;
use crate::metrics::Metrics;
use crate::session::{Exchange, PendingRequest, OVERRIDE_GATEWAY_FLAG};
use crate::settings::{ProxySettings, SettingsStore};
use std::sync::Arc;

/// `host:port`, with IPv6 literals bracketed (`[::1]:80`).
pub fn format_gateway(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Gateway a request should be sent through under `settings`, if any.
pub fn gateway_for<E: Exchange + ?Sized>(
    settings: Option<&ProxySettings>,
    request: &E,
) -> Option<String> {
    let settings = settings?;
    if !settings.uses_gateway() {
        return None;
    }
    if is_secure(request) && !settings.apply_on_secure {
        return None;
    }
    Some(format_gateway(&settings.host, settings.port))
}

pub struct UpstreamRouter {
    settings: Arc<SettingsStore>,
    metrics: Arc<Metrics>,
}

impl UpstreamRouter {
    pub fn new(settings: Arc<SettingsStore>, metrics: Arc<Metrics>) -> Self {
        Self { settings, metrics }
    }

    /// Attaches the gateway override to `request` when the current settings
    /// call for it. Returns the gateway that was set.
    pub fn route<'r>(&self, request: &'r mut PendingRequest) -> Option<&'r str> {
        let settings = self.settings.load();
        let gateway = gateway_for(settings.as_deref(), &*request)?;

        tracing::trace!(session_id = %request.id, gateway = %gateway, "Routing through upstream gateway");
        request.set_flag(OVERRIDE_GATEWAY_FLAG, gateway);
        self.metrics.record_gateway_override();
        request.gateway_override()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;

    fn router(settings: Option<ProxySettings>) -> UpstreamRouter {
        UpstreamRouter::new(
            Arc::new(SettingsStore::new(settings)),
            Arc::new(Metrics::new()),
        )
    }

    fn request(url: &str) -> PendingRequest {
        PendingRequest::new(SessionId(1), "GET", url)
    }

    #[test]
    fn test_format_gateway() {
        assert_eq!(format_gateway("::1", 80), "[::1]:80");
        assert_eq!(format_gateway("1.2.3.4", 80), "1.2.3.4:80");
    }

    #[test]
    fn test_no_settings_leaves_request_untouched() {
        let mut req = request("http://host/x");
        assert!(router(None).route(&mut req).is_none());
        assert!(req.flags.is_empty());
    }

    #[test]
    fn test_disabled_or_empty_host_leaves_request_untouched() {
        let mut disabled = ProxySettings::new("proxy", 8080);
        disabled.enabled = false;

        for settings in [disabled, ProxySettings::new("", 8080)] {
            let mut req = request("http://host/x");
            assert!(router(Some(settings)).route(&mut req).is_none());
            assert!(req.gateway_override().is_none());
        }
    }

    #[test]
    fn test_secure_request_needs_apply_on_secure() {
        let mut req = request("https://host/x");
        assert!(router(Some(ProxySettings::new("proxy", 8080)))
            .route(&mut req)
            .is_none());
        assert!(req.flags.is_empty());

        let mut req = request("https://host/x");
        let router = router(Some(
            ProxySettings::new("proxy", 8080).with_apply_on_secure(true),
        ));
        assert_eq!(router.route(&mut req), Some("proxy:8080"));
        assert_eq!(req.gateway_override(), Some("proxy:8080"));
    }

    #[test]
    fn test_plain_request_routed() {
        let router = router(Some(ProxySettings::new("::1", 80)));
        let mut req = request("http://host/kcsapi/api_port/port");
        assert_eq!(router.route(&mut req), Some("[::1]:80"));
        assert_eq!(req.gateway_override(), Some("[::1]:80"));
        assert_eq!(router.metrics.gateway_overrides_total.get(), 1);
    }

    #[test]
    fn test_repeated_routing_is_stable() {
        let router = router(Some(ProxySettings::new("1.2.3.4", 80)));
        let mut first = request("http://host/x");
        let mut second = request("http://host/x");
        assert_eq!(router.route(&mut first), Some("1.2.3.4:80"));
        assert_eq!(router.route(&mut second), Some("1.2.3.4:80"));
        assert_eq!(first.flags, second.flags);
    }

    #[test]
    fn test_settings_change_applies_to_next_request() {
        let store = Arc::new(SettingsStore::new(Some(ProxySettings::new("a", 1))));
        let router = UpstreamRouter::new(store.clone(), Arc::new(Metrics::new()));

        assert_eq!(router.route(&mut request("http://h/")), Some("a:1"));
        store.store(ProxySettings::new("b", 2));
        assert_eq!(router.route(&mut request("http://h/")), Some("b:2"));
        store.clear();
        assert!(router.route(&mut request("http://h/")).is_none());
    }
}
