//! Runtime settings written by the hosting application
//!
//! Values here change while traffic flows. Readers load a snapshot per
//! decision and never cache it; writers swap the whole value, so a change
//! applies from the next request on.

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Upstream gateway configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub enabled: bool,
    /// Also route TLS-secured requests through the gateway.
    #[serde(default)]
    pub apply_on_secure: bool,
}

impl ProxySettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            enabled: true,
            apply_on_secure: false,
        }
    }

    pub fn with_apply_on_secure(mut self, apply_on_secure: bool) -> Self {
        self.apply_on_secure = apply_on_secure;
        self
    }

    /// True when requests should go through the gateway at all.
    pub fn uses_gateway(&self) -> bool {
        !self.host.is_empty() && self.enabled
    }
}

/// Lock-free, versioned holder for the current [`ProxySettings`]
#[derive(Default)]
pub struct SettingsStore {
    current: ArcSwapOption<ProxySettings>,
    version: AtomicU64,
}

impl SettingsStore {
    pub fn new(initial: Option<ProxySettings>) -> Self {
        let store = Self::default();
        if let Some(settings) = initial {
            store.store(settings);
        }
        store
    }

    /// Replaces the settings and returns the new version.
    pub fn store(&self, settings: ProxySettings) -> u64 {
        self.current.store(Some(Arc::new(settings)));
        self.bump()
    }

    pub fn clear(&self) -> u64 {
        self.current.store(None);
        self.bump()
    }

    pub fn load(&self) -> Option<Arc<ProxySettings>> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn bump(&self) -> u64 {
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(version, "Upstream settings updated");
        version
    }
}

/// Stats relay switches: the send toggle and the collector access key
#[derive(Default)]
pub struct RelayToggles {
    send: AtomicBool,
    access_key: ArcSwapOption<String>,
}

impl RelayToggles {
    pub fn new(send: bool, access_key: Option<String>) -> Self {
        let toggles = Self::default();
        toggles.set_send(send);
        toggles.set_access_key(access_key);
        toggles
    }

    pub fn set_send(&self, send: bool) {
        self.send.store(send, Ordering::Release);
    }

    pub fn send(&self) -> bool {
        self.send.load(Ordering::Acquire)
    }

    pub fn set_access_key(&self, key: Option<String>) {
        self.access_key.store(key.map(Arc::new));
    }

    pub fn access_key(&self) -> Option<Arc<String>> {
        self.access_key.load_full()
    }

    /// The key to relay with, if relaying is on and a non-empty key is set.
    pub fn active_key(&self) -> Option<Arc<String>> {
        if !self.send() {
            return None;
        }
        self.access_key().filter(|key| !key.is_empty())
    }
}
