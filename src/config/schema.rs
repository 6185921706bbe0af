use crate::relay::{EndpointWhitelist, DEFAULT_AGENT, DEFAULT_ENDPOINT};
use crate::settings::ProxySettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Upstream gateway; absent means requests are never rerouted.
    #[serde(default)]
    pub upstream: Option<ProxySettings>,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub api_filter: ApiFilterConfig,
    #[serde(default)]
    pub system_proxy: SystemProxyConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default = "default_relay_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_relay_agent")]
    pub agent: String,
    #[serde(default = "default_relay_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "EndpointWhitelist::default_entries")]
    pub whitelist: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiFilterConfig {
    #[serde(default = "default_api_prefix")]
    pub path_prefix: String,
    #[serde(default = "default_api_mime_type")]
    pub mime_type: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SystemProxyConfig {
    /// Command that applies the OS proxy; `{address}` in `args` is replaced
    /// with `localhost:<listen_port>`.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

// Default value functions
fn default_listen_port() -> u16 {
    37564
}

fn default_relay_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_relay_agent() -> String {
    DEFAULT_AGENT.to_string()
}

fn default_relay_timeout() -> u64 {
    10000
}

fn default_api_prefix() -> String {
    "/kcsapi".to_string()
}

fn default_api_mime_type() -> String {
    "text/plain".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            upstream: None,
            relay: RelayConfig::default(),
            api_filter: ApiFilterConfig::default(),
            system_proxy: SystemProxyConfig::default(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            access_key: None,
            endpoint: default_relay_endpoint(),
            agent: default_relay_agent(),
            timeout_ms: default_relay_timeout(),
            whitelist: EndpointWhitelist::default_entries(),
        }
    }
}

impl Default for ApiFilterConfig {
    fn default() -> Self {
        Self {
            path_prefix: default_api_prefix(),
            mime_type: default_api_mime_type(),
        }
    }
}

impl Config {
    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay.timeout_ms)
    }

    pub fn whitelist(&self) -> EndpointWhitelist {
        EndpointWhitelist::new(self.relay.whitelist.clone())
    }

    /// Address handed to the OS proxy configuration.
    pub fn system_proxy_address(&self) -> String {
        format!("localhost:{}", self.listen_port)
    }
}
