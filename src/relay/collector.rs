use crate::error::RelayError;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Form body posted to the collector. Lives for one upload attempt only.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct RelayPayload {
    /// Collector access key
    pub token: String,
    /// Fixed client identifier
    pub agent: String,
    pub url: String,
    #[serde(rename = "requestbody")]
    pub request_body: String,
    #[serde(rename = "responsebody")]
    pub response_body: String,
}

impl fmt::Debug for RelayPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayPayload")
            .field("token", &"[REDACTED]")
            .field("agent", &self.agent)
            .field("url", &self.url)
            .field("request_body", &self.request_body)
            .field("response_body_len", &self.response_body.len())
            .finish()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatsCollector: Send + Sync + 'static {
    async fn upload(&self, payload: RelayPayload) -> Result<(), RelayError>;
}

/// Posts payloads as `application/x-www-form-urlencoded`.
pub struct HttpCollector {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCollector {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| RelayError::Transport(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl StatsCollector for HttpCollector {
    async fn upload(&self, payload: RelayPayload) -> Result<(), RelayError> {
        let response = self
            .client
            .post(&self.endpoint)
            .form(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Status(status.as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> RelayPayload {
        RelayPayload {
            token: "secret-key".to_string(),
            agent: "agent".to_string(),
            url: "http://h/kcsapi/api_port/port".to_string(),
            request_body: "api_verno=1".to_string(),
            response_body: "svdata={}".to_string(),
        }
    }

    #[test]
    fn test_debug_hides_access_key() {
        let rendered = format!("{:?}", payload());
        assert!(!rendered.contains("secret-key"));
        assert!(rendered.contains("api_port/port"));
    }

    #[test]
    fn test_form_field_names() {
        let json = serde_json::to_value(payload()).unwrap();
        let object = json.as_object().unwrap();
        let mut keys: Vec<_> = object.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["agent", "requestbody", "responsebody", "token", "url"]);
    }

    #[tokio::test]
    async fn test_unreachable_collector_returns_error() {
        let collector =
            HttpCollector::new("http://127.0.0.1:9/", Duration::from_millis(500)).unwrap();
        assert!(collector.upload(payload()).await.is_err());
    }
}
