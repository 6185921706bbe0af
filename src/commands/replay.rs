//! Replays recorded sessions through the full pipeline
//!
//! Input is newline-delimited JSON, one exchange per line:
//!
//! ```json
//! {"method":"POST","url":"http://host/kcsapi/api_port/port","requestBody":"api_verno=1","contentType":"text/plain","responseBody":"svdata={}"}
//! ```

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::host::LocalEngine;
use crate::lifecycle::SessionProxy;
use crate::session::{PendingRequest, Session};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Handle;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedSession {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub https: bool,
    #[serde(default)]
    pub request_body: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub response_body: String,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub sessions: usize,
    pub api_sessions: usize,
    pub rerouted: usize,
    pub skipped_lines: usize,
}

/// Feeds one recorded exchange through the engine hooks.
pub fn replay_one(engine: &LocalEngine, recorded: RecordedSession) -> Result<Option<String>> {
    let mut request = PendingRequest::new(engine.next_session_id(), recorded.method, recorded.url)
        .with_https(recorded.https);
    engine.send_request(&mut request)?;
    let gateway = request.gateway_override().map(str::to_string);

    let session = Session::complete(request)
        .with_request_body(recorded.request_body)
        .with_response(&recorded.content_type, recorded.response_body);
    engine.complete_session(session)?;

    Ok(gateway)
}

pub async fn run_replay(config: Config, input: &Path, print_metrics: bool) -> Result<ReplaySummary> {
    let engine = Arc::new(LocalEngine::new());
    let proxy = Arc::new(SessionProxy::from_config(&config, engine.clone(), Handle::current())?);

    let mut api_events = proxy.api_sessions().subscribe_stream();
    let printer = tokio::spawn(async move {
        let mut count = 0usize;
        while let Some(session) = api_events.next().await {
            count += 1;
            println!("api {} {} {}", session.id, session.method, session.path_and_query);
        }
        count
    });

    // startup may run the system proxy command
    let starter = proxy.clone();
    tokio::task::spawn_blocking(move || starter.startup())
        .await
        .map_err(|e| ProxyError::InvalidSession(format!("startup task failed: {e}")))??;

    let file = tokio::fs::File::open(input).await?;
    let mut lines = BufReader::new(file).lines();
    let mut summary = ReplaySummary::default();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let recorded: RecordedSession = match serde_json::from_str(line) {
            Ok(recorded) => recorded,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed session line");
                summary.skipped_lines += 1;
                continue;
            }
        };

        let url = recorded.url.clone();
        let gateway = replay_one(&engine, recorded)?;
        summary.sessions += 1;
        match gateway {
            Some(gateway) => {
                summary.rerouted += 1;
                println!("session {} via {}", url, gateway);
            }
            None => println!("session {} direct", url),
        }
    }

    proxy.shutdown();
    summary.api_sessions = printer
        .await
        .map_err(|e| ProxyError::InvalidSession(format!("printer task failed: {e}")))?;

    wait_for_uploads(&proxy, config.relay_timeout()).await;

    if print_metrics {
        print!("{}", proxy.metrics().gather_text());
    }

    tracing::info!(
        sessions = summary.sessions,
        api_sessions = summary.api_sessions,
        rerouted = summary.rerouted,
        skipped = summary.skipped_lines,
        "Replay finished"
    );
    Ok(summary)
}

/// Gives dispatched uploads up to `limit` to finish before the process exits.
async fn wait_for_uploads(proxy: &SessionProxy, limit: Duration) {
    let in_flight = &proxy.metrics().relay_in_flight;
    let waited = tokio::time::timeout(limit, async {
        while in_flight.get() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    if waited.is_err() {
        tracing::warn!(pending = in_flight.get(), "Stats uploads still pending at exit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ProxySettings;
    use std::io::Write;

    #[test]
    fn test_recorded_session_defaults() {
        let recorded: RecordedSession =
            serde_json::from_str(r#"{"url":"http://h/kcsapi/api_port/port"}"#).unwrap();
        assert_eq!(recorded.method, "GET");
        assert!(!recorded.https);
        assert!(recorded.request_body.is_empty());
    }

    #[tokio::test]
    async fn test_replay_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"method":"POST","url":"http://h/kcsapi/api_port/port","requestBody":"api_token=ab","contentType":"text/plain","responseBody":"svdata={{}}"}}"#
        )
        .unwrap();
        writeln!(file, r#"{{"url":"https://h/index.html","contentType":"text/html"}}"#).unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"url":"http://h/kcsapi/api_start2","contentType":"text/plain; charset=UTF-8"}}"#
        )
        .unwrap();

        let config = Config {
            upstream: Some(ProxySettings::new("gw", 8080)),
            ..Config::default()
        };

        let summary = run_replay(config, file.path(), false).await.unwrap();
        assert_eq!(
            summary,
            ReplaySummary {
                sessions: 3,
                api_sessions: 2,
                rerouted: 2,
                skipped_lines: 1,
            }
        );
    }
}
