//! Runner HTTP client.

use std::time::Duration;

use log::{debug, info, warn};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::error::{RunnerError, RunnerResult};
use crate::agui::{Event, RunAgentInput};

/// Runner endpoint inside the cluster.
pub const DEFAULT_URL_TEMPLATE: &str = "http://session-{session}.{project}.svc.cluster.local:8001/";

/// Runner connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Base URL with `{project}` and `{session}` placeholders.
    pub url_template: String,
    /// Shared secret sent as a bearer token to the runner.
    pub proxy_secret: Option<String>,
    /// Connect attempts for a run before giving up.
    pub connect_attempts: u32,
    /// Delay between connect attempts.
    pub retry_backoff_ms: u64,
    pub connect_timeout_secs: u64,
    /// Timeout for the short control calls (interrupt, feedback, ...).
    pub request_timeout_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            url_template: DEFAULT_URL_TEMPLATE.to_string(),
            proxy_secret: None,
            connect_attempts: 2,
            retry_backoff_ms: 1000,
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

/// Client for one runner per session.
#[derive(Debug, Clone)]
pub struct RunnerClient {
    client: Client,
    config: RunnerConfig,
}

impl RunnerClient {
    pub fn new(config: RunnerConfig) -> RunnerResult<Self> {
        // No overall timeout: run streams last as long as the run.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs.max(1)))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Base URL of the session's runner, always ending in `/`.
    pub fn endpoint(&self, project: &str, session: &str) -> String {
        let mut url = self
            .config
            .url_template
            .replace("{project}", project)
            .replace("{session}", session);
        if !url.ends_with('/') {
            url.push('/');
        }
        url
    }

    fn url(&self, project: &str, session: &str, path: &str) -> String {
        format!(
            "{}{}",
            self.endpoint(project, session),
            path.trim_start_matches('/')
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.config.proxy_secret.as_deref().filter(|s| !s.is_empty()) {
            Some(secret) => request.header(AUTHORIZATION, format!("Bearer {}", secret)),
            None => request,
        }
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs.max(1))
    }

    /// Start a run and return the streaming response.
    ///
    /// Connect failures are retried with a fixed backoff; host-resolution
    /// failures fail immediately. A non-success status is an error.
    pub async fn run(
        &self,
        project: &str,
        session: &str,
        input: &RunAgentInput,
    ) -> RunnerResult<Response> {
        let url = self.endpoint(project, session);
        let attempts = self.config.connect_attempts.max(1);
        let backoff = Duration::from_millis(self.config.retry_backoff_ms);

        let mut attempt = 1;
        let response = loop {
            let request = self
                .client
                .post(&url)
                .header(ACCEPT, "text/event-stream")
                .header(CONTENT_TYPE, "application/json")
                .json(input);

            match self.authorize(request).send().await {
                Ok(response) => break response,
                Err(err) => match RunnerError::from_transport(&url, err) {
                    RunnerError::Unavailable { message, .. } if attempt < attempts => {
                        warn!(
                            "Runner for session {} not reachable (attempt {}/{}), retrying in {:?}: {}",
                            session, attempt, attempts, backoff, message
                        );
                        attempt += 1;
                        tokio::time::sleep(backoff).await;
                    }
                    RunnerError::Unavailable { url, message, .. } => {
                        return Err(RunnerError::Unavailable {
                            url,
                            message,
                            attempts: attempt,
                        });
                    }
                    other => return Err(other),
                },
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(RunnerError::Status {
                status: status.as_u16(),
            });
        }
        info!("Runner stream opened for session {} ({})", session, url);
        Ok(response)
    }

    /// Forward an interrupt request.
    pub async fn interrupt(&self, project: &str, session: &str, body: &Value) -> RunnerResult<()> {
        let url = self.url(project, session, "interrupt");
        let request = self
            .client
            .post(&url)
            .timeout(self.request_timeout())
            .json(body);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| RunnerError::from_transport(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RunnerError::Status {
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    /// Forward a feedback META event.
    ///
    /// Returns the RAW event the runner answered with, or `None` when the
    /// response body is not an event.
    pub async fn feedback(
        &self,
        project: &str,
        session: &str,
        event: &Event,
    ) -> RunnerResult<Option<Event>> {
        let url = self.url(project, session, "feedback");
        let request = self
            .client
            .post(&url)
            .timeout(self.request_timeout())
            .json(event);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| RunnerError::from_transport(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RunnerError::Status {
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| RunnerError::from_transport(&url, e))?;
        match Event::from_slice(&body) {
            Ok(event) => Ok(Some(event)),
            Err(err) => {
                debug!("Runner feedback response is not an event: {}", err);
                Ok(None)
            }
        }
    }

    /// Runner capabilities, or safe defaults when the runner cannot answer.
    pub async fn capabilities(&self, project: &str, session: &str) -> Value {
        self.get_json_or(project, session, "capabilities", default_capabilities())
            .await
    }

    /// MCP server status, or an empty list when the runner cannot answer.
    pub async fn mcp_status(&self, project: &str, session: &str) -> Value {
        self.get_json_or(project, session, "mcp/status", default_mcp_status())
            .await
    }

    async fn get_json_or(&self, project: &str, session: &str, path: &str, fallback: Value) -> Value {
        let url = self.url(project, session, path);
        let request = self.client.get(&url).timeout(self.request_timeout());
        let response = match self.authorize(request).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!("Runner {} returned {}, using defaults", url, response.status());
                return fallback;
            }
            Err(err) => {
                debug!("Runner {} unavailable, using defaults: {}", url, err);
                return fallback;
            }
        };

        match response.json::<Value>().await {
            Ok(value) => value,
            Err(err) => {
                debug!("Runner {} returned invalid JSON, using defaults: {}", url, err);
                fallback
            }
        }
    }
}

pub fn default_capabilities() -> Value {
    json!({
        "framework": "unknown",
        "agent_features": [],
        "platform_features": [],
        "file_system": false,
        "mcp": false
    })
}

pub fn default_mcp_status() -> Value {
    json!({
        "servers": [],
        "totalCount": 0
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(template: &str) -> RunnerClient {
        RunnerClient::new(RunnerConfig {
            url_template: template.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_endpoint_from_default_template() {
        let client = RunnerClient::new(RunnerConfig::default()).unwrap();
        assert_eq!(
            client.endpoint("proj", "s1"),
            "http://session-s1.proj.svc.cluster.local:8001/"
        );
    }

    #[test]
    fn test_endpoint_adds_trailing_slash() {
        let client = client("http://127.0.0.1:9000/{project}/{session}");
        assert_eq!(client.endpoint("p", "s"), "http://127.0.0.1:9000/p/s/");
        assert_eq!(
            client.url("p", "s", "/mcp/status"),
            "http://127.0.0.1:9000/p/s/mcp/status"
        );
    }

    #[tokio::test]
    async fn test_capabilities_default_when_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = client(&format!("http://127.0.0.1:{}/", port));
        assert_eq!(client.capabilities("p", "s").await, default_capabilities());
        assert_eq!(client.mcp_status("p", "s").await, default_mcp_status());
    }

    fn refused_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{}/", port)
    }

    #[tokio::test]
    async fn test_run_refused_retries_once_after_backoff() {
        let client = RunnerClient::new(RunnerConfig {
            url_template: refused_url(),
            retry_backoff_ms: 200,
            ..Default::default()
        })
        .unwrap();
        let started = std::time::Instant::now();
        let err = client
            .run("p", "s", &RunAgentInput::default())
            .await
            .unwrap_err();

        assert!(
            matches!(err, RunnerError::Unavailable { attempts: 2, .. }),
            "{err:?}"
        );
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_run_attempts_follow_config() {
        let client = RunnerClient::new(RunnerConfig {
            url_template: refused_url(),
            connect_attempts: 1,
            retry_backoff_ms: 5_000,
            ..Default::default()
        })
        .unwrap();
        let started = std::time::Instant::now();
        let err = client
            .run("p", "s", &RunAgentInput::default())
            .await
            .unwrap_err();

        assert!(
            matches!(err, RunnerError::Unavailable { attempts: 1, .. }),
            "{err:?}"
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_unresolvable_host_fails_fast() {
        let client = RunnerClient::new(RunnerConfig {
            url_template: "http://session-{session}.{project}.invalid:8001/".to_string(),
            retry_backoff_ms: 60_000,
            ..Default::default()
        })
        .unwrap();
        let started = std::time::Instant::now();
        let err = client
            .run("p", "s", &RunAgentInput::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Unresolvable { .. }), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(30));
    }
}
