//! HTTP/JSON client for the remote job service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::remote::{RemoteJobClient, RemotePayload, RunReport};
use crate::error::{CodeloopError, Result};
use crate::registry::CodeRef;

/// Connection settings for [`HttpJobClient`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpJobConfig {
    /// Service root, e.g. `https://jobs.internal/api`
    pub base_url: String,
    /// Environment variable holding a bearer token
    pub token_env: Option<String>,
    /// Per-request timeout
    pub request_timeout_ms: u64,
}

impl Default for HttpJobConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            token_env: None,
            request_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    run_id: String,
}

/// Remote job client speaking JSON over HTTP
///
/// - `POST {base}/runs/submit` with `{"code_ref": ..}` returns `{"run_id": ..}`
/// - `GET {base}/runs/{run_id}` returns a [`RunReport`]
/// - `GET {base}/results/{result_ref}` returns a [`RemotePayload`]
#[derive(Debug, Clone)]
pub struct HttpJobClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpJobClient {
    pub fn new(config: &HttpJobConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| CodeloopError::Backend(format!("Failed to create HTTP client: {}", e)))?;

        let token = match &config.token_env {
            Some(var) => Some(
                std::env::var(var).map_err(|_| CodeloopError::Config(format!("{} not set", var)))?,
            ),
            None => None,
        };

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|e| CodeloopError::Backend(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CodeloopError::Backend(format!("Job service error {}: {}", status, body)));
        }

        response
            .json()
            .await
            .map_err(|e| CodeloopError::Backend(format!("Failed to parse response: {}", e)))
    }
}

#[async_trait]
impl RemoteJobClient for HttpJobClient {
    async fn submit(&self, code: &CodeRef) -> Result<String> {
        let body = json!({
            "code_ref": code,
            "code_sha256": code.digest(),
        });
        let response: SubmitResponse = self
            .send(self.client.post(self.url("runs/submit")).json(&body))
            .await?;
        Ok(response.run_id)
    }

    async fn poll(&self, run_id: &str) -> Result<RunReport> {
        self.send(self.client.get(self.url(&format!("runs/{}", run_id))))
            .await
    }

    async fn fetch_result(&self, result_ref: &str) -> Result<RemotePayload> {
        self.send(self.client.get(self.url(&format!("results/{}", result_ref))))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building_trims_slashes() {
        let config = HttpJobConfig {
            base_url: "https://jobs.example/api/".to_string(),
            ..Default::default()
        };
        let client = HttpJobClient::new(&config).unwrap();
        assert_eq!(client.url("runs/submit"), "https://jobs.example/api/runs/submit");
        assert_eq!(client.url("/runs/abc"), "https://jobs.example/api/runs/abc");
    }

    #[test]
    fn test_missing_token_env_is_config_error() {
        let config = HttpJobConfig {
            token_env: Some("CODELOOP_TEST_TOKEN_THAT_IS_NOT_SET".to_string()),
            ..Default::default()
        };
        assert!(matches!(HttpJobClient::new(&config), Err(CodeloopError::Config(_))));
    }

    #[test]
    fn test_config_defaults_from_yaml() {
        let config: HttpJobConfig = serde_yaml::from_str("base_url: http://jobs:9000").unwrap();
        assert_eq!(config.base_url, "http://jobs:9000");
        assert_eq!(config.request_timeout_ms, 30_000);
        assert!(config.token_env.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_service_is_backend_error() {
        let config = HttpJobConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            request_timeout_ms: 500,
            ..Default::default()
        };
        let client = HttpJobClient::new(&config).unwrap();
        assert!(matches!(client.poll("run-1").await, Err(CodeloopError::Backend(_))));
    }
}
