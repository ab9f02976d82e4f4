use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::CliConfig;
use crate::plugin::Bundle;

pub struct ApiClient {
    http: reqwest::Client,
    base: String,
    config: CliConfig,
}

impl ApiClient {
    pub fn new(config: &CliConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: config.api_url.clone(),
            config: config.clone(),
        }
    }

    fn token(&self) -> Result<&str> {
        self.config.require_token()
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder, what: &str) -> Result<T> {
        let response = request
            .send()
            .await
            .with_context(|| format!("cannot reach {}", self.base))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            return Err(anyhow!("{} failed ({}): {}", what, status, message.trim()));
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("decoding {} response", what))
    }

    pub async fn generate(&self, description: &str) -> Result<GeneratedPlugin> {
        let request = self
            .http
            .post(format!("{}/v1/plugins/generate", self.base))
            .bearer_auth(self.token()?)
            .json(&json!({ "description": description }));
        self.send(request, "generate").await
    }

    pub async fn deploy(&self, bundle: &Bundle, deploy_token: &str) -> Result<Deployment> {
        let request = self
            .http
            .post(format!("{}/v1/plugins/deploy", self.base))
            .bearer_auth(deploy_token)
            .json(bundle);
        self.send(request, "deploy").await
    }

    pub async fn logs(&self, plugin_id: &str, since: Option<DateTime<Utc>>, limit: usize) -> Result<Vec<LogEntry>> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(since) = since {
            query.push(("since", since.to_rfc3339()));
        }
        let request = self
            .http
            .get(format!("{}/v1/plugins/{}/logs", self.base, plugin_id))
            .bearer_auth(self.token()?)
            .query(&query);
        let page: LogsResponse = self.send(request, "logs").await?;
        Ok(page.logs)
    }

    pub async fn priorities(&self) -> Result<Vec<Priority>> {
        let request = self
            .http
            .get(format!("{}/v1/priorities", self.base))
            .bearer_auth(self.token()?);
        let page: PrioritiesResponse = self.send(request, "priority list").await?;
        Ok(page.priorities)
    }

    pub async fn create_priority(&self, title: &str, parent_id: Option<&str>) -> Result<Priority> {
        let request = self
            .http
            .post(format!("{}/v1/priorities", self.base))
            .bearer_auth(self.token()?)
            .json(&json!({ "title": title, "parentId": parent_id }));
        self.send(request, "priority create").await
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedPlugin {
    pub name: String,
    pub files: Vec<GeneratedFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
struct LogsResponse {
    #[serde(default)]
    logs: Vec<LogEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct PrioritiesResponse {
    #[serde(default)]
    priorities: Vec<Priority>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Priority {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub parent_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client(server: &mockito::Server, token: Option<&str>) -> ApiClient {
        ApiClient::new(&CliConfig {
            api_url: server.url(),
            token: token.map(str::to_string),
            deploy_token: None,
        })
    }

    #[tokio::test]
    async fn test_create_priority_sends_parent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/priorities")
            .match_header("authorization", "Bearer tok")
            .match_body(Matcher::PartialJson(json!({ "title": "Launch", "parentId": "p1" })))
            .with_body(r#"{"id": "p2", "title": "Launch", "parentId": "p1"}"#)
            .create_async()
            .await;

        let priority = client(&server, Some("tok"))
            .create_priority("Launch", Some("p1"))
            .await
            .unwrap();
        assert_eq!(priority.parent_id.as_deref(), Some("p1"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_body_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/priorities")
            .with_status(403)
            .with_body(r#"{"error": "token expired"}"#)
            .create_async()
            .await;

        let err = client(&server, Some("tok")).priorities().await.unwrap_err();
        assert!(err.to_string().contains("token expired"), "{}", err);
    }

    #[tokio::test]
    async fn test_missing_token_fails_before_request() {
        let server = mockito::Server::new_async().await;
        let err = client(&server, None).priorities().await.unwrap_err();
        assert!(err.to_string().contains("PLOT_API_TOKEN"));
    }

    #[tokio::test]
    async fn test_logs_passes_since() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/plugins/plg_1/logs")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("limit".into(), "10".into()),
                Matcher::UrlEncoded("since".into(), "2026-01-02T03:04:05+00:00".into()),
            ]))
            .with_body(r#"{"logs": [{"timestamp": "2026-01-02T03:04:06Z", "level": "info", "message": "sync started"}]}"#)
            .create_async()
            .await;

        let since = "2026-01-02T03:04:05Z".parse::<DateTime<Utc>>().unwrap();
        let logs = client(&server, Some("tok")).logs("plg_1", Some(since), 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "sync started");
    }
}
