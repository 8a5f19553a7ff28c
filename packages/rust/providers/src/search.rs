//! Search-engine client used for record enrichment.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use fieldforge_shared::{FieldforgeError, Result, SearchConfig, resolve_api_key};

/// Returns raw result text for a query.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, query: &str) -> Result<String>;
}

/// Client for Serper-style search APIs (`POST {"q": ...}` with an API key header).
pub struct SerperClient {
    endpoint: String,
    api_key: String,
    http: reqwest::Client,
}

impl SerperClient {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("Fieldforge/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| FieldforgeError::Network(format!("client build: {e}")))?;

        Ok(Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            http,
        })
    }

    /// Build from the `[search]` config section, reading the key from the environment.
    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        Self::new(&config.endpoint, resolve_api_key(&config.api_key_env)?)
    }
}

#[async_trait]
impl SearchClient for SerperClient {
    async fn search(&self, query: &str) -> Result<String> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("X-API-KEY", &self.api_key)
            .json(&json!({ "q": query }))
            .send()
            .await
            .map_err(|e| FieldforgeError::Network(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FieldforgeError::Network(format!(
                "{}: HTTP {status}",
                self.endpoint
            )));
        }

        response
            .text()
            .await
            .map_err(|e| FieldforgeError::Network(format!("{}: {e}", self.endpoint)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn posts_query_with_key() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/search"))
            .and(header("X-API-KEY", "secret"))
            .and(body_json(json!({"q": "rust pipelines"})))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"organic": []}"#))
            .mount(&server)
            .await;

        let client = SerperClient::new(format!("{}/search", server.uri()), "secret").unwrap();
        let text = client.search("rust pipelines").await.unwrap();
        assert_eq!(text, r#"{"organic": []}"#);
    }

    #[tokio::test]
    async fn http_failure_is_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = SerperClient::new(server.uri(), "secret").unwrap();
        let err = client.search("q").await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }
}
