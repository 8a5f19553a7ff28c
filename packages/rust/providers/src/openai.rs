//! Chat-completions client for OpenAI-compatible HTTP APIs.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use fieldforge_shared::{FieldforgeError, Result};

use crate::llm::{ChatMessage, Completion, CompletionRequest, LlmClient};

/// Maximum number of response-body characters quoted in error messages.
const ERROR_BODY_PREVIEW: usize = 300;

/// Client for any endpoint speaking the `/chat/completions` protocol.
pub struct OpenAiCompatibleClient {
    name: String,
    endpoint: String,
    api_key: String,
    http: reqwest::Client,
}

impl OpenAiCompatibleClient {
    /// `base_url` is the API root, e.g. `https://api.openai.com/v1`.
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        api_key: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("Fieldforge/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| FieldforgeError::Network(format!("client build: {e}")))?;

        Ok(Self {
            name: name.into(),
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            http,
        })
    }
}

fn preview(text: &str) -> String {
    text.chars().take(ERROR_BODY_PREVIEW).collect()
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(flatten)]
    args: &'a Map<String, Value>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let body = ChatRequest {
            model: &request.model,
            messages: &request.messages,
            response_format: request.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
            args: &request.args,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| FieldforgeError::Network(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| FieldforgeError::Network(format!("{}: {e}", self.endpoint)))?;

        if !status.is_success() {
            return Err(FieldforgeError::Provider(format!(
                "{}: HTTP {status}: {}",
                self.name,
                preview(&text)
            )));
        }

        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            FieldforgeError::Provider(format!(
                "{}: invalid completion: {e} (got: {})",
                self.name,
                preview(&text)
            ))
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| FieldforgeError::Provider(format!("{}: empty completion", self.name)))?;
        let usage = parsed.usage.unwrap_or_default();

        Ok(Completion {
            content,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(json_mode: bool) -> CompletionRequest {
        let mut args = Map::new();
        args.insert("temperature".into(), json!(0));
        CompletionRequest {
            model: "test-model".into(),
            messages: vec![ChatMessage::user("hello")],
            json_mode,
            args,
        }
    }

    #[tokio::test]
    async fn completes_against_mock_server() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "test-model",
                "temperature": 0,
                "messages": [{"role": "user", "content": "hello"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "hi there"}}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 3}
            })))
            .mount(&server)
            .await;

        let client =
            OpenAiCompatibleClient::new("mock", &format!("{}/v1/", server.uri()), "sk-test", 5)
                .unwrap();
        let completion = client.complete(&request(false)).await.unwrap();
        assert_eq!(completion.content, "hi there");
        assert_eq!(completion.input_tokens, 12);
        assert_eq!(completion.output_tokens, 3);
    }

    #[tokio::test]
    async fn json_mode_sets_response_format() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({"response_format": {"type": "json_object"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "{\"a\": 1}"}}]
            })))
            .mount(&server)
            .await;

        let client = OpenAiCompatibleClient::new("mock", &server.uri(), "k", 5).unwrap();
        let completion = client.complete(&request(true)).await.unwrap();
        assert_eq!(completion.content, r#"{"a": 1}"#);
        assert_eq!(completion.input_tokens, 0);
    }

    #[tokio::test]
    async fn http_error_is_provider_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let client = OpenAiCompatibleClient::new("mock", &server.uri(), "k", 5).unwrap();
        let err = client.complete(&request(false)).await.unwrap_err();
        assert!(matches!(err, FieldforgeError::Provider(_)));
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("slow down"));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn empty_choices_is_provider_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let client = OpenAiCompatibleClient::new("mock", &server.uri(), "k", 5).unwrap();
        let err = client.complete(&request(false)).await.unwrap_err();
        assert!(err.to_string().contains("empty completion"));
    }
}
