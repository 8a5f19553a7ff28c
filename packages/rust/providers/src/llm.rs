//! Language-model client contract and the per-pipeline provider registry.
//!
//! Steps never talk to a provider directly. They ask a [`ProviderRegistry`]
//! for a normalized [`LlmResponse`]; the registry routes the model id to a
//! registered [`LlmClient`], measures latency, and prices the call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use fieldforge_shared::{AppConfig, FieldforgeError, Result, RowStatistics, resolve_api_key};

use crate::openai::OpenAiCompatibleClient;
use crate::pricing::PricingTable;

/// System prompt sent with JSON-mode requests.
const JSON_SYSTEM_PROMPT: &str = "You are a helpful assistant designed to output JSON.";

// ---------------------------------------------------------------------------
// Client contract
// ---------------------------------------------------------------------------

/// One chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// A completion request in provider-neutral form.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Ask the provider for a JSON object response.
    pub json_mode: bool,
    /// Free-form call arguments (temperature, max_tokens, ...).
    pub args: Map<String, Value>,
}

/// Raw completion returned by a client.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A model provider able to answer chat completion requests.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send one request; errors are transport or provider failures.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Human-readable provider name for tracing.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Normalized response
// ---------------------------------------------------------------------------

/// Response content: raw text or a parsed JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Structured(Map<String, Value>),
}

impl Default for Content {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

/// Provider-independent result of one model call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub success: bool,
    pub error: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    /// Seconds.
    pub latency: f64,
    pub content: Content,
}

impl LlmResponse {
    /// A failed response carrying only an error message.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Row statistics for this call.
    pub fn statistics(&self) -> RowStatistics {
        RowStatistics {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            input_cost: self.input_cost,
            output_cost: self.output_cost,
            latency: self.latency,
            success: self.success,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            Content::Text(t) => Some(t),
            Content::Structured(_) => None,
        }
    }

    pub fn structured(&self) -> Option<&Map<String, Value>> {
        match &self.content {
            Content::Structured(m) => Some(m),
            Content::Text(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Routes model ids to clients and prices their calls.
///
/// Built explicitly and handed to steps, so independent pipelines can use
/// different providers side by side.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    clients: HashMap<String, Arc<dyn LlmClient>>,
    pricing: PricingTable,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut models: Vec<&String> = self.clients.keys().collect();
        models.sort();
        f.debug_struct("ProviderRegistry")
            .field("models", &models)
            .field("pricing", &self.pricing)
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `model` to `client`.
    pub fn register(mut self, model: impl Into<String>, client: Arc<dyn LlmClient>) -> Self {
        self.clients.insert(model.into(), client);
        self
    }

    /// Set the price of `model` in USD per million tokens.
    pub fn with_price(mut self, model: impl Into<String>, input: f64, output: f64) -> Self {
        self.pricing.set(model, input, output);
        self
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    /// Build clients for every configured provider whose API key is set.
    ///
    /// Providers without a key are skipped with a warning; using one of their
    /// models later fails with a configuration error.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let mut registry = Self::new().with_pricing(PricingTable::from(config));
        for provider in &config.providers {
            let api_key = match resolve_api_key(&provider.api_key_env) {
                Ok(key) => key,
                Err(e) => {
                    warn!(provider = %provider.name, error = %e, "skipping provider");
                    continue;
                }
            };
            let client: Arc<dyn LlmClient> = Arc::new(OpenAiCompatibleClient::new(
                &provider.name,
                &provider.base_url,
                api_key,
                provider.timeout_secs,
            )?);
            for model in &provider.models {
                registry.clients.insert(model.clone(), Arc::clone(&client));
            }
        }
        Ok(registry)
    }

    pub fn has_model(&self, model: &str) -> bool {
        self.clients.contains_key(model)
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Look up the client for `model`.
    ///
    /// A missing client is a structural misconfiguration, not a per-record
    /// failure, so it is reported as a fatal config error.
    pub fn client_for(&self, model: &str) -> Result<Arc<dyn LlmClient>> {
        self.clients
            .get(model)
            .cloned()
            .ok_or_else(|| FieldforgeError::config(format!("unsupported model: `{model}`")))
    }

    /// Plain-text completion of `prompt` with `model`.
    pub async fn get_response(
        &self,
        prompt: &str,
        model: &str,
        args: &Map<String, Value>,
    ) -> Result<LlmResponse> {
        let request = CompletionRequest {
            model: model.to_string(),
            messages: vec![ChatMessage::user(prompt)],
            json_mode: false,
            args: args.clone(),
        };
        let (mut response, raw) = self.call(&request).await?;
        if let Some(text) = raw {
            response.content = Content::Text(text);
        }
        Ok(response)
    }

    /// JSON-object completion of `prompt`; the schema is described in the prompt.
    pub async fn get_structured_response(
        &self,
        prompt: &str,
        model: &str,
        args: &Map<String, Value>,
    ) -> Result<LlmResponse> {
        let request = CompletionRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage::system(JSON_SYSTEM_PROMPT),
                ChatMessage::user(prompt),
            ],
            json_mode: true,
            args: args.clone(),
        };
        let (mut response, raw) = self.call(&request).await?;
        if let Some(text) = raw {
            match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => response.content = Content::Structured(map),
                _ => {
                    response.success = false;
                    response.error = Some(format!("failed to parse JSON: {text}"));
                }
            }
        }
        Ok(response)
    }

    /// Run one request, returning the priced response and the raw text on success.
    async fn call(&self, request: &CompletionRequest) -> Result<(LlmResponse, Option<String>)> {
        let client = self.client_for(&request.model)?;

        let start = Instant::now();
        let outcome = client.complete(request).await;
        let latency = start.elapsed().as_secs_f64();

        match outcome {
            Ok(completion) => {
                let (input_cost, output_cost) = self.pricing.cost(
                    &request.model,
                    completion.input_tokens,
                    completion.output_tokens,
                );
                debug!(
                    provider = client.name(),
                    model = %request.model,
                    tokens_in = completion.input_tokens,
                    tokens_out = completion.output_tokens,
                    latency,
                    "completion received"
                );
                let response = LlmResponse {
                    success: true,
                    error: None,
                    input_tokens: completion.input_tokens,
                    output_tokens: completion.output_tokens,
                    input_cost,
                    output_cost,
                    latency,
                    content: Content::default(),
                };
                Ok((response, Some(completion.content)))
            }
            Err(e) => {
                warn!(provider = client.name(), model = %request.model, error = %e, "completion failed");
                let response = LlmResponse {
                    latency,
                    ..LlmResponse::failure(e.to_string())
                };
                Ok((response, None))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Client answering every request with a fixed completion.
    struct FixedClient {
        reply: std::result::Result<String, String>,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl FixedClient {
        fn ok(text: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(text.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn err(message: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(message.into()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmClient for FixedClient {
        async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
            self.seen.lock().unwrap().push(request.clone());
            match &self.reply {
                Ok(text) => Ok(Completion {
                    content: text.clone(),
                    input_tokens: 1_000,
                    output_tokens: 500,
                }),
                Err(message) => Err(FieldforgeError::Provider(message.clone())),
            }
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    #[tokio::test]
    async fn text_response_is_priced() {
        let client = FixedClient::ok("hello");
        let registry = ProviderRegistry::new()
            .register("m", client.clone())
            .with_price("m", 1.0, 2.0);

        let response = registry.get_response("hi", "m", &Map::new()).await.unwrap();
        assert!(response.success);
        assert_eq!(response.text(), Some("hello"));
        assert!((response.input_cost - 0.001).abs() < 1e-12);
        assert!((response.output_cost - 0.001).abs() < 1e-12);

        let seen = client.seen.lock().unwrap();
        assert_eq!(seen[0].messages, vec![ChatMessage::user("hi")]);
        assert!(!seen[0].json_mode);
    }

    #[tokio::test]
    async fn unregistered_model_is_fatal() {
        let registry = ProviderRegistry::new();
        let err = registry
            .get_response("hi", "ghost", &Map::new())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn provider_error_becomes_failed_response() {
        let registry = ProviderRegistry::new().register("m", FixedClient::err("rate limited"));
        let response = registry.get_response("hi", "m", &Map::new()).await.unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("rate limited"));
        assert_eq!(response.input_tokens, 0);
    }

    #[tokio::test]
    async fn structured_response_parses_object() {
        let client = FixedClient::ok(r#"{"label": "spam", "confidence": 0.9}"#);
        let registry = ProviderRegistry::new().register("m", client.clone());

        let response = registry
            .get_structured_response("classify", "m", &Map::new())
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.structured().unwrap()["label"], "spam");

        let seen = client.seen.lock().unwrap();
        assert!(seen[0].json_mode);
        assert_eq!(seen[0].messages[0].role, "system");
    }

    #[tokio::test]
    async fn unparseable_structured_response_fails_but_keeps_usage() {
        let registry = ProviderRegistry::new().register("m", FixedClient::ok("not json"));
        let response = registry
            .get_structured_response("classify", "m", &Map::new())
            .await
            .unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("not json"));
        assert_eq!(response.input_tokens, 1_000);
    }

    #[test]
    fn statistics_mirror_response() {
        let response = LlmResponse {
            success: true,
            input_tokens: 3,
            output_tokens: 4,
            latency: 0.5,
            ..Default::default()
        };
        let stats = response.statistics();
        assert!(stats.success);
        assert_eq!(stats.input_tokens, 3);
        assert_eq!(stats.output_tokens, 4);
    }
}
