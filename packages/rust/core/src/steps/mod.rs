//! Built-in step implementations.

pub mod custom;
pub mod embedding_search;
pub mod llm;
pub mod llm_composite;
pub mod llm_structured;
pub mod serp;

pub use custom::{CustomStep, Transform};
pub use embedding_search::{Candidates, DEFAULT_K, EmbeddingSearchStep};
pub use llm::LlmStep;
pub use llm_composite::LlmStructuredCompositeStep;
pub use llm_structured::LlmStructuredStep;
pub use serp::{Postprocess, SerpEnrichmentStep};

use std::time::Instant;

use serde_json::{Map, Value};

use fieldforge_shared::{ParamValue, Params, Result, RowStatistics};

use crate::prompt::Prompt;

/// Parameter keys shared by every language-model step.
pub(crate) const LLM_PARAMS: [&str; 3] = ["model", "prompt", "args"];

/// Model, prompt and call arguments of a language-model step.
#[derive(Debug, Clone)]
pub(crate) struct LlmConfig {
    pub model: String,
    pub prompt: Prompt,
    pub args: Map<String, Value>,
}

impl LlmConfig {
    pub fn new(model: impl Into<String>, prompt: impl Into<Prompt>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            args: Map::new(),
        }
    }

    /// A copy with the recognised keys of `params` applied.
    pub fn merged(&self, params: &Params) -> Result<Self> {
        let mut next = self.clone();
        if let Some(v) = params.get("model") {
            next.model = v.expect_str("model")?;
        }
        if let Some(v) = params.get("prompt") {
            next.prompt = Prompt::from_param(v, "prompt")?;
        }
        if let Some(v) = params.get("args") {
            next.args = v.expect_object("args")?;
        }
        Ok(next)
    }

    pub fn snapshot(&self) -> Params {
        Params::from([
            ("model".to_string(), ParamValue::from(self.model.as_str())),
            ("prompt".to_string(), self.prompt.to_param()),
            ("args".to_string(), ParamValue::from(Value::Object(self.args.clone()))),
        ])
    }
}

/// Row statistics for a step that only measures wall time.
pub(crate) fn timed(started: Instant) -> RowStatistics {
    RowStatistics {
        latency: started.elapsed().as_secs_f64(),
        ..Default::default()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use fieldforge_providers::{Completion, CompletionRequest, LlmClient, ProviderRegistry};
    use fieldforge_shared::{FieldforgeError, Record, Result};
    use serde_json::Value;

    type Reply = Box<dyn Fn(&CompletionRequest) -> std::result::Result<String, String> + Send + Sync>;

    /// Client answering through a closure and recording every request.
    pub(crate) struct ScriptedClient {
        reply: Reply,
        pub seen: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedClient {
        pub(crate) fn new(
            reply: impl Fn(&CompletionRequest) -> std::result::Result<String, String>
            + Send
            + Sync
            + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                reply: Box::new(reply),
                seen: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn prompts(&self) -> Vec<String> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .filter_map(|r| r.messages.last().map(|m| m.content.clone()))
                .collect()
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
            self.seen.lock().unwrap().push(request.clone());
            match (self.reply)(request) {
                Ok(content) => Ok(Completion {
                    content,
                    input_tokens: 10,
                    output_tokens: 5,
                }),
                Err(message) => Err(FieldforgeError::Provider(message)),
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    pub(crate) fn registry(models: &[&str], client: Arc<ScriptedClient>) -> Arc<ProviderRegistry> {
        let registry = models.iter().fold(ProviderRegistry::new(), |r, model| {
            r.register(*model, client.clone()).with_price(*model, 1.0, 2.0)
        });
        Arc::new(registry)
    }

    pub(crate) fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }
}
