//! Free-text language-model step.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use fieldforge_providers::ProviderRegistry;
use fieldforge_shared::{Params, Record, Result};

use crate::prompt::Prompt;
use crate::step::{Step, StepCore, StepOutput, guarded};
use crate::steps::{LLM_PARAMS, LlmConfig};

/// Renders a prompt per record and writes the model's reply to `{name}`.
pub struct LlmStep {
    core: StepCore,
    config: LlmConfig,
    registry: Arc<ProviderRegistry>,
}

impl LlmStep {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        model: impl Into<String>,
        prompt: impl Into<Prompt>,
    ) -> Self {
        Self {
            core: StepCore::new("LlmStep"),
            config: LlmConfig::new(model, prompt),
            registry,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.core.set_name(name);
        self
    }

    /// Extra provider arguments such as `temperature`.
    pub fn with_args(mut self, args: Map<String, Value>) -> Self {
        self.config.args = args;
        self
    }
}

#[async_trait]
impl Step for LlmStep {
    fn core(&self) -> &StepCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StepCore {
        &mut self.core
    }

    fn kind(&self) -> &'static str {
        "LlmStep"
    }

    fn output_fields(&self) -> Vec<String> {
        vec![self.name().to_string()]
    }

    fn param_names(&self) -> &'static [&'static str] {
        &LLM_PARAMS
    }

    fn params(&self) -> Params {
        self.config.snapshot()
    }

    fn configure(&mut self, params: &Params) -> Result<()> {
        self.config = self.config.merged(params)?;
        Ok(())
    }

    fn model(&self) -> Option<&str> {
        Some(&self.config.model)
    }

    async fn process(&self, record: &Record) -> Result<StepOutput> {
        let prompt = guarded(self.name(), || self.config.prompt.render(record))?;
        let response = self
            .registry
            .get_response(&prompt, &self.config.model, &self.config.args)
            .await?;

        let mut fields = Record::new();
        if let Some(text) = response.text().filter(|_| response.success) {
            fields.insert(self.name().to_string(), Value::String(text.to_string()));
        }
        Ok(StepOutput::new(fields, response.statistics())
            .with_error(response.error.clone())
            .with_prompt(prompt))
    }
}
