//! Language-model step returning a JSON object with declared fields.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;

use fieldforge_providers::ProviderRegistry;
use fieldforge_shared::{Params, Record, Result};

use crate::prompt::Prompt;
use crate::step::{FieldSpec, Step, StepCore, StepOutput, guarded};
use crate::steps::{LLM_PARAMS, LlmConfig};

/// Append the output schema to `main` so the model knows which fields to return.
pub fn structured_prompt(main: &str, schema: &[FieldSpec]) -> String {
    format!(
        "{main}\n\nReturn your response as a JSON object with the following fields:\n{}",
        FieldSpec::describe_all(schema)
    )
}

/// Pick the declared fields out of a model reply.
///
/// Missing or null fields become empty strings and are logged.
pub fn extract_fields(step: &str, schema: &[FieldSpec], reply: &Map<String, Value>) -> Record {
    schema
        .iter()
        .map(|field| {
            let value = match reply.get(&field.name) {
                Some(v) if !v.is_null() => v.clone(),
                _ => {
                    warn!(step = step, field = %field.name, "field missing from model reply");
                    Value::String(String::new())
                }
            };
            (field.name.clone(), value)
        })
        .collect()
}

/// Asks the model for a JSON object and writes each declared field.
pub struct LlmStructuredStep {
    core: StepCore,
    config: LlmConfig,
    schema: Vec<FieldSpec>,
    registry: Arc<ProviderRegistry>,
}

impl LlmStructuredStep {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        model: impl Into<String>,
        prompt: impl Into<Prompt>,
        schema: Vec<FieldSpec>,
    ) -> Self {
        Self {
            core: StepCore::new("LlmStructuredStep"),
            config: LlmConfig::new(model, prompt),
            schema,
            registry,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.core.set_name(name);
        self
    }

    pub fn with_args(mut self, args: Map<String, Value>) -> Self {
        self.config.args = args;
        self
    }

    pub fn schema(&self) -> &[FieldSpec] {
        &self.schema
    }
}

#[async_trait]
impl Step for LlmStructuredStep {
    fn core(&self) -> &StepCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StepCore {
        &mut self.core
    }

    fn kind(&self) -> &'static str {
        "LlmStructuredStep"
    }

    fn output_fields(&self) -> Vec<String> {
        self.schema.iter().map(|f| f.name.clone()).collect()
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
        let main = guarded(self.name(), || self.config.prompt.render(record))?;
        let prompt = structured_prompt(&main, &self.schema);
        let response = self
            .registry
            .get_structured_response(&prompt, &self.config.model, &self.config.args)
            .await?;

        let fields = match response.structured().filter(|_| response.success) {
            Some(reply) => extract_fields(self.name(), &self.schema, reply),
            None => Record::new(),
        };
        Ok(StepOutput::new(fields, response.statistics())
            .with_error(response.error.clone())
            .with_prompt(prompt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;
    use crate::steps::testing::{ScriptedClient, record, registry};
    use fieldforge_shared::{Dataset, RowMeta};
    use serde_json::json;

    fn schema() -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("genre", "Primary genre"),
            FieldSpec::new("decade", "Decade of release").with_kind("int"),
        ]
    }

    #[tokio::test]
    async fn writes_declared_fields_only() {
        let client = ScriptedClient::new(|_| {
            Ok(r#"{"genre": "sci-fi", "decade": 1960, "extra": "ignored"}"#.into())
        });
        let mut step =
            LlmStructuredStep::new(registry(&["m"], client.clone()), "m", "About {title}", schema());
        let mut data = Dataset::Record(record(json!({"title": "Dune"})));
        step.run(&mut data, &SilentProgress).await.unwrap();

        let row = data.records().next().unwrap();
        assert_eq!(row["genre"], json!("sci-fi"));
        assert_eq!(row["decade"], json!(1960));
        assert!(row.get("extra").is_none());

        let sent = &client.prompts()[0];
        assert!(sent.starts_with("About Dune"));
        assert!(sent.contains("- decade (int): Decade of release"));
        assert!(client.seen.lock().unwrap()[0].json_mode);
    }

    #[tokio::test]
    async fn missing_field_becomes_empty_string() {
        let client = ScriptedClient::new(|_| Ok(r#"{"genre": "drama"}"#.into()));
        let mut step = LlmStructuredStep::new(registry(&["m"], client), "m", "x", schema());
        let mut data = Dataset::Record(record(json!({})));
        step.run(&mut data, &SilentProgress).await.unwrap();

        let row = data.records().next().unwrap();
        assert_eq!(row["decade"], json!(""));
        assert_eq!(step.statistics().num_success, 1);
    }

    #[tokio::test]
    async fn unparseable_reply_fails_row_but_keeps_tokens() {
        let client = ScriptedClient::new(|_| Ok("not json".into()));
        let mut step = LlmStructuredStep::new(registry(&["m"], client), "m", "x", schema());
        let mut data = Dataset::Record(record(json!({})));
        step.run(&mut data, &SilentProgress).await.unwrap();

        let row = data.records().next().unwrap();
        assert_eq!(RowMeta::success_of(&row["__LlmStructuredStep__"]), Some(false));
        assert!(row.get("genre").is_none());
        assert_eq!(step.statistics().input_tokens, 10);
        assert_eq!(step.statistics().num_failure, 1);
    }
}
