//! Two-call structured step: free-text answer first, then structuring.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use fieldforge_providers::ProviderRegistry;
use fieldforge_shared::{ParamValue, Params, Record, Result, RowStatistics};

use crate::prompt::Prompt;
use crate::step::{FieldSpec, Step, StepCore, StepOutput, guarded};
use crate::steps::LlmConfig;
use crate::steps::llm_structured::{extract_fields, structured_prompt};

const PARAMS: [&str; 4] = ["model", "structured_model", "prompt", "args"];

/// Lets a strong model answer freely, then has `structured_model` turn the
/// answer into the declared fields.
pub struct LlmStructuredCompositeStep {
    core: StepCore,
    config: LlmConfig,
    structured_model: String,
    schema: Vec<FieldSpec>,
    registry: Arc<ProviderRegistry>,
}

impl LlmStructuredCompositeStep {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        model: impl Into<String>,
        structured_model: impl Into<String>,
        prompt: impl Into<Prompt>,
        schema: Vec<FieldSpec>,
    ) -> Self {
        Self {
            core: StepCore::new("LlmStructuredCompositeStep"),
            config: LlmConfig::new(model, prompt),
            structured_model: structured_model.into(),
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

    pub fn structured_model(&self) -> &str {
        &self.structured_model
    }
}

#[async_trait]
impl Step for LlmStructuredCompositeStep {
    fn core(&self) -> &StepCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StepCore {
        &mut self.core
    }

    fn kind(&self) -> &'static str {
        "LlmStructuredCompositeStep"
    }

    fn output_fields(&self) -> Vec<String> {
        self.schema.iter().map(|f| f.name.clone()).collect()
    }

    fn param_names(&self) -> &'static [&'static str] {
        &PARAMS
    }

    fn params(&self) -> Params {
        let mut params = self.config.snapshot();
        params.insert(
            "structured_model".into(),
            ParamValue::from(self.structured_model.as_str()),
        );
        params
    }

    fn configure(&mut self, params: &Params) -> Result<()> {
        let config = self.config.merged(params)?;
        let structured_model = match params.get("structured_model") {
            Some(v) => v.expect_str("structured_model")?,
            None => self.structured_model.clone(),
        };
        self.config = config;
        self.structured_model = structured_model;
        Ok(())
    }

    /// The free-text model; per-record usage credits each call to its own model.
    fn model(&self) -> Option<&str> {
        Some(&self.config.model)
    }

    async fn process(&self, record: &Record) -> Result<StepOutput> {
        let prompt = guarded(self.name(), || self.config.prompt.render(record))?;
        let answer = self
            .registry
            .get_response(&prompt, &self.config.model, &self.config.args)
            .await?;
        if !answer.success {
            return Ok(StepOutput::new(Record::new(), answer.statistics())
                .with_error(answer.error.clone())
                .with_prompt(prompt)
                .with_usage(&self.config.model, &answer.statistics()));
        }

        let text = answer.text().unwrap_or_default();
        let structured = self
            .registry
            .get_structured_response(
                &structured_prompt(text, &self.schema),
                &self.structured_model,
                &self.config.args,
            )
            .await?;

        let statistics = RowStatistics::combine([&answer.statistics(), &structured.statistics()]);
        let fields = match structured.structured().filter(|_| structured.success) {
            Some(reply) => extract_fields(self.name(), &self.schema, reply),
            None => Record::new(),
        };
        Ok(StepOutput::new(fields, statistics)
            .with_error(structured.error.clone())
            .with_prompt(prompt)
            .with_usage(&self.config.model, &answer.statistics())
            .with_usage(&self.structured_model, &structured.statistics()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;
    use crate::steps::testing::{ScriptedClient, record, registry};
    use crate::pipeline::Pipeline;
    use fieldforge_shared::{Dataset, RowMeta, TokenUsage};
    use serde_json::json;

    fn step(client: Arc<ScriptedClient>) -> LlmStructuredCompositeStep {
        LlmStructuredCompositeStep::new(
            registry(&["big", "small"], client),
            "big",
            "small",
            "Describe {title}",
            vec![FieldSpec::new("mood", "Overall mood")],
        )
    }

    #[tokio::test]
    async fn two_calls_with_summed_statistics() {
        let client = ScriptedClient::new(|req| match req.model.as_str() {
            "big" => Ok("A bleak desert epic.".into()),
            _ => Ok(r#"{"mood": "bleak"}"#.into()),
        });
        let mut step = step(client.clone());
        let mut data = Dataset::Record(record(json!({"title": "Dune"})));
        step.run(&mut data, &SilentProgress).await.unwrap();

        let row = data.records().next().unwrap();
        assert_eq!(row["mood"], json!("bleak"));
        assert_eq!(step.statistics().input_tokens, 20);
        assert_eq!(step.statistics().output_tokens, 10);
        assert_eq!(step.statistics().num_success, 1);

        let prompts = client.prompts();
        assert_eq!(prompts[0], "Describe Dune");
        assert!(prompts[1].starts_with("A bleak desert epic."));
    }

    #[tokio::test]
    async fn tokens_are_credited_to_each_model() {
        let client = ScriptedClient::new(|req| match req.model.as_str() {
            "big" => Ok("Sunny.".into()),
            _ => Ok(r#"{"mood": "light"}"#.into()),
        });
        let mut pipeline = Pipeline::new(vec![Box::new(step(client)) as Box<dyn Step>]).unwrap();
        let data = Dataset::Table(vec![
            record(json!({"title": "a"})),
            record(json!({"title": "b"})),
        ]);
        pipeline.run(data).await.unwrap();

        let expected = TokenUsage {
            input_tokens: 20,
            output_tokens: 10,
        };
        let by_model = &pipeline.steps()[0].statistics().tokens_by_model;
        assert_eq!(by_model.len(), 2);
        assert_eq!(by_model["big"], expected);
        assert_eq!(by_model["small"], expected);

        let totals = &pipeline.statistics().tokens_by_model;
        assert_eq!(totals["big"], expected);
        assert_eq!(totals["small"], expected);
        assert_eq!(pipeline.statistics().input_tokens, 40);
    }

    #[tokio::test]
    async fn first_call_failure_skips_structuring() {
        let client = ScriptedClient::new(|req| match req.model.as_str() {
            "big" => Err("overloaded".into()),
            _ => Ok(r#"{"mood": "x"}"#.into()),
        });
        let mut step = step(client.clone());
        let mut data = Dataset::Record(record(json!({"title": "Dune"})));
        step.run(&mut data, &SilentProgress).await.unwrap();

        let row = data.records().next().unwrap();
        assert_eq!(RowMeta::success_of(&row["__LlmStructuredCompositeStep__"]), Some(false));
        assert_eq!(client.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn structured_model_is_a_parameter() {
        let client = ScriptedClient::new(|_| Ok(String::new()));
        let mut step = step(client);
        let params = Params::from([("structured_model".to_string(), ParamValue::from("big"))]);
        step.update_params(&params).unwrap();
        assert_eq!(step.structured_model(), "big");
        assert_eq!(step.params()["structured_model"], ParamValue::from("big"));
    }
}
