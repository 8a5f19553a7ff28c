//! Search-engine enrichment step.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;

use fieldforge_providers::SearchClient;
use fieldforge_shared::{Callable, ParamValue, Params, Record, Result};

use crate::prompt::Prompt;
use crate::step::{Step, StepCore, StepOutput, guarded};
use crate::steps::timed;

const PARAMS: [&str; 2] = ["prompt", "postprocess"];

/// Signature of a search-result post-processor.
pub type PostprocessFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// A named function applied to the raw search result text.
#[derive(Clone)]
pub struct Postprocess {
    name: Arc<str>,
    apply: PostprocessFn,
}

impl Postprocess {
    pub fn new(
        name: impl Into<Arc<str>>,
        apply: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            apply: Arc::new(apply),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn apply(&self, raw: &str) -> String {
        (self.apply)(raw)
    }
}

impl fmt::Debug for Postprocess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Postprocess({})", self.name)
    }
}

impl From<Postprocess> for ParamValue {
    fn from(p: Postprocess) -> Self {
        ParamValue::Callable(Callable::new(Arc::clone(&p.name), p))
    }
}

/// Queries a search engine per record and writes the (post-processed)
/// result text to `{name}`.
pub struct SerpEnrichmentStep {
    core: StepCore,
    prompt: Prompt,
    postprocess: Option<Postprocess>,
    client: Arc<dyn SearchClient>,
}

impl SerpEnrichmentStep {
    pub fn new(client: Arc<dyn SearchClient>, prompt: impl Into<Prompt>) -> Self {
        Self {
            core: StepCore::new("SerpEnrichmentStep"),
            prompt: prompt.into(),
            postprocess: None,
            client,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.core.set_name(name);
        self
    }

    pub fn with_postprocess(mut self, postprocess: Postprocess) -> Self {
        self.postprocess = Some(postprocess);
        self
    }
}

#[async_trait]
impl Step for SerpEnrichmentStep {
    fn core(&self) -> &StepCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StepCore {
        &mut self.core
    }

    fn kind(&self) -> &'static str {
        "SerpEnrichmentStep"
    }

    fn output_fields(&self) -> Vec<String> {
        vec![self.name().to_string()]
    }

    fn param_names(&self) -> &'static [&'static str] {
        &PARAMS
    }

    fn params(&self) -> Params {
        let postprocess = match &self.postprocess {
            Some(p) => ParamValue::from(p.clone()),
            None => ParamValue::from(Value::Null),
        };
        Params::from([
            ("prompt".to_string(), self.prompt.to_param()),
            ("postprocess".to_string(), postprocess),
        ])
    }

    fn configure(&mut self, params: &Params) -> Result<()> {
        let prompt = match params.get("prompt") {
            Some(v) => Prompt::from_param(v, "prompt")?,
            None => self.prompt.clone(),
        };
        let postprocess = match params.get("postprocess") {
            Some(ParamValue::Json(Value::Null)) => None,
            Some(v) => Some(v.expect_callable::<Postprocess>("postprocess")?),
            None => self.postprocess.clone(),
        };
        self.prompt = prompt;
        self.postprocess = postprocess;
        Ok(())
    }

    async fn process(&self, record: &Record) -> Result<StepOutput> {
        let started = Instant::now();
        let query = guarded(self.name(), || self.prompt.render(record))?;
        let raw = self.client.search(&query).await?;
        let text = match &self.postprocess {
            Some(p) => guarded(self.name(), || p.apply(&raw))?,
            None => raw,
        };

        let mut fields = Record::new();
        fields.insert(self.name().to_string(), Value::String(text));
        Ok(StepOutput::new(fields, timed(started)).with_prompt(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;
    use crate::steps::testing::record;
    use fieldforge_shared::{Dataset, FieldforgeError};
    use serde_json::json;

    /// Echoes the query back; fails for queries containing "down".
    struct EchoSearch;

    #[async_trait]
    impl SearchClient for EchoSearch {
        async fn search(&self, query: &str) -> Result<String> {
            if query.contains("down") {
                return Err(FieldforgeError::Network("search is down".into()));
            }
            Ok(format!("results for {query}"))
        }
    }

    #[tokio::test]
    async fn writes_postprocessed_results() {
        let mut step = SerpEnrichmentStep::new(Arc::new(EchoSearch), "{company} headquarters")
            .named("serp")
            .with_postprocess(Postprocess::new("upper", |raw: &str| raw.to_uppercase()));
        let mut data = Dataset::Table(vec![
            record(json!({"company": "acme"})),
            record(json!({"company": "down"})),
        ]);
        step.run(&mut data, &SilentProgress).await.unwrap();

        let rows: Vec<_> = data.records().collect();
        assert_eq!(rows[0]["serp"], json!("RESULTS FOR ACME HEADQUARTERS"));
        assert!(rows[1].get("serp").is_none());
        assert_eq!(step.statistics().num_success, 1);
        assert_eq!(step.statistics().num_failure, 1);
    }

    #[test]
    fn postprocess_can_be_cleared() {
        let mut step = SerpEnrichmentStep::new(Arc::new(EchoSearch), "{q}")
            .with_postprocess(Postprocess::new("trim", |raw: &str| raw.trim().to_string()));
        assert_eq!(step.params()["postprocess"].to_stable_json(), json!("trim"));

        let params = Params::from([("postprocess".to_string(), ParamValue::from(Value::Null))]);
        step.update_params(&params).unwrap();
        assert_eq!(step.params()["postprocess"], ParamValue::from(Value::Null));
    }
}
