//! Pipeline definition files.
//!
//! A definition is a TOML document listing the steps to run, how to score
//! the result, and optionally a parameter grid to sweep:
//!
//! ```toml
//! name = "book-genres"
//! input = "books.csv"
//!
//! [[steps]]
//! kind = "llm"
//! name = "genre"
//! model = "gpt-4o-mini"
//! prompt = "Name the genre of {title}. Answer with one word."
//!
//! [evaluation]
//! field = "genre"
//! label = "label"
//!
//! [grid.genre]
//! model = ["gpt-4o-mini", "gpt-4o"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use fieldforge_core::{
    Evaluator, FieldSpec, LlmStep, LlmStructuredCompositeStep, LlmStructuredStep, Pipeline,
    SerpEnrichmentStep, Step,
};
use fieldforge_providers::{ProviderRegistry, SearchClient, SerperClient};
use fieldforge_shared::{AppConfig, FieldforgeError, ParamGrid, ParamValue, Result};

/// Parsed pipeline definition.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct PipelineDefinition {
    /// Experiment name; defaults to the file stem.
    pub name: Option<String>,
    /// Input CSV, resolved relative to the definition file.
    pub input: Option<PathBuf>,
    pub steps: Vec<StepDefinition>,
    pub evaluation: Option<EvaluationDefinition>,
    /// `{step: {param: [values]}}`.
    #[serde(default)]
    pub grid: BTreeMap<String, BTreeMap<String, Vec<Value>>>,
    #[serde(skip)]
    source: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum StepKind {
    Llm,
    LlmStructured,
    LlmComposite,
    Serp,
}

/// `[[steps]]` entry.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct StepDefinition {
    pub kind: StepKind,
    pub name: Option<String>,
    /// Falls back to `defaults.default_model`.
    pub model: Option<String>,
    /// Second-call model of `llm_composite`; falls back to `model`.
    pub structured_model: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

/// Output field of a structured step.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FieldDefinition {
    pub name: String,
    #[serde(default = "default_field_kind")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
}

fn default_field_kind() -> String {
    "str".into()
}

/// `[evaluation]`: pass when `field` equals `label`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct EvaluationDefinition {
    #[serde(default = "default_evaluator_name")]
    pub name: String,
    pub field: String,
    pub label: String,
}

fn default_evaluator_name() -> String {
    "accuracy".into()
}

impl PipelineDefinition {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| FieldforgeError::io(path, e))?;
        let mut definition: Self = toml::from_str(&content).map_err(|e| {
            FieldforgeError::config(format!("failed to parse {}: {e}", path.display()))
        })?;
        definition.source = Some(path.to_path_buf());
        Ok(definition)
    }

    #[cfg(test)]
    pub(crate) fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| FieldforgeError::config(e.to_string()))
    }

    pub(crate) fn experiment_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| {
                self.source
                    .as_deref()
                    .and_then(Path::file_stem)
                    .map(|s| s.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "default".into())
    }

    /// The `input` path, relative to the directory holding the definition.
    pub(crate) fn input_path(&self) -> Option<PathBuf> {
        let input = self.input.as_ref()?;
        let base = self.source.as_deref().and_then(Path::parent);
        Some(match base {
            Some(dir) if input.is_relative() => dir.join(input),
            _ => input.clone(),
        })
    }

    /// Build the pipeline, creating a search client only when a step needs one.
    pub(crate) fn build(&self, config: &AppConfig, registry: Arc<ProviderRegistry>) -> Result<Pipeline> {
        let search = if self.steps.iter().any(|s| s.kind == StepKind::Serp) {
            let client: Arc<dyn SearchClient> = Arc::new(SerperClient::from_config(&config.search)?);
            Some(client)
        } else {
            None
        };
        self.build_with(&config.defaults.default_model, registry, search)
    }

    pub(crate) fn build_with(
        &self,
        default_model: &str,
        registry: Arc<ProviderRegistry>,
        search: Option<Arc<dyn SearchClient>>,
    ) -> Result<Pipeline> {
        let mut steps: Vec<Box<dyn Step>> = Vec::with_capacity(self.steps.len());
        for def in &self.steps {
            steps.push(def.build(default_model, &registry, search.as_ref())?);
        }
        let pipeline = Pipeline::new(steps)?;
        Ok(match &self.evaluation {
            Some(eval) => pipeline.with_evaluator(Evaluator::equals(&eval.name, &eval.field, &eval.label)),
            None => pipeline,
        })
    }

    pub(crate) fn grid(&self) -> ParamGrid {
        let grid: BTreeMap<String, BTreeMap<String, Vec<ParamValue>>> = self
            .grid
            .iter()
            .map(|(step, params)| {
                let params = params
                    .iter()
                    .map(|(param, values)| {
                        (param.clone(), values.iter().cloned().map(ParamValue::from).collect())
                    })
                    .collect();
                (step.clone(), params)
            })
            .collect();
        ParamGrid::from(grid)
    }
}

impl StepDefinition {
    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(match self.kind {
            StepKind::Llm => "LlmStep",
            StepKind::LlmStructured => "LlmStructuredStep",
            StepKind::LlmComposite => "LlmStructuredCompositeStep",
            StepKind::Serp => "SerpEnrichmentStep",
        })
    }

    fn schema(&self) -> Result<Vec<FieldSpec>> {
        if self.fields.is_empty() {
            return Err(FieldforgeError::config(format!(
                "step `{}` needs at least one output field",
                self.label()
            )));
        }
        Ok(self
            .fields
            .iter()
            .map(|f| FieldSpec::new(&f.name, &f.description).with_kind(&f.kind))
            .collect())
    }

    fn checked_model(&self, model: &str, registry: &ProviderRegistry) -> Result<String> {
        if !registry.has_model(model) {
            return Err(FieldforgeError::config(format!(
                "step `{}`: no configured provider serves `{model}` (is its API key set?)",
                self.label()
            )));
        }
        Ok(model.to_string())
    }

    fn build(
        &self,
        default_model: &str,
        registry: &Arc<ProviderRegistry>,
        search: Option<&Arc<dyn SearchClient>>,
    ) -> Result<Box<dyn Step>> {
        let name = self.label().to_string();
        let model = self.model.as_deref().unwrap_or(default_model);
        let step: Box<dyn Step> = match self.kind {
            StepKind::Serp => {
                let client = search.cloned().ok_or_else(|| {
                    FieldforgeError::config(format!("step `{name}` needs a search client"))
                })?;
                Box::new(SerpEnrichmentStep::new(client, self.prompt.as_str()).named(name))
            }
            StepKind::Llm => {
                if !self.fields.is_empty() {
                    return Err(FieldforgeError::config(format!(
                        "step `{name}` writes a single field named after the step; drop `fields`"
                    )));
                }
                let model = self.checked_model(model, registry)?;
                Box::new(
                    LlmStep::new(Arc::clone(registry), model, self.prompt.as_str())
                        .named(name)
                        .with_args(self.args.clone()),
                )
            }
            StepKind::LlmStructured => {
                let model = self.checked_model(model, registry)?;
                Box::new(
                    LlmStructuredStep::new(
                        Arc::clone(registry),
                        model,
                        self.prompt.as_str(),
                        self.schema()?,
                    )
                    .named(name)
                    .with_args(self.args.clone()),
                )
            }
            StepKind::LlmComposite => {
                let model = self.checked_model(model, registry)?;
                let structured = match &self.structured_model {
                    Some(m) => self.checked_model(m, registry)?,
                    None => model.clone(),
                };
                Box::new(
                    LlmStructuredCompositeStep::new(
                        Arc::clone(registry),
                        model,
                        structured,
                        self.prompt.as_str(),
                        self.schema()?,
                    )
                    .named(name)
                    .with_args(self.args.clone()),
                )
            }
        };
        Ok(step)
    }
}
