//! The step contract: one named, independently configurable transform.
//!
//! Implementors supply a single-record primitive ([`Step::process`]) plus
//! their parameter handling. Everything else (applying the primitive over a
//! dataset, failure isolation, metadata columns, statistics, fingerprints)
//! is provided by the trait.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use fieldforge_shared::{
    Dataset, FieldforgeError, Params, Record, Result, RowMeta, RowStatistics, StepStatistics,
    TokenUsage, content_hash, meta_column,
};

use crate::progress::ProgressReporter;

// ---------------------------------------------------------------------------
// Building blocks
// ---------------------------------------------------------------------------

/// State every step carries: its name and running statistics.
#[derive(Debug, Clone)]
pub struct StepCore {
    name: String,
    statistics: StepStatistics,
}

impl StepCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            statistics: StepStatistics::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn statistics(&self) -> &StepStatistics {
        &self.statistics
    }

    pub(crate) fn restore_statistics(&mut self, statistics: StepStatistics) {
        self.statistics = statistics;
    }
}

/// Result of applying a step to one record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    /// Derived fields; anything outside the declared output schema is dropped.
    pub fields: Record,
    pub statistics: RowStatistics,
    pub error: Option<String>,
    /// The prompt or raw input sent for this record, kept for diagnostics.
    pub prompt: Option<String>,
    /// Per-model token split; empty means everything goes to [`Step::model`].
    pub usage: Vec<(String, TokenUsage)>,
}

impl StepOutput {
    pub fn new(fields: Record, statistics: RowStatistics) -> Self {
        Self {
            fields,
            statistics,
            error: None,
            prompt: None,
            usage: Vec::new(),
        }
    }

    /// A failed record; `statistics.success` is forced to `false`.
    pub fn failed(error: impl Into<String>, statistics: RowStatistics) -> Self {
        Self {
            fields: Record::new(),
            statistics: RowStatistics {
                success: false,
                ..statistics
            },
            error: Some(error.into()),
            prompt: None,
            usage: Vec::new(),
        }
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// Credit the tokens of one model call made for this record.
    pub fn with_usage(mut self, model: impl Into<String>, statistics: &RowStatistics) -> Self {
        self.usage.push((model.into(), TokenUsage::from(statistics)));
        self
    }
}

/// One declared output field of a structured step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// Type hint shown to the model, e.g. `str` or `int`.
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
}

fn default_kind() -> String {
    "str".into()
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: default_kind(),
            description: description.into(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// One line per field, the way it is appended to structured prompts.
    pub fn describe_all(fields: &[FieldSpec]) -> String {
        fields
            .iter()
            .map(|f| format!("- {} ({}): {}", f.name, f.kind, f.description))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Stable JSON view of a parameter snapshot (callables by name).
pub fn params_to_stable_json(params: &Params) -> Value {
    Value::Object(
        params
            .iter()
            .map(|(k, v)| (k.clone(), v.to_stable_json()))
            .collect(),
    )
}

/// Call a user-supplied function, turning a panic into a per-record error.
pub fn guarded<T>(step: &str, f: impl FnOnce() -> T) -> Result<T> {
    std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        FieldforgeError::step(step, format!("panicked: {}", panic_message(&*payload)))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

// ---------------------------------------------------------------------------
// Step trait
// ---------------------------------------------------------------------------

/// A named transform that derives new fields from each record.
#[async_trait]
pub trait Step: Send + Sync {
    fn core(&self) -> &StepCore;

    fn core_mut(&mut self) -> &mut StepCore;

    /// Short type tag, part of the fingerprint.
    fn kind(&self) -> &'static str;

    /// Columns this step may write, in order.
    fn output_fields(&self) -> Vec<String>;

    /// Parameter keys accepted by [`Step::update_params`].
    fn param_names(&self) -> &'static [&'static str];

    /// Snapshot of the current configuration.
    fn params(&self) -> Params;

    /// Apply overrides, all or nothing.
    ///
    /// Keys are already known to be in [`Step::param_names`]; a value of the
    /// wrong type must fail without changing the step.
    fn configure(&mut self, params: &Params) -> Result<()>;

    /// Model id used for token accounting, if the step calls one.
    fn model(&self) -> Option<&str> {
        None
    }

    /// Apply the step to one record.
    ///
    /// A non-fatal `Err` is recorded as a failed row; a fatal one aborts the run.
    async fn process(&self, record: &Record) -> Result<StepOutput>;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn statistics(&self) -> &StepStatistics {
        self.core().statistics()
    }

    fn reset_statistics(&mut self) {
        self.core_mut().statistics = StepStatistics::default();
    }

    /// Validate and apply `params`, then reset statistics.
    fn update_params(&mut self, params: &Params) -> Result<()> {
        let known = self.param_names();
        if let Some(key) = params.keys().find(|k| !known.contains(&k.as_str())) {
            return Err(FieldforgeError::validation(format!(
                "step `{}` ({}) has no parameter `{key}`; expected one of: {}",
                self.name(),
                self.kind(),
                known.join(", ")
            )));
        }
        self.configure(params)?;
        self.reset_statistics();
        debug!(step = %self.name(), keys = ?params.keys().collect::<Vec<_>>(), "parameters updated");
        Ok(())
    }

    /// SHA-256 hex digest of the step's identity; `deep` includes parameters.
    fn fingerprint(&self, deep: bool) -> String {
        let mut identity = json!({
            "name": self.name(),
            "kind": self.kind(),
            "output_fields": self.output_fields(),
        });
        if deep {
            identity["params"] = params_to_stable_json(&self.params());
        }
        content_hash(&identity)
    }

    /// Apply the step to every record of `data`, in place and in order.
    async fn run(&mut self, data: &mut Dataset, progress: &dyn ProgressReporter) -> Result<()> {
        let name = self.name().to_string();
        let fields = self.output_fields();
        let total = data.len();

        info!(step = %name, kind = self.kind(), rows = total, "running step");
        progress.step_started(&name, total);

        for (index, record) in data.records_mut().enumerate() {
            let started = Instant::now();
            let output = match self.process(record).await {
                Ok(output) => output,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => StepOutput::failed(
                    e.to_string(),
                    RowStatistics::failed(started.elapsed().as_secs_f64()),
                ),
            };

            if output.statistics.success {
                debug!(step = %name, row = index, latency = output.statistics.latency, "record done");
            } else {
                warn!(
                    step = %name,
                    row = index,
                    error = output.error.as_deref().unwrap_or("unknown"),
                    "record failed"
                );
            }

            let model = self.model().map(str::to_string);
            let statistics = &mut self.core_mut().statistics;
            statistics.record(&output.statistics);
            match (output.usage.is_empty(), model) {
                (true, Some(model)) => {
                    statistics.record_usage(&model, TokenUsage::from(&output.statistics));
                }
                _ => {
                    for (model, usage) in &output.usage {
                        statistics.record_usage(model, *usage);
                    }
                }
            }
            write_output(record, &name, &fields, output)?;
            progress.row_done(&name, index + 1, total);
        }

        let stats = self.statistics();
        info!(
            step = %name,
            success = stats.num_success,
            failure = stats.num_failure,
            "step finished"
        );
        Ok(())
    }
}

/// Write declared output fields and the `__{step}__` metadata column.
///
/// Declared fields absent from the output (or from a failed output) are
/// removed, so a record never keeps a stale value from an earlier run.
fn write_output(
    record: &mut Record,
    step: &str,
    declared: &[String],
    output: StepOutput,
) -> Result<()> {
    let StepOutput {
        mut fields,
        statistics,
        error,
        prompt,
        ..
    } = output;

    for name in declared {
        match fields.remove(name).filter(|_| statistics.success) {
            Some(value) => record.insert(name.clone(), value),
            None => record.remove(name),
        };
    }

    let meta = RowMeta {
        statistics,
        error,
        prompt,
    };
    record.insert(meta_column(step), serde_json::to_value(&meta)?);
    Ok(())
}
