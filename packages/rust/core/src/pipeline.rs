//! Ordered composition of steps with scoring and aggregate statistics.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use fieldforge_shared::{
    Dataset, FieldforgeError, GLOBAL_KEY, GroupedParams, Params, Record, Result, RowMeta,
    StepStatistics, TokenUsage, content_hash, meta_column,
};

use crate::progress::{ProgressReporter, SilentProgress};
use crate::step::{Step, guarded};

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// One record's evaluation result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Pass(bool),
    Score(f64),
}

impl Outcome {
    /// Numeric value used for the mean; booleans count as 1 or 0.
    pub fn value(self) -> f64 {
        match self {
            Self::Pass(true) => 1.0,
            Self::Pass(false) => 0.0,
            Self::Score(s) => s,
        }
    }

    fn to_json(self) -> Value {
        match self {
            Self::Pass(b) => Value::Bool(b),
            Self::Score(s) => json!(s),
        }
    }
}

impl From<bool> for Outcome {
    fn from(b: bool) -> Self {
        Self::Pass(b)
    }
}

impl From<f64> for Outcome {
    fn from(s: f64) -> Self {
        Self::Score(s)
    }
}

/// Named per-record evaluation function.
#[derive(Clone)]
pub struct Evaluator {
    name: String,
    eval: Arc<dyn Fn(&Record) -> Outcome + Send + Sync>,
}

impl Evaluator {
    pub fn new<O: Into<Outcome>>(
        name: impl Into<String>,
        eval: impl Fn(&Record) -> O + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            eval: Arc::new(move |record: &Record| -> Outcome { eval(record).into() }),
        }
    }

    /// Passes when `field` equals `label` after trimming, ignoring case.
    pub fn equals(name: impl Into<String>, field: &str, label: &str) -> Self {
        let (field, label) = (field.to_string(), label.to_string());
        Self::new(name, move |record: &Record| {
            match (record.get(&field), record.get(&label)) {
                (Some(a), Some(b)) => normalized(a) == normalized(b),
                _ => false,
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn evaluate(&self, record: &Record) -> Outcome {
        (self.eval)(record)
    }
}

fn normalized(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_lowercase(),
        other => other.to_string().to_lowercase(),
    }
}

impl fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Evaluator({})", self.name)
    }
}

/// Evaluate every record, write `__{evaluator}__`, and return the mean.
///
/// Nothing is written when the evaluator fails on any record.
fn score_records(evaluator: &Evaluator, data: &mut Dataset) -> Option<f64> {
    let mut outcomes = Vec::with_capacity(data.len());
    for record in data.records() {
        match guarded(evaluator.name(), || evaluator.evaluate(record)) {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                warn!(evaluator = evaluator.name(), error = %e, "evaluation failed");
                return None;
            }
        }
    }
    if outcomes.is_empty() {
        warn!(evaluator = evaluator.name(), "nothing to evaluate");
        return None;
    }

    let column = meta_column(evaluator.name());
    for (record, outcome) in data.records_mut().zip(&outcomes) {
        record.insert(column.clone(), outcome.to_json());
    }
    Some(outcomes.iter().map(|o| o.value()).sum::<f64>() / outcomes.len() as f64)
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Aggregate view over all steps of a pipeline, rebuilt after each run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatistics {
    pub score: Option<f64>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tokens_by_model: BTreeMap<String, TokenUsage>,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_latency: f64,
    /// Records on which every step succeeded.
    pub num_success: usize,
    pub num_failure: usize,
}

impl PipelineStatistics {
    pub fn total_cost(&self) -> f64 {
        self.input_cost + self.output_cost
    }
}

impl fmt::Display for PipelineStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let score = self
            .score
            .map(|s| format!("{s:.4}"))
            .unwrap_or_else(|| "-".into());
        writeln!(f, "{:<16} {score}", "score")?;
        writeln!(f, "{:<16} {}", "input tokens", self.input_tokens)?;
        writeln!(f, "{:<16} {}", "output tokens", self.output_tokens)?;
        for (model, usage) in &self.tokens_by_model {
            writeln!(
                f,
                "  {model:<14} {} in / {} out",
                usage.input_tokens, usage.output_tokens
            )?;
        }
        writeln!(f, "{:<16} ${:.6}", "input cost", self.input_cost)?;
        writeln!(f, "{:<16} ${:.6}", "output cost", self.output_cost)?;
        writeln!(f, "{:<16} {:.2}s", "total latency", self.total_latency)?;
        writeln!(f, "{:<16} {}", "succeeded", self.num_success)?;
        write!(f, "{:<16} {}", "failed", self.num_failure)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// An ordered list of uniquely named steps.
pub struct Pipeline {
    steps: Vec<Box<dyn Step>>,
    evaluator: Option<Evaluator>,
    progress: Arc<dyn ProgressReporter>,
    data: Option<Dataset>,
    score: Option<f64>,
    statistics: PipelineStatistics,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let steps: Vec<&str> = self.steps.iter().map(|s| s.name()).collect();
        f.debug_struct("Pipeline")
            .field("steps", &steps)
            .field("evaluator", &self.evaluator)
            .field("score", &self.score)
            .finish()
    }
}

impl Pipeline {
    /// Fails on an empty step list or duplicate step names.
    pub fn new(steps: Vec<Box<dyn Step>>) -> Result<Self> {
        if steps.is_empty() {
            return Err(FieldforgeError::config("a pipeline needs at least one step"));
        }
        for (i, step) in steps.iter().enumerate() {
            if steps[..i].iter().any(|s| s.name() == step.name()) {
                return Err(FieldforgeError::config(format!(
                    "duplicate step name `{}`",
                    step.name()
                )));
            }
            if step.name() == GLOBAL_KEY {
                return Err(FieldforgeError::config(format!(
                    "`{GLOBAL_KEY}` is reserved and cannot name a step"
                )));
            }
        }
        Ok(Self {
            steps,
            evaluator: None,
            progress: Arc::new(SilentProgress),
            data: None,
            score: None,
            statistics: PipelineStatistics::default(),
        })
    }

    pub fn with_evaluator(mut self, evaluator: Evaluator) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> &dyn ProgressReporter {
        self.progress.as_ref()
    }

    pub fn steps(&self) -> &[Box<dyn Step>] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&dyn Step> {
        self.steps.iter().find(|s| s.name() == name).map(|s| s.as_ref())
    }

    pub fn evaluator(&self) -> Option<&Evaluator> {
        self.evaluator.as_ref()
    }

    /// Dataset produced by the last run.
    pub fn data(&self) -> Option<&Dataset> {
        self.data.as_ref()
    }

    pub fn take_data(&mut self) -> Option<Dataset> {
        self.data.take()
    }

    pub fn score(&self) -> Option<f64> {
        self.score
    }

    pub fn statistics(&self) -> &PipelineStatistics {
        &self.statistics
    }

    /// Current configuration of every step, keyed by step name.
    pub fn params(&self) -> GroupedParams {
        self.steps
            .iter()
            .map(|s| (s.name().to_string(), s.params()))
            .collect()
    }

    /// Digest over the steps' fingerprints, in order.
    pub fn fingerprint(&self, deep: bool) -> String {
        let steps: Vec<String> = self.steps.iter().map(|s| s.fingerprint(deep)).collect();
        content_hash(&json!(steps))
    }

    /// Run every step in order over `data`, then score and aggregate.
    ///
    /// The transformed dataset is kept as the pipeline's cached data.
    #[instrument(skip_all, fields(steps = self.steps.len(), rows = data.len()))]
    pub async fn run(&mut self, mut data: Dataset) -> Result<&Dataset> {
        self.score = None;
        self.data = None;
        self.statistics = PipelineStatistics::default();
        info!("running pipeline");

        for step in &mut self.steps {
            step.run(&mut data, self.progress.as_ref()).await?;
        }

        if let Some(evaluator) = &self.evaluator {
            if data.is_table() {
                self.score = score_records(evaluator, &mut data);
            }
        }
        self.statistics = self.aggregate(&data);
        info!(
            score = ?self.score,
            success = self.statistics.num_success,
            failure = self.statistics.num_failure,
            cost = self.statistics.total_cost(),
            "pipeline finished"
        );
        let data: &Dataset = self.data.insert(data);
        Ok(data)
    }

    /// Forward overrides to every step: step-specific on top of `global`.
    pub fn update_params(&mut self, params: &GroupedParams) -> Result<()> {
        if let Some(group) = params
            .keys()
            .find(|g| g.as_str() != GLOBAL_KEY && self.step(g).is_none())
        {
            return Err(FieldforgeError::validation(format!(
                "parameters given for unknown step `{group}`"
            )));
        }

        let global = params.get(GLOBAL_KEY);
        let merged: Vec<Params> = self
            .steps
            .iter()
            .map(|step| {
                let known = step.param_names();
                let mut merged: Params = global
                    .into_iter()
                    .flatten()
                    .filter(|(k, _)| known.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                if let Some(own) = params.get(step.name()) {
                    merged.extend(own.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                merged
            })
            .collect();

        let mut applied: Vec<(usize, Params, StepStatistics)> = Vec::new();
        for (index, merged) in merged.iter().enumerate() {
            let step = &mut self.steps[index];
            let mut previous = step.params();
            previous.retain(|k, _| merged.contains_key(k));
            let statistics = step.statistics().clone();
            if let Err(e) = step.update_params(merged) {
                self.roll_back(applied);
                return Err(e);
            }
            applied.push((index, previous, statistics));
        }
        Ok(())
    }

    /// Put already-updated steps back to their previous parameters and statistics.
    fn roll_back(&mut self, applied: Vec<(usize, Params, StepStatistics)>) {
        for (index, previous, statistics) in applied.into_iter().rev() {
            let step = &mut self.steps[index];
            if let Err(e) = step.configure(&previous) {
                warn!(step = %step.name(), error = %e, "could not restore parameters");
            }
            step.core_mut().restore_statistics(statistics);
        }
    }

    /// Recompute the score over the cached table.
    ///
    /// Uses `evaluator`, falling back to the pipeline's own. Logs a warning
    /// and returns `None` when there is no evaluator or no cached table.
    pub fn evaluate(&mut self, evaluator: Option<&Evaluator>) -> Option<f64> {
        let Some(evaluator) = evaluator.or(self.evaluator.as_ref()) else {
            warn!("no evaluator set; skipping evaluation");
            return None;
        };
        let Some(data) = self.data.as_mut().filter(|d| d.is_table()) else {
            warn!("no cached table; run the pipeline before evaluating");
            return None;
        };
        let score = score_records(evaluator, data);
        self.score = score;
        self.statistics.score = score;
        score
    }

    fn aggregate(&self, data: &Dataset) -> PipelineStatistics {
        let mut stats = PipelineStatistics {
            score: self.score,
            ..Default::default()
        };
        for step in &self.steps {
            let s = step.statistics();
            stats.input_tokens += s.input_tokens;
            stats.output_tokens += s.output_tokens;
            stats.input_cost += s.input_cost;
            stats.output_cost += s.output_cost;
            stats.total_latency += s.total_latency;
            for (model, usage) in &s.tokens_by_model {
                stats.tokens_by_model.entry(model.clone()).or_default().add(*usage);
            }
        }

        let columns: Vec<String> = self.steps.iter().map(|s| meta_column(s.name())).collect();
        for record in data.records() {
            let ok = columns.iter().all(|c| {
                record
                    .get(c)
                    .and_then(RowMeta::success_of)
                    .unwrap_or(false)
            });
            if ok {
                stats.num_success += 1;
            } else {
                stats.num_failure += 1;
            }
        }
        stats
    }
}
