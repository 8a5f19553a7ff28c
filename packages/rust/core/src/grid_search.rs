//! Parameter sweeps: run a pipeline once per configuration and rank by score.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, instrument, warn};

use fieldforge_shared::{
    Dataset, FieldforgeError, GLOBAL_KEY, GroupedParams, ParamGrid, ParamValue, Result, config_id,
    flatten_params,
};

use crate::export;
use crate::pipeline::{Pipeline, PipelineStatistics};

/// Expand a grid into complete configurations.
///
/// Cartesian product over every (step, param) axis in insertion order, the
/// last axis varying fastest. An axis with no values is an error.
pub fn expand_grid(grid: &ParamGrid) -> Result<Vec<GroupedParams>> {
    let axes = grid.axes();
    if let Some(empty) = axes.iter().find(|a| a.values.is_empty()) {
        return Err(FieldforgeError::validation(format!(
            "grid parameter `{}.{}` has no values",
            empty.step, empty.param
        )));
    }
    if axes.is_empty() {
        return Ok(Vec::new());
    }

    let total = grid.size();
    let mut configs = Vec::with_capacity(total);
    let mut cursor = vec![0usize; axes.len()];
    for _ in 0..total {
        let mut config = GroupedParams::new();
        for (axis, &i) in axes.iter().zip(&cursor) {
            config
                .entry(axis.step.clone())
                .or_default()
                .insert(axis.param.clone(), axis.values[i].clone());
        }
        configs.push(config);

        // odometer: bump the last axis, carrying leftwards
        for (pos, axis) in axes.iter().enumerate().rev() {
            cursor[pos] += 1;
            if cursor[pos] < axis.values.len() {
                break;
            }
            cursor[pos] = 0;
        }
    }
    Ok(configs)
}

/// Outcome of one configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridResult {
    /// Content hash of `params`, also the name of the exported CSV.
    pub id: String,
    pub params: GroupedParams,
    pub score: Option<f64>,
    pub statistics: PipelineStatistics,
}

impl GridResult {
    /// `step__param` keyed view of the configuration.
    pub fn flat_params(&self) -> Vec<(String, ParamValue)> {
        flatten_params(&self.params)
    }
}

/// Runs a pipeline over every configuration of a grid.
pub struct GridSearch {
    pipeline: Pipeline,
    configs: Vec<GroupedParams>,
    output_dir: Option<PathBuf>,
    results: Vec<GridResult>,
}

impl GridSearch {
    /// Expand `grid` for `pipeline`; every grid step must exist in the pipeline.
    pub fn new(pipeline: Pipeline, grid: &ParamGrid) -> Result<Self> {
        if let Some(axis) = grid
            .axes()
            .iter()
            .find(|a| a.step != GLOBAL_KEY && pipeline.step(&a.step).is_none())
        {
            return Err(FieldforgeError::validation(format!(
                "grid names unknown step `{}`",
                axis.step
            )));
        }
        let configs = expand_grid(grid)?;
        Ok(Self {
            pipeline,
            configs,
            output_dir: None,
            results: Vec::new(),
        })
    }

    /// Write each configuration's dataset to `<dir>/<id>.csv`.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn configs(&self) -> &[GroupedParams] {
        &self.configs
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn into_pipeline(self) -> Pipeline {
        self.pipeline
    }

    pub fn results(&self) -> &[GridResult] {
        &self.results
    }

    /// Run every configuration in order on a fresh copy of `data`.
    ///
    /// A configuration identical to an earlier one reuses its result.
    #[instrument(skip_all, fields(configs = self.configs.len(), rows = data.len()))]
    pub async fn run(&mut self, data: &Dataset) -> Result<&[GridResult]> {
        self.results.clear();
        if let Some(dir) = &self.output_dir {
            std::fs::create_dir_all(dir).map_err(|e| FieldforgeError::io(dir, e))?;
        }

        let total = self.configs.len();
        let mut seen: HashMap<String, usize> = HashMap::new();
        info!(total, "starting grid search");

        for (index, params) in self.configs.iter().enumerate() {
            let id = config_id(params);
            self.pipeline.progress().config_started(index + 1, total, params);

            if let Some(&earlier) = seen.get(&id) {
                warn!(%id, "duplicate configuration; reusing earlier result");
                let repeat = self.results[earlier].clone();
                self.results.push(repeat);
                continue;
            }

            self.pipeline.update_params(params)?;
            let output = self.pipeline.run(data.clone()).await?;
            if let Some(dir) = &self.output_dir {
                export::write_dataset(output, &dir.join(format!("{id}.csv")))?;
            }

            let result = GridResult {
                id: id.clone(),
                params: params.clone(),
                score: self.pipeline.score(),
                statistics: self.pipeline.statistics().clone(),
            };
            info!(%id, index = index + 1, score = ?result.score, "configuration finished");
            seen.insert(id, self.results.len());
            self.results.push(result);
        }

        if let Some(best) = self.best() {
            info!(id = %best.id, score = ?best.score, "best configuration");
        }
        Ok(&self.results)
    }

    /// First result with the maximum score; unscored results never win.
    pub fn best(&self) -> Option<&GridResult> {
        let mut best: Option<&GridResult> = None;
        for result in &self.results {
            let Some(score) = result.score else { continue };
            if best.and_then(|b| b.score).is_none_or(|b| score > b) {
                best = Some(result);
            }
        }
        best
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best().and_then(|b| b.score)
    }

    pub fn best_params(&self) -> Option<&GroupedParams> {
        self.best().map(|b| &b.params)
    }

    /// Write the results table (one row per configuration) to `path`.
    pub fn write_summary(&self, path: &Path) -> Result<()> {
        export::write_summary(&self.results, path)
    }
}
