//! Progress callbacks for long-running steps, pipelines, and sweeps.

use fieldforge_shared::GroupedParams;

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called when a step starts processing `rows` records.
    fn step_started(&self, step: &str, rows: usize);
    /// Called after each record a step processes.
    fn row_done(&self, step: &str, current: usize, total: usize);
    /// Called when a grid search starts configuration `index` (1-based) of `total`.
    fn config_started(&self, index: usize, total: usize, params: &GroupedParams);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn step_started(&self, _step: &str, _rows: usize) {}
    fn row_done(&self, _step: &str, _current: usize, _total: usize) {}
    fn config_started(&self, _index: usize, _total: usize, _params: &GroupedParams) {}
}
