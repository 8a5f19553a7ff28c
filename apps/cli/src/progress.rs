//! Terminal progress reporting.

use fieldforge_core::ProgressReporter;
use fieldforge_shared::{GroupedParams, params_to_json};
use indicatif::{ProgressBar, ProgressStyle};

/// CLI progress reporter: one bar, reset for every step.
pub(crate) struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    pub(crate) fn new() -> Self {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {msg:<24} [{bar:30.cyan/blue}] {pos}/{len} ({elapsed})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        bar.set_style(style);
        Self { bar }
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn step_started(&self, step: &str, rows: usize) {
        self.bar.reset();
        self.bar.set_length(rows as u64);
        self.bar.set_message(step.to_string());
    }

    fn row_done(&self, _step: &str, current: usize, _total: usize) {
        self.bar.set_position(current as u64);
    }

    fn config_started(&self, index: usize, total: usize, params: &GroupedParams) {
        self.bar
            .println(format!("config [{index}/{total}] {}", params_to_json(params)));
    }
}
