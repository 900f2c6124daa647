//! Spinner-based progress reporting for interactive runs.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use ledgerflow_core::{ProgressReporter, StageReport};
use ledgerflow_shared::Stage;

/// CLI progress reporter using an indicatif spinner on stderr.
pub(crate) struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    pub(crate) fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    pub(crate) fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn unit_done(&self, stage: Stage, unit: &str, current: usize, total: usize) {
        let short: String = unit.chars().take(12).collect();
        self.spinner
            .set_message(format!("{stage} [{current}/{total}] {short}"));
    }

    fn done(&self, report: &StageReport) {
        self.spinner.set_message(format!(
            "{} done: {} processed, {} unchanged, {} failed",
            report.stage,
            report.processed,
            report.unchanged,
            report.failed.len()
        ));
    }
}

impl Drop for CliProgress {
    fn drop(&mut self) {
        if !self.spinner.is_finished() {
            self.spinner.finish_and_clear();
        }
    }
}
