//! Progress callbacks for long-running invocations.

use ledgerflow_shared::Stage;

use crate::processor::StageReport;

/// Progress callback for reporting stage status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called after each unit of a stage, successful or not.
    fn unit_done(&self, stage: Stage, unit: &str, current: usize, total: usize);
    /// Called when a stage invocation completes.
    fn done(&self, report: &StageReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn unit_done(&self, _stage: Stage, _unit: &str, _current: usize, _total: usize) {}
    fn done(&self, _report: &StageReport) {}
}
