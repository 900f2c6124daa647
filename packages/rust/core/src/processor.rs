//! Generic "find new work, do work, commit result" stage processor.
//!
//! 1. Discover pending records via the ledger
//! 2. Fetch each record's input from the object store
//! 3. Run the stage transform
//! 4. Write the result at a deterministic key derived from the input key
//! 5. Commit the output key to the ledger
//!
//! Steps 2–4 are isolated per unit: a failure is recorded and the next unit
//! continues. Commit failures propagate, since the ledger is shared state and
//! the whole invocation is safe to retry.

use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, instrument, warn};

use ledgerflow_shared::{
    ErrorKind, ErrorPayload, LedgerRecord, LedgerflowError, Result, Stage, UnitFailure,
};
use ledgerflow_storage::CommitOutcome;

use crate::context::PipelineContext;
use crate::progress::ProgressReporter;

/// The stage-specific part of a ledger-backed stage.
#[async_trait]
pub trait UnitTransform: Send + Sync {
    /// Stage whose ledger column this transform fills.
    fn stage(&self) -> Stage;

    /// Deterministic output key for `record`. Must be a pure function of the
    /// record's identity (content hash and source key).
    fn output_key(&self, record: &LedgerRecord) -> Result<String>;

    /// Produce the output artifact from the input artifact.
    async fn apply(&self, record: &LedgerRecord, input: Vec<u8>) -> Result<Vec<u8>>;
}

/// Per-invocation options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Redo units whose output is already committed. Outputs land on the
    /// same keys, so the ledger sees an idempotent re-commit.
    pub force: bool,
}

/// Structured outcome of one stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    /// Units the discovery step returned.
    pub discovered: usize,
    /// Units whose output was newly committed (or newly registered, for ingest).
    pub processed: usize,
    /// Units that were already done when this invocation reached them.
    pub unchanged: usize,
    /// Units that failed in fetch, transform or write.
    pub failed: Vec<UnitFailure>,
    pub elapsed_ms: u64,
}

impl StageReport {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            discovered: 0,
            processed: 0,
            unchanged: 0,
            failed: Vec::new(),
            elapsed_ms: 0,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Structured failure payload when any unit failed.
    pub fn failure_payload(&self) -> Option<ErrorPayload> {
        if self.failed.is_empty() {
            return None;
        }
        Some(ErrorPayload {
            kind: ErrorKind::UpstreamTransform,
            message: format!(
                "{}: {} of {} units failed",
                self.stage,
                self.failed.len(),
                self.discovered
            ),
            units: self.failed.clone(),
        })
    }

    pub(crate) fn finish(mut self, start: Instant) -> Self {
        self.elapsed_ms = start.elapsed().as_millis() as u64;
        self
    }
}

/// Run one invocation of a ledger-backed stage.
#[instrument(skip_all, fields(stage = %transform.stage(), force = opts.force))]
pub async fn run_stage(
    ctx: &PipelineContext,
    transform: &dyn UnitTransform,
    opts: RunOptions,
    progress: &dyn ProgressReporter,
) -> Result<StageReport> {
    let start = Instant::now();
    let stage = transform.stage();
    let mut report = StageReport::new(stage);

    progress.phase(&format!("Discovering {stage} work"));
    let records = if opts.force {
        ctx.ledger.find_ready_for(stage).await?
    } else {
        ctx.ledger.find_pending_for(stage).await?
    };
    report.discovered = records.len();
    info!(pending = records.len(), "discovered work");

    progress.phase(&format!("Running {stage}"));
    let total = records.len();
    for (i, record) in records.iter().enumerate() {
        match process_unit(ctx, transform, record).await {
            Ok(output_key) => {
                match ctx
                    .ledger
                    .commit_stage_output(&record.content_hash, stage, &output_key)
                    .await?
                {
                    CommitOutcome::Committed => report.processed += 1,
                    CommitOutcome::AlreadyCommitted => report.unchanged += 1,
                }
            }
            Err(e) => {
                warn!(content_hash = %record.content_hash, error = %e, "unit failed");
                report.failed.push(UnitFailure::new(&record.content_hash, &e));
            }
        }
        progress.unit_done(stage, &record.content_hash, i + 1, total);
    }

    let report = report.finish(start);
    info!(
        processed = report.processed,
        unchanged = report.unchanged,
        failed = report.failed.len(),
        elapsed_ms = report.elapsed_ms,
        "stage complete"
    );
    progress.done(&report);
    Ok(report)
}

/// Steps 2–4 for one record. Returns the key the output was written to.
async fn process_unit(
    ctx: &PipelineContext,
    transform: &dyn UnitTransform,
    record: &LedgerRecord,
) -> Result<String> {
    let stage = transform.stage();
    let input_key = record.input_for(stage).ok_or_else(|| {
        LedgerflowError::not_found(format!(
            "{stage} input of {} (prerequisite output unset)",
            record.content_hash
        ))
    })?;

    let output_key = transform.output_key(record)?;
    let input = ctx.objects.get(&ctx.bucket, input_key).await?;
    let output = transform.apply(record, input).await?;
    ctx.objects.put(&ctx.bucket, &output_key, &output).await?;
    Ok(output_key)
}
