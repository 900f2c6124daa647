//! The four pipeline stages and the chain that runs them in order.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use regex::RegexSet;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use ledgerflow_changes::digest;
use ledgerflow_objects::layout;
use ledgerflow_shared::{LedgerRecord, LedgerflowError, Result, Stage, UnitFailure};

use crate::bridge::Collaborator;
use crate::context::PipelineContext;
use crate::monitor::run_monitor;
use crate::predictions::{PredictionTable, RawScores};
use crate::processor::{RunOptions, StageReport, UnitTransform, run_stage};
use crate::progress::ProgressReporter;

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

/// Compile the ingest exclusion rules.
pub fn exclusion_set(patterns: &[String]) -> Result<RegexSet> {
    RegexSet::new(patterns)
        .map_err(|e| LedgerflowError::config(format!("invalid ingest exclude pattern: {e}")))
}

/// List the raw prefix, hash every candidate object and register hashes not
/// yet in the ledger.
#[instrument(skip_all, fields(bucket = %ctx.bucket, prefix = %ctx.raw_prefix))]
pub async fn run_ingest(
    ctx: &PipelineContext,
    progress: &dyn ProgressReporter,
) -> Result<StageReport> {
    let start = Instant::now();
    let mut report = StageReport::new(Stage::Ingest);
    let excluded = exclusion_set(&ctx.exclude_patterns)?;

    progress.phase("Listing raw inputs");
    let candidates: Vec<_> = ctx
        .objects
        .list(&ctx.bucket, &ctx.raw_prefix)
        .await?
        .into_iter()
        .filter(|obj| {
            let skip = excluded.is_match(&obj.key);
            if skip {
                debug!(key = %obj.key, "excluded from ingest");
            }
            !skip
        })
        .collect();
    report.discovered = candidates.len();
    info!(candidates = candidates.len(), "raw inputs listed");

    progress.phase("Hashing and registering");
    let total = candidates.len();
    for (i, obj) in candidates.iter().enumerate() {
        match ctx.objects.get(&ctx.bucket, &obj.key).await {
            Ok(bytes) => {
                let content_hash = digest(&bytes);
                let registration = ctx
                    .ledger
                    .register_if_absent(&content_hash, &obj.key)
                    .await?;
                if registration.created {
                    report.processed += 1;
                } else {
                    if registration.record.source_path != obj.key {
                        debug!(
                            key = %obj.key,
                            first_seen = %registration.record.source_path,
                            "duplicate content under another key"
                        );
                    }
                    report.unchanged += 1;
                }
            }
            Err(e) => {
                warn!(key = %obj.key, error = %e, "could not read raw input");
                report.failed.push(UnitFailure::new(&obj.key, &e));
            }
        }
        progress.unit_done(Stage::Ingest, &obj.key, i + 1, total);
    }

    let report = report.finish(start);
    info!(
        registered = report.processed,
        known = report.unchanged,
        failed = report.failed.len(),
        "ingest complete"
    );
    progress.done(&report);
    Ok(report)
}

// ---------------------------------------------------------------------------
// Transform and score
// ---------------------------------------------------------------------------

/// Feature derivation: raw input → `{dir}/processed_{name}.{hash}`.
pub struct TransformStage {
    collaborator: Arc<dyn Collaborator>,
}

impl TransformStage {
    pub fn new(collaborator: Arc<dyn Collaborator>) -> Self {
        Self { collaborator }
    }
}

#[async_trait]
impl UnitTransform for TransformStage {
    fn stage(&self) -> Stage {
        Stage::Transform
    }

    fn output_key(&self, record: &LedgerRecord) -> Result<String> {
        layout::transformed_key(&record.source_path, &record.content_hash)
    }

    async fn apply(&self, record: &LedgerRecord, input: Vec<u8>) -> Result<Vec<u8>> {
        self.collaborator
            .invoke(Stage::Transform, &record.content_hash, &input)
            .await
    }
}

/// Scoring: transformed artifact → `{dir}/predictions_{name}.{hash}.parquet`.
pub struct ScoreStage {
    collaborator: Arc<dyn Collaborator>,
}

impl ScoreStage {
    pub fn new(collaborator: Arc<dyn Collaborator>) -> Self {
        Self { collaborator }
    }
}

#[async_trait]
impl UnitTransform for ScoreStage {
    fn stage(&self) -> Stage {
        Stage::Score
    }

    fn output_key(&self, record: &LedgerRecord) -> Result<String> {
        layout::scored_key(&record.source_path, &record.content_hash)
    }

    async fn apply(&self, record: &LedgerRecord, input: Vec<u8>) -> Result<Vec<u8>> {
        let unit = &record.content_hash;
        let raw = self
            .collaborator
            .invoke(Stage::Score, unit, &input)
            .await?;
        let scores: RawScores = serde_json::from_slice(&raw)
            .map_err(|e| LedgerflowError::upstream(unit, format!("invalid scorer output: {e}")))?;
        PredictionTable::package(scores)
            .map_err(|e| LedgerflowError::upstream(unit, e.to_string()))?
            .to_bytes()
    }
}

pub async fn run_transform(
    ctx: &PipelineContext,
    opts: RunOptions,
    progress: &dyn ProgressReporter,
) -> Result<StageReport> {
    let stage = TransformStage::new(Arc::clone(&ctx.collaborator));
    run_stage(ctx, &stage, opts, progress).await
}

pub async fn run_score(
    ctx: &PipelineContext,
    opts: RunOptions,
    progress: &dyn ProgressReporter,
) -> Result<StageReport> {
    let stage = ScoreStage::new(Arc::clone(&ctx.collaborator));
    run_stage(ctx, &stage, opts, progress).await
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// Reports of one ingest → transform → score → monitor chain.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub stages: Vec<StageReport>,
}

impl PipelineReport {
    pub fn is_clean(&self) -> bool {
        self.stages.iter().all(StageReport::is_clean)
    }
}

/// Run all four stages in order, as one workflow execution does.
///
/// Each stage commits independently; a stage error stops the chain and
/// leaves earlier stages' commits in place.
#[instrument(skip_all)]
pub async fn run_pipeline(
    ctx: &PipelineContext,
    opts: RunOptions,
    progress: &dyn ProgressReporter,
) -> Result<PipelineReport> {
    let mut report = PipelineReport::default();
    report.stages.push(run_ingest(ctx, progress).await?);
    report.stages.push(run_transform(ctx, opts, progress).await?);
    report.stages.push(run_score(ctx, opts, progress).await?);
    report.stages.push(run_monitor(ctx, progress).await?);
    Ok(report)
}
