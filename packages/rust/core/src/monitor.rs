//! Drift monitor stage.
//!
//! Discovery is the set difference between scored outputs in the ledger and
//! outputs already observed in the metrics table, so a second run over the
//! same outputs appends nothing. The metrics table is append-only.

use std::time::Instant;

use tracing::{info, instrument, warn};

use ledgerflow_shared::{LedgerflowError, MetricsRecord, Result, Stage, UnitFailure};

use crate::context::PipelineContext;
use crate::drift::compute_metrics;
use crate::predictions::PredictionTable;
use crate::processor::StageReport;
use crate::progress::ProgressReporter;

/// Observe every scored output that has no metrics row yet.
#[instrument(skip_all, fields(reference = %ctx.reference_key))]
pub async fn run_monitor(
    ctx: &PipelineContext,
    progress: &dyn ProgressReporter,
) -> Result<StageReport> {
    let start = Instant::now();
    let mut report = StageReport::new(Stage::Monitor);

    progress.phase("Discovering unobserved outputs");
    let pending = ctx.ledger.find_pending_for(Stage::Monitor).await?;
    report.discovered = pending.len();
    info!(pending = pending.len(), "discovered unobserved outputs");
    if pending.is_empty() {
        let report = report.finish(start);
        progress.done(&report);
        return Ok(report);
    }

    progress.phase("Loading reference dataset");
    let reference = load_reference(ctx).await?;

    progress.phase("Computing drift metrics");
    let total = pending.len();
    for (i, record) in pending.iter().enumerate() {
        let Some(output_ref) = record.outputs.scored_path.as_deref() else {
            continue;
        };

        match observe(ctx, output_ref, &reference).await {
            Ok(metrics) => {
                if ctx.ledger.append_metrics(&metrics).await? {
                    info!(
                        output_ref,
                        drift = metrics.drift_score,
                        dominant = metrics.dominant_value_share,
                        "metrics appended"
                    );
                    report.processed += 1;
                } else {
                    report.unchanged += 1;
                }
            }
            Err(e) => {
                warn!(output_ref, error = %e, "could not observe output");
                report.failed.push(UnitFailure::new(output_ref, &e));
            }
        }
        progress.unit_done(Stage::Monitor, output_ref, i + 1, total);
    }

    let report = report.finish(start);
    progress.done(&report);
    Ok(report)
}

async fn load_reference(ctx: &PipelineContext) -> Result<PredictionTable> {
    let bytes = ctx
        .objects
        .get(&ctx.bucket, &ctx.reference_key)
        .await
        .map_err(|e| match e {
            LedgerflowError::NotFound { .. } => LedgerflowError::not_found(format!(
                "reference dataset {}/{}",
                ctx.bucket, ctx.reference_key
            )),
            other => other,
        })?;
    PredictionTable::from_bytes(&bytes)
}

async fn observe(
    ctx: &PipelineContext,
    output_ref: &str,
    reference: &PredictionTable,
) -> Result<MetricsRecord> {
    let bytes = ctx.objects.get(&ctx.bucket, output_ref).await?;
    let current = PredictionTable::from_bytes(&bytes)?;
    compute_metrics(output_ref, &current, reference, ctx.drift_method)
}
