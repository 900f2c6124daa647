//! Feed loop: upload local data files one at a time under dated keys and
//! drive one workflow execution per upload.
//!
//! The loop stops at the first execution that does not succeed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use ledgerflow_objects::{ObjectStore, layout};
use ledgerflow_shared::{LedgerflowError, Result};

use crate::driver::{ExecutionDriver, ExecutionStatus};

/// Feed loop settings.
#[derive(Debug, Clone)]
pub struct FeedOptions {
    /// Directory holding the data files.
    pub data_dir: PathBuf,
    /// Only files starting with this prefix are fed.
    pub file_prefix: String,
    /// Date of the first upload; each later file is one day later.
    pub start_date: NaiveDate,
    /// Maximum number of files to feed (`None` = all).
    pub limit: Option<usize>,
    /// Pause between an upload and starting its execution.
    pub settle: Duration,
    /// Pause between consecutive runs.
    pub interval: Duration,
}

/// Result of one upload + execution.
#[derive(Debug, Clone, Serialize)]
pub struct FeedRun {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of a feed loop.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeedReport {
    pub runs: Vec<FeedRun>,
    /// True when an execution failed and the remaining files were not fed.
    pub stopped_early: bool,
}

/// Files in `dir` starting with `prefix`, sorted by name.
pub fn feed_files(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let read = std::fs::read_dir(dir).map_err(|e| LedgerflowError::io(dir, e))?;
    let mut files = Vec::new();
    for entry in read {
        let entry = entry.map_err(|e| LedgerflowError::io(dir, e))?;
        let path = entry.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(prefix));
        if matches && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

async fn pause(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    if duration.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(LedgerflowError::Cancelled("feed loop interrupted".into())),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Run the feed loop against `workflow_name`.
#[instrument(skip_all, fields(dir = %opts.data_dir.display(), workflow = workflow_name))]
pub async fn run_feed(
    objects: Arc<dyn ObjectStore>,
    bucket: &str,
    driver: &ExecutionDriver,
    workflow_name: &str,
    opts: &FeedOptions,
    cancel: &CancellationToken,
) -> Result<FeedReport> {
    let mut files = feed_files(&opts.data_dir, &opts.file_prefix)?;
    if let Some(limit) = opts.limit {
        files.truncate(limit);
    }
    if files.is_empty() {
        return Err(LedgerflowError::not_found(format!(
            "no '{}*' files in {}",
            opts.file_prefix,
            opts.data_dir.display()
        )));
    }

    let workflow = driver.discover(workflow_name).await?;
    let input = json!({ "data_bucket_name": bucket });
    let mut report = FeedReport::default();

    for (i, file) in files.iter().enumerate() {
        let date = opts
            .start_date
            .checked_add_days(Days::new(i as u64))
            .ok_or_else(|| LedgerflowError::validation("feed date out of range"))?;
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| LedgerflowError::validation(format!("bad file name {}", file.display())))?;
        let key = layout::raw_key(date, name);

        let bytes = tokio::fs::read(file)
            .await
            .map_err(|e| LedgerflowError::io(file, e))?;
        info!(%bucket, %key, size = bytes.len(), "uploading");
        objects.put(bucket, &key, &bytes).await?;
        pause(opts.settle, cancel).await?;

        match driver.run(&workflow, &input, cancel).await {
            Ok(outcome) => report.runs.push(FeedRun {
                key,
                execution_id: Some(outcome.execution.execution_id),
                status: outcome.status.to_string(),
                error: None,
            }),
            Err(LedgerflowError::ExecutionFailure {
                execution,
                status,
                error: detail,
            }) => {
                error!(%execution, %status, error = ?detail, "pipeline failed, stopping feed");
                report.runs.push(FeedRun {
                    key,
                    execution_id: Some(execution),
                    status,
                    error: detail,
                });
                report.stopped_early = i + 1 < files.len();
                break;
            }
            Err(e) => return Err(e),
        }

        if i + 1 < files.len() {
            pause(opts.interval, cancel).await?;
        }
    }

    let succeeded = report
        .runs
        .iter()
        .filter(|r| r.status == ExecutionStatus::Succeeded.as_str())
        .count();
    info!(runs = report.runs.len(), succeeded, "feed complete");
    Ok(report)
}
