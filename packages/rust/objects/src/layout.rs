//! Deterministic key layout.
//!
//! - raw input:   `{date}/{name}`
//! - transformed: `{dir}/processed_{name}.{content_hash}`
//! - scored:      `{dir}/predictions_{name}.{content_hash}.parquet`
//!
//! Derived keys are a pure function of the unit's source key and content
//! hash. A redone stage writes to the same place, while new bytes uploaded
//! under an already-seen raw key get their own artifacts. Derived keys are
//! siblings of the raw key, never nested under it.

use chrono::NaiveDate;

use ledgerflow_shared::{LedgerflowError, Result};

/// Prefix marking transformed artifacts.
pub const PROCESSED_PREFIX: &str = "processed_";

/// Prefix marking scored output.
pub const PREDICTIONS_PREFIX: &str = "predictions_";

/// Extension of scored output.
pub const PREDICTIONS_EXT: &str = "parquet";

/// Split a key into `(dir, name)`. `dir` is empty for top-level keys.
pub fn split_key(key: &str) -> (&str, &str) {
    match key.rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => ("", key),
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Key of a newly uploaded raw unit.
pub fn raw_key(date: NaiveDate, name: &str) -> String {
    format!("{}/{name}", date.format("%Y-%m-%d"))
}

fn unit_parts<'a>(source_key: &'a str, content_hash: &str) -> Result<(&'a str, &'a str)> {
    let (dir, name) = split_key(source_key);
    if name.is_empty() {
        return Err(LedgerflowError::validation(format!(
            "source key has no file name: {source_key}"
        )));
    }
    if content_hash.is_empty() || content_hash.contains('/') {
        return Err(LedgerflowError::validation(format!(
            "invalid content hash for {source_key}: {content_hash:?}"
        )));
    }
    Ok((dir, name))
}

/// Key of the transformed artifact for the unit `content_hash` first seen at
/// `source_key`.
pub fn transformed_key(source_key: &str, content_hash: &str) -> Result<String> {
    let (dir, name) = unit_parts(source_key, content_hash)?;
    Ok(join(dir, &format!("{PROCESSED_PREFIX}{name}.{content_hash}")))
}

/// Key of the scored output for the unit `content_hash` first seen at
/// `source_key`.
pub fn scored_key(source_key: &str, content_hash: &str) -> Result<String> {
    let (dir, name) = unit_parts(source_key, content_hash)?;
    Ok(join(
        dir,
        &format!("{PREDICTIONS_PREFIX}{name}.{content_hash}.{PREDICTIONS_EXT}"),
    ))
}
