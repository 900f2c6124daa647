//! Batch-level change detection against a name → digest side file.
//!
//! Granularity is deliberately coarse: one changed or new entry means the
//! whole batch is reprocessed. Per-unit dedup is the ledger's job.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};

use ledgerflow_shared::{LedgerflowError, Result};

use crate::digest_file;

// ---------------------------------------------------------------------------
// ChangeDigest
// ---------------------------------------------------------------------------

/// Mapping from unit name to content digest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeDigest {
    entries: BTreeMap<String, String>,
}

impl ChangeDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, digest: impl Into<String>) {
        self.entries.insert(name.into(), digest.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Digest every file in `dir` whose name starts with `prefix`.
    pub fn from_dir(dir: &Path, prefix: &str) -> Result<Self> {
        let read = std::fs::read_dir(dir).map_err(|e| LedgerflowError::io(dir, e))?;
        let mut digest = Self::new();

        for entry in read {
            let entry = entry.map_err(|e| LedgerflowError::io(dir, e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(prefix) {
                continue;
            }
            digest.insert(name, digest_file(&path)?);
        }

        Ok(digest)
    }

    /// Load a side file. Returns `None` when it does not exist yet.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).map_err(|e| LedgerflowError::io(path, e))?;
        let entries: BTreeMap<String, String> = serde_json::from_str(&content).map_err(|e| {
            LedgerflowError::validation(format!("invalid hash file {}: {e}", path.display()))
        })?;
        Ok(Some(Self { entries }))
    }

    /// Write the side file, replacing any previous version.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| LedgerflowError::validation(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| LedgerflowError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| LedgerflowError::io(path, e))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// True iff any current name is missing from `stored` or its digest differs.
pub fn should_reprocess(current: &ChangeDigest, stored: &ChangeDigest) -> bool {
    current
        .iter()
        .any(|(name, digest)| stored.get(name) != Some(digest))
}

/// Per-name comparison of a stored side file with the current batch.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BatchDiff {
    /// Names not present in the side file.
    pub new_units: Vec<String>,
    /// Names whose digest changed.
    pub changed_units: Vec<String>,
    /// Names with matching digests.
    pub unchanged_units: Vec<String>,
    /// Names in the side file that are gone from the batch.
    pub removed_units: Vec<String>,
}

impl BatchDiff {
    /// Whether the diff forces reprocessing. Removals alone do not.
    pub fn requires_reprocess(&self) -> bool {
        !self.new_units.is_empty() || !self.changed_units.is_empty()
    }
}

/// Compute the diff between a stored side file and the current digests.
pub fn diff_digests(stored: &ChangeDigest, current: &ChangeDigest) -> BatchDiff {
    let current_names: HashSet<&str> = current.iter().map(|(n, _)| n).collect();
    let mut diff = BatchDiff::default();

    for (name, digest) in current.iter() {
        match stored.get(name) {
            Some(old) if old == digest => diff.unchanged_units.push(name.to_string()),
            Some(_) => diff.changed_units.push(name.to_string()),
            None => diff.new_units.push(name.to_string()),
        }
    }

    for (name, _) in stored.iter() {
        if !current_names.contains(name) {
            diff.removed_units.push(name.to_string());
        }
    }

    diff
}

/// Why the batch detector decided what it decided.
#[derive(Debug, PartialEq, Eq)]
pub enum BatchDecision {
    /// No side file yet: the batch has never been processed.
    FirstRun,
    /// Caller asked to skip the comparison.
    Forced,
    /// Something changed since the side file was written.
    Changed(BatchDiff),
    /// Side file matches the batch.
    Unchanged,
}

impl BatchDecision {
    pub fn should_process(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Result of [`check_batch`].
#[derive(Debug)]
pub struct BatchCheck {
    pub decision: BatchDecision,
    /// Digests of the batch as it is now.
    pub current: ChangeDigest,
    /// Location of the side file.
    pub hash_file: PathBuf,
}

/// Decide whether the batch in `dir` needs processing and, if so, rewrite the
/// side file with the current digests.
///
/// The side file is written before the caller processes the batch, so a crash
/// during processing is not detected by this layer; the ledger covers that.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn check_batch(dir: &Path, hash_file: &str, prefix: &str, force: bool) -> Result<BatchCheck> {
    let hash_path = dir.join(hash_file);
    let current = ChangeDigest::from_dir(dir, prefix)?;

    let decision = if force {
        info!("forced batch processing");
        BatchDecision::Forced
    } else {
        match ChangeDigest::load(&hash_path)? {
            None => {
                info!("hash record does not exist, batch will be processed");
                BatchDecision::FirstRun
            }
            Some(stored) => {
                let diff = diff_digests(&stored, &current);
                for name in &diff.changed_units {
                    warn!(%name, "digest mismatch, batch must be reprocessed");
                }
                if should_reprocess(&current, &stored) {
                    BatchDecision::Changed(diff)
                } else {
                    info!(units = current.len(), "digests match, batch is unchanged");
                    BatchDecision::Unchanged
                }
            }
        }
    };

    if decision.should_process() {
        current.save(&hash_path)?;
    }

    Ok(BatchCheck {
        decision,
        current,
        hash_file: hash_path,
    })
}
