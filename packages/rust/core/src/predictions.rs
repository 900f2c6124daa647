//! Prediction table: the scored artifact.
//!
//! One row per observation with its class probabilities, the predicted label
//! (argmax) and that label's probability. Every field is nullable so that
//! partially-populated outputs can still be monitored.

use serde::{Deserialize, Serialize};

use ledgerflow_shared::{LedgerflowError, Result};

/// Raw scorer output, before packaging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawScores {
    /// Observation identifiers, aligned with `probabilities`.
    #[serde(default)]
    pub ids: Vec<Option<String>>,
    /// Class probabilities per observation.
    pub probabilities: Vec<Vec<f64>>,
}

/// One scored observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    #[serde(default)]
    pub id: Option<String>,
    /// Probability per class index.
    #[serde(default)]
    pub p: Vec<Option<f64>>,
    #[serde(default)]
    pub label: Option<i64>,
    #[serde(default)]
    pub p_label: Option<f64>,
}

/// A scored output or reference dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionTable {
    pub rows: Vec<PredictionRow>,
}

impl PredictionTable {
    /// Package raw probabilities: `label = argmax(p)`, `p_label = max(p)`.
    pub fn package(scores: RawScores) -> Result<Self> {
        if !scores.ids.is_empty() && scores.ids.len() != scores.probabilities.len() {
            return Err(LedgerflowError::validation(format!(
                "{} ids for {} probability rows",
                scores.ids.len(),
                scores.probabilities.len()
            )));
        }

        let mut ids = scores.ids.into_iter();
        let rows = scores
            .probabilities
            .into_iter()
            .map(|p| {
                let best = argmax(&p);
                PredictionRow {
                    id: ids.next().flatten(),
                    label: best.map(|(i, _)| i as i64),
                    p_label: best.map(|(_, v)| v),
                    p: p.into_iter().map(|v| (!v.is_nan()).then_some(v)).collect(),
                }
            })
            .collect();

        Ok(Self { rows })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| LedgerflowError::validation(format!("invalid prediction table: {e}")))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| LedgerflowError::validation(format!("prediction table encode: {e}")))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Widest probability vector in the table.
    pub fn class_count(&self) -> usize {
        self.rows.iter().map(|r| r.p.len()).max().unwrap_or(0)
    }

    /// Non-null predicted labels.
    pub fn labels(&self) -> Vec<i64> {
        self.rows.iter().filter_map(|r| r.label).collect()
    }

    /// Null cells over all cells, treating the table as `id, p_0..p_n, label, p_label`.
    pub fn missing_value_share(&self) -> f64 {
        let columns = 3 + self.class_count();
        let total = self.rows.len() * columns;
        if total == 0 {
            return 0.0;
        }

        let missing: usize = self
            .rows
            .iter()
            .map(|r| {
                let probs = (0..columns - 3)
                    .filter(|&i| r.p.get(i).copied().flatten().is_none())
                    .count();
                probs
                    + usize::from(r.id.is_none())
                    + usize::from(r.label.is_none())
                    + usize::from(r.p_label.is_none())
            })
            .sum();

        missing as f64 / total as f64
    }
}

/// First index of the largest non-NaN value.
fn argmax(p: &[f64]) -> Option<(usize, f64)> {
    p.iter()
        .copied()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .fold(None, |best, (i, v)| match best {
            Some((_, bv)) if bv >= v => best,
            _ => Some((i, v)),
        })
}
