//! Distribution statistics for the drift monitor.
//!
//! Both drift statistics are bounded in `[0, 1]`:
//! - Jensen-Shannon distance (base 2): 0 for identical distributions, 1 for
//!   disjoint support. Higher means more drift.
//! - Chi-square goodness-of-fit p-value of the current label counts against
//!   the reference shares. Lower means more drift.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use statrs::distribution::{ChiSquared, ContinuousCDF};

use ledgerflow_shared::{DriftMethod, LedgerflowError, MetricsRecord, Result};

use crate::predictions::PredictionTable;

/// Additive smoothing for reference classes never observed.
const SMOOTHING: f64 = 1e-6;

/// Occurrences per label.
pub fn label_counts(labels: &[i64]) -> BTreeMap<i64, usize> {
    let mut counts = BTreeMap::new();
    for &label in labels {
        *counts.entry(label).or_insert(0) += 1;
    }
    counts
}

/// Fraction of observations per label. Sums to 1 over observed labels.
pub fn distribution_shares(labels: &[i64]) -> BTreeMap<i64, f64> {
    let total = labels.len() as f64;
    label_counts(labels)
        .into_iter()
        .map(|(label, n)| (label, n as f64 / total))
        .collect()
}

/// Share of the most common label, or 0 when there are none.
pub fn dominant_value_share(shares: &BTreeMap<i64, f64>) -> f64 {
    shares.values().copied().fold(0.0, f64::max)
}

/// Jensen-Shannon distance between two label distributions.
pub fn jensen_shannon(p: &BTreeMap<i64, f64>, q: &BTreeMap<i64, f64>) -> f64 {
    let labels: BTreeSet<i64> = p.keys().chain(q.keys()).copied().collect();

    let mut divergence = 0.0;
    for label in labels {
        let pi = p.get(&label).copied().unwrap_or(0.0);
        let qi = q.get(&label).copied().unwrap_or(0.0);
        let mi = 0.5 * (pi + qi);
        if pi > 0.0 {
            divergence += 0.5 * pi * (pi / mi).log2();
        }
        if qi > 0.0 {
            divergence += 0.5 * qi * (qi / mi).log2();
        }
    }

    divergence.max(0.0).sqrt().min(1.0)
}

/// Chi-square goodness-of-fit p-value of `counts` against `reference` shares.
pub fn chi_square_p_value(
    counts: &BTreeMap<i64, usize>,
    reference: &BTreeMap<i64, f64>,
) -> Result<f64> {
    let labels: BTreeSet<i64> = counts.keys().chain(reference.keys()).copied().collect();
    let k = labels.len();
    if k < 2 {
        return Ok(1.0);
    }

    let n: usize = counts.values().sum();
    if n == 0 {
        return Ok(1.0);
    }
    let norm = 1.0 + k as f64 * SMOOTHING;

    let statistic: f64 = labels
        .iter()
        .map(|label| {
            let observed = counts.get(label).copied().unwrap_or(0) as f64;
            let share = (reference.get(label).copied().unwrap_or(0.0) + SMOOTHING) / norm;
            let expected = n as f64 * share;
            (observed - expected).powi(2) / expected
        })
        .sum();

    let dist = ChiSquared::new((k - 1) as f64)
        .map_err(|e| LedgerflowError::validation(format!("chi-square distribution: {e}")))?;
    Ok((1.0 - dist.cdf(statistic)).clamp(0.0, 1.0))
}

/// Compute the metrics row for one scored output against the reference.
pub fn compute_metrics(
    output_ref: &str,
    current: &PredictionTable,
    reference: &PredictionTable,
    method: DriftMethod,
) -> Result<MetricsRecord> {
    let labels = current.labels();
    if labels.is_empty() {
        return Err(LedgerflowError::validation(format!(
            "{output_ref} has no labelled predictions"
        )));
    }
    let reference_labels = reference.labels();
    if reference_labels.is_empty() {
        return Err(LedgerflowError::validation(
            "reference dataset has no labelled predictions",
        ));
    }

    let shares = distribution_shares(&labels);
    let reference_shares = distribution_shares(&reference_labels);

    let drift_score = match method {
        DriftMethod::JensenShannon => jensen_shannon(&shares, &reference_shares),
        DriftMethod::ChiSquare => chi_square_p_value(&label_counts(&labels), &reference_shares)?,
    };

    Ok(MetricsRecord {
        output_ref: output_ref.to_string(),
        timestamp: Utc::now(),
        dominant_value_share: dominant_value_share(&shares),
        distribution_shares: shares,
        drift_score,
        missing_value_share: current.missing_value_share(),
    })
}
