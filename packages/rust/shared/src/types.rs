//! Core domain types for the ledgerflow pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for execution and metrics identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// One step of the pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    Transform,
    Score,
    Monitor,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Transform => "transform",
            Self::Score => "score",
            Self::Monitor => "monitor",
        }
    }

    /// The stage whose output must exist before this one may run.
    pub fn prerequisite(&self) -> Option<Stage> {
        match self {
            Self::Ingest => None,
            Self::Transform => Some(Self::Ingest),
            Self::Score => Some(Self::Transform),
            Self::Monitor => Some(Self::Score),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ingest" => Ok(Self::Ingest),
            "transform" => Ok(Self::Transform),
            "score" => Ok(Self::Score),
            "monitor" => Ok(Self::Monitor),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// LedgerRecord
// ---------------------------------------------------------------------------

/// Ordered, nullable stage outputs of one ledger record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformed_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scored_path: Option<String>,
}

impl StageOutputs {
    /// Output of `stage`, if the stage writes a ledger column and has committed.
    pub fn get(&self, stage: Stage) -> Option<&str> {
        match stage {
            Stage::Transform => self.transformed_path.as_deref(),
            Stage::Score => self.scored_path.as_deref(),
            Stage::Ingest | Stage::Monitor => None,
        }
    }

    /// Outputs in pipeline order.
    pub fn iter(&self) -> impl Iterator<Item = (Stage, Option<&str>)> {
        [
            (Stage::Transform, self.transformed_path.as_deref()),
            (Stage::Score, self.scored_path.as_deref()),
        ]
        .into_iter()
    }

    /// True when no later output is set while an earlier one is still null.
    pub fn is_monotonic(&self) -> bool {
        let mut seen_null = false;
        for (_, out) in self.iter() {
            match out {
                None => seen_null = true,
                Some(_) if seen_null => return false,
                Some(_) => {}
            }
        }
        true
    }
}

/// One row of the ledger: pipeline progress for a single content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// SHA-256 of the raw input bytes. Identity key.
    pub content_hash: String,
    /// Object-store key of the original input.
    pub source_path: String,
    #[serde(flatten)]
    pub outputs: StageOutputs,
    pub created_at: DateTime<Utc>,
}

impl LedgerRecord {
    /// The object-store key a stage reads from: its prerequisite's output.
    pub fn input_for(&self, stage: Stage) -> Option<&str> {
        match stage.prerequisite()? {
            Stage::Ingest => Some(self.source_path.as_str()),
            prior => self.outputs.get(prior),
        }
    }
}

// ---------------------------------------------------------------------------
// MetricsRecord
// ---------------------------------------------------------------------------

/// Drift metrics for one scored output. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    /// The ledger `scored_path` this row observes.
    pub output_ref: String,
    pub timestamp: DateTime<Utc>,
    /// Fraction of predictions per class label.
    pub distribution_shares: BTreeMap<i64, f64>,
    pub drift_score: f64,
    pub missing_value_share: f64,
    pub dominant_value_share: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_roundtrip() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().expect("parse RunId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn stage_order_and_prerequisites() {
        assert_eq!(Stage::Transform.prerequisite(), Some(Stage::Ingest));
        assert_eq!(Stage::Monitor.prerequisite(), Some(Stage::Score));
        assert!(Stage::Ingest < Stage::Score);
        assert_eq!("score".parse::<Stage>(), Ok(Stage::Score));
        assert!("train".parse::<Stage>().is_err());
    }

    #[test]
    fn monotonic_outputs() {
        let ok = StageOutputs {
            transformed_path: Some("2024-08-07/processed_part-r-00000.h1".into()),
            scored_path: None,
        };
        assert!(ok.is_monotonic());

        let bad = StageOutputs {
            transformed_path: None,
            scored_path: Some("2024-08-07/predictions_part-r-00000.h1.parquet".into()),
        };
        assert!(!bad.is_monotonic());
    }

    #[test]
    fn record_input_follows_prerequisite() {
        let record = LedgerRecord {
            content_hash: "h1".into(),
            source_path: "2024-08-07/part-r-00000".into(),
            outputs: StageOutputs {
                transformed_path: Some("2024-08-07/processed_part-r-00000.h1".into()),
                scored_path: None,
            },
            created_at: Utc::now(),
        };
        assert_eq!(record.input_for(Stage::Transform), Some("2024-08-07/part-r-00000"));
        assert_eq!(
            record.input_for(Stage::Score),
            Some("2024-08-07/processed_part-r-00000.h1")
        );
        assert_eq!(record.input_for(Stage::Monitor), None);
        assert_eq!(record.input_for(Stage::Ingest), None);
    }

    #[test]
    fn record_serializes_flat() {
        let record = LedgerRecord {
            content_hash: "h1".into(),
            source_path: "a/b".into(),
            outputs: StageOutputs::default(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["content_hash"], "h1");
        assert!(json.get("transformed_path").is_none());
    }
}
