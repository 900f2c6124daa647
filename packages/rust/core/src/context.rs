//! Clients shared by every stage of one process.

use std::sync::Arc;

use ledgerflow_objects::ObjectStore;
use ledgerflow_shared::{AppConfig, DriftMethod};
use ledgerflow_storage::Ledger;

use crate::bridge::Collaborator;

/// Everything a stage invocation needs, constructed once at process start
/// and passed explicitly.
#[derive(Clone)]
pub struct PipelineContext {
    pub objects: Arc<dyn ObjectStore>,
    pub ledger: Arc<dyn Ledger>,
    /// External feature-derivation and scoring collaborator.
    pub collaborator: Arc<dyn Collaborator>,
    /// Bucket holding raw inputs and every derived artifact.
    pub bucket: String,
    /// Prefix listed by the ingest stage.
    pub raw_prefix: String,
    /// Regexes of keys ingest never treats as raw input.
    pub exclude_patterns: Vec<String>,
    /// Key of the reference predictions used by the drift monitor.
    pub reference_key: String,
    pub drift_method: DriftMethod,
}

impl PipelineContext {
    /// Build a context from config plus already-constructed clients.
    pub fn new(
        config: &AppConfig,
        objects: Arc<dyn ObjectStore>,
        ledger: Arc<dyn Ledger>,
        collaborator: Arc<dyn Collaborator>,
    ) -> Self {
        Self {
            objects,
            ledger,
            collaborator,
            bucket: config.objects.data_bucket.clone(),
            raw_prefix: config.objects.raw_prefix.clone(),
            exclude_patterns: config.ingest.exclude_patterns.clone(),
            reference_key: config.monitor.reference_key.clone(),
            drift_method: config.monitor.drift_method,
        }
    }
}
