#![allow(dead_code)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use uuid::Uuid;

use ledgerflow_core::{Collaborator, PipelineContext, PredictionRow, PredictionTable, RawScores};
use ledgerflow_objects::{FsObjectStore, MemoryObjectStore, ObjectStore};
use ledgerflow_shared::{AppConfig, LedgerflowError, Result, Stage};
use ledgerflow_storage::{Ledger, LedgerStore};

pub const BUCKET: &str = "observations";

/// Deterministic stand-in for the feature and scoring collaborators.
#[derive(Default)]
pub struct FakeCollaborator {
    pub fail_units: HashSet<String>,
    pub calls: AtomicUsize,
}

impl FakeCollaborator {
    pub fn failing(units: &[&str]) -> Self {
        Self {
            fail_units: units.iter().map(|u| u.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Collaborator for FakeCollaborator {
    async fn invoke(&self, stage: Stage, unit: &str, input: &[u8]) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_units.contains(unit) {
            return Err(LedgerflowError::upstream(unit, "malformed record"));
        }

        match stage {
            Stage::Transform => Ok([b"features:".as_slice(), input].concat()),
            Stage::Score => {
                // One observation per input byte, predicted class = byte % 4.
                let probabilities = input
                    .iter()
                    .take(8)
                    .map(|b| {
                        let mut p = vec![0.1; 4];
                        p[(*b % 4) as usize] = 0.7;
                        p
                    })
                    .collect::<Vec<_>>();
                let ids = (0..probabilities.len())
                    .map(|i| Some(format!("{unit}-{i}")))
                    .collect();
                serde_json::to_vec(&RawScores { ids, probabilities })
                    .map_err(|e| LedgerflowError::upstream(unit, e.to_string()))
            }
            other => Err(LedgerflowError::validation(format!("no collaborator for {other}"))),
        }
    }
}

pub struct Harness {
    pub objects: Arc<MemoryObjectStore>,
    pub store: Arc<LedgerStore>,
    pub collaborator: Arc<FakeCollaborator>,
    pub ctx: PipelineContext,
}

pub async fn temp_ledger() -> Arc<LedgerStore> {
    let path = std::env::temp_dir().join(format!("lf_it_{}.db", Uuid::now_v7()));
    Arc::new(LedgerStore::open_local(&path).await.expect("open ledger"))
}

pub fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.objects.data_bucket = BUCKET.into();
    config
}

pub async fn harness() -> Harness {
    harness_with(FakeCollaborator::default()).await
}

pub async fn harness_with(collaborator: FakeCollaborator) -> Harness {
    let store = temp_ledger().await;
    let ledger: Arc<dyn Ledger> = store.clone();
    harness_on(store, ledger, collaborator)
}

/// Harness whose stages see `ledger`, while `store` stays inspectable.
pub fn harness_on(
    store: Arc<LedgerStore>,
    ledger: Arc<dyn Ledger>,
    collaborator: FakeCollaborator,
) -> Harness {
    let objects = Arc::new(MemoryObjectStore::new());
    let collaborator = Arc::new(collaborator);
    let ctx = PipelineContext::new(&config(), objects.clone(), ledger, collaborator.clone());
    Harness {
        objects,
        store,
        collaborator,
        ctx,
    }
}

/// Context over a directory-backed object store in a fresh temp root.
pub async fn fs_harness() -> (PipelineContext, Arc<LedgerStore>, PathBuf) {
    let root = std::env::temp_dir().join(format!("lf_fs_it_{}", Uuid::now_v7()));
    let store = temp_ledger().await;
    let objects = Arc::new(FsObjectStore::new(&root));
    let ctx = PipelineContext::new(
        &config(),
        objects,
        store.clone(),
        Arc::new(FakeCollaborator::default()),
    );
    (ctx, store, root)
}

pub fn labelled(labels: &[i64]) -> PredictionTable {
    PredictionTable {
        rows: labels
            .iter()
            .enumerate()
            .map(|(i, &label)| PredictionRow {
                id: Some(format!("ref-{i}")),
                p: vec![Some(0.25); 4],
                label: Some(label),
                p_label: Some(0.25),
            })
            .collect(),
    }
}

pub async fn put_reference(objects: &dyn ObjectStore, labels: &[i64]) {
    let bytes = labelled(labels).to_bytes().expect("encode reference");
    objects
        .put(BUCKET, "reference_data.parquet", &bytes)
        .await
        .expect("put reference");
}
