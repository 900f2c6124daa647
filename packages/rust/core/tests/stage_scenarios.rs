mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use common::{
    BUCKET, FakeCollaborator, Harness, fs_harness, harness, harness_on, harness_with,
    put_reference, temp_ledger,
};
use ledgerflow_changes::digest;
use ledgerflow_core::{
    PredictionTable, RunOptions, SilentProgress, run_ingest, run_monitor, run_pipeline, run_score,
    run_transform,
};
use ledgerflow_objects::ObjectStore;
use ledgerflow_objects::layout::{scored_key, transformed_key};
use ledgerflow_shared::{ErrorKind, LedgerRecord, LedgerflowError, MetricsRecord, Result, Stage};
use ledgerflow_storage::{CommitOutcome, Ledger, LedgerStore};

async fn seed_raw(objects: &dyn ObjectStore, units: &[(&str, &[u8])]) {
    for (key, bytes) in units {
        objects.put(BUCKET, key, bytes).await.expect("seed raw");
    }
}

/// Register `hash` at `source` with committed transform and score outputs,
/// the scored artifact holding `labels`. Returns the scored key.
async fn seed_scored(h: &Harness, hash: &str, source: &str, labels: &[i64]) -> String {
    let transformed = transformed_key(source, hash).unwrap();
    let scored = scored_key(source, hash).unwrap();
    let table = common::labelled(labels);
    h.objects
        .put(BUCKET, &scored, &table.to_bytes().unwrap())
        .await
        .unwrap();
    h.store.register(hash, source).await.unwrap();
    h.store
        .commit_stage_output(hash, Stage::Transform, &transformed)
        .await
        .unwrap();
    h.store
        .commit_stage_output(hash, Stage::Score, &scored)
        .await
        .unwrap();
    scored
}

#[tokio::test]
async fn ingest_then_transform_sets_only_transformed_path() {
    let h = harness().await;
    seed_raw(
        h.objects.as_ref(),
        &[
            ("2024-08-07/part-r-00000", b"first unit"),
            ("2024-08-07/part-r-00001", b"second unit"),
        ],
    )
    .await;

    let ingest = run_ingest(&h.ctx, &SilentProgress).await.unwrap();
    assert_eq!(ingest.processed, 2);

    let transform = run_transform(&h.ctx, RunOptions::default(), &SilentProgress)
        .await
        .unwrap();
    assert_eq!(transform.processed, 2);
    assert!(transform.is_clean());

    for (bytes, source) in [
        (b"first unit".as_slice(), "2024-08-07/part-r-00000"),
        (b"second unit".as_slice(), "2024-08-07/part-r-00001"),
    ] {
        let hash = digest(bytes);
        let key = transformed_key(source, &hash).unwrap();
        let record = h.store.get(&hash).await.unwrap().expect("record");
        assert_eq!(record.outputs.transformed_path.as_deref(), Some(key.as_str()));
        assert_eq!(record.outputs.scored_path, None);
        assert_eq!(
            h.objects.get(BUCKET, &key).await.unwrap().len(),
            b"features:".len() + bytes.len()
        );
    }
}

#[tokio::test]
async fn rerun_without_new_input_writes_nothing() {
    let h = harness().await;
    seed_raw(
        h.objects.as_ref(),
        &[
            ("2024-08-07/part-r-00000", b"first unit"),
            ("2024-08-07/part-r-00001", b"second unit"),
        ],
    )
    .await;
    run_ingest(&h.ctx, &SilentProgress).await.unwrap();
    run_transform(&h.ctx, RunOptions::default(), &SilentProgress)
        .await
        .unwrap();

    let puts = h.objects.put_count();
    let mutations = h.store.mutation_count();
    let calls = h.collaborator.calls();

    let again = run_transform(&h.ctx, RunOptions::default(), &SilentProgress)
        .await
        .unwrap();
    assert_eq!(again.discovered, 0);
    assert_eq!(h.objects.put_count(), puts);
    assert_eq!(h.store.mutation_count(), mutations);
    assert_eq!(h.collaborator.calls(), calls);

    let reingest = run_ingest(&h.ctx, &SilentProgress).await.unwrap();
    assert_eq!(reingest.processed, 0);
    assert_eq!(reingest.unchanged, 2);
    assert_eq!(h.store.mutation_count(), mutations);
}

#[tokio::test]
async fn ingest_skips_derived_artifacts_and_dedups_content() {
    let h = harness().await;
    seed_raw(
        h.objects.as_ref(),
        &[
            ("2024-08-07/part-r-00000", b"same bytes"),
            ("2024-08-08/part-r-00000", b"same bytes"),
            ("2024-08-07/processed_part-r-00000.ab12", b"derived"),
            ("2024-08-07/predictions_part-r-00000.ab12.parquet", b"{}"),
            ("reference_data.parquet", b"{}"),
        ],
    )
    .await;

    let report = run_ingest(&h.ctx, &SilentProgress).await.unwrap();
    assert_eq!(report.discovered, 2);
    assert_eq!(report.processed, 1);
    assert_eq!(report.unchanged, 1);

    let record = h.store.get(&digest(b"same bytes")).await.unwrap().unwrap();
    assert_eq!(record.source_path, "2024-08-07/part-r-00000");
}

#[tokio::test]
async fn unit_failures_are_isolated() {
    let bad = digest(b"corrupt");
    let h = harness_with(FakeCollaborator::failing(&[bad.as_str()])).await;
    seed_raw(
        h.objects.as_ref(),
        &[("d/part-r-00000", b"fine"), ("d/part-r-00001", b"corrupt")],
    )
    .await;
    run_ingest(&h.ctx, &SilentProgress).await.unwrap();

    let report = run_transform(&h.ctx, RunOptions::default(), &SilentProgress)
        .await
        .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].unit, bad);
    assert_eq!(report.failed[0].kind, ErrorKind::UpstreamTransform);

    let payload = report.failure_payload().expect("payload");
    assert_eq!(payload.units.len(), 1);

    // The failed unit stays pending; the good one moved on.
    let pending = h.store.find_pending_for(Stage::Transform).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].content_hash, bad);
}

#[tokio::test]
async fn forced_rerun_rewrites_same_keys_without_stale_write() {
    let h = harness().await;
    seed_raw(h.objects.as_ref(), &[("d/part-r-00000", b"unit")]).await;
    run_ingest(&h.ctx, &SilentProgress).await.unwrap();
    run_transform(&h.ctx, RunOptions::default(), &SilentProgress)
        .await
        .unwrap();
    let puts = h.objects.put_count();

    let forced = run_transform(&h.ctx, RunOptions { force: true }, &SilentProgress)
        .await
        .unwrap();
    assert_eq!(forced.discovered, 1);
    assert_eq!(forced.processed, 0);
    assert_eq!(forced.unchanged, 1);
    assert_eq!(h.objects.put_count(), puts + 1);
}

/// Delegates to a real ledger but fails the first commit as if the store
/// went away between the object write and the ledger update.
struct LosesFirstCommit {
    inner: Arc<LedgerStore>,
    tripped: AtomicBool,
}

#[async_trait]
impl Ledger for LosesFirstCommit {
    async fn register(&self, content_hash: &str, source_path: &str) -> Result<LedgerRecord> {
        self.inner.register(content_hash, source_path).await
    }

    async fn get(&self, content_hash: &str) -> Result<Option<LedgerRecord>> {
        self.inner.get(content_hash).await
    }

    async fn find_pending_for(&self, stage: Stage) -> Result<Vec<LedgerRecord>> {
        self.inner.find_pending_for(stage).await
    }

    async fn find_ready_for(&self, stage: Stage) -> Result<Vec<LedgerRecord>> {
        self.inner.find_ready_for(stage).await
    }

    async fn commit_stage_output(
        &self,
        content_hash: &str,
        stage: Stage,
        output_path: &str,
    ) -> Result<CommitOutcome> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(LedgerflowError::TransientStore("database is locked".into()));
        }
        self.inner
            .commit_stage_output(content_hash, stage, output_path)
            .await
    }

    async fn append_metrics(&self, record: &MetricsRecord) -> Result<bool> {
        self.inner.append_metrics(record).await
    }
}

#[tokio::test]
async fn lost_commit_is_redone_on_next_invocation() {
    let store = temp_ledger().await;
    let flaky = Arc::new(LosesFirstCommit {
        inner: store.clone(),
        tripped: AtomicBool::new(false),
    });
    let h = harness_on(store, flaky, FakeCollaborator::default());
    seed_raw(h.objects.as_ref(), &[("d/part-r-00000", b"unit")]).await;
    run_ingest(&h.ctx, &SilentProgress).await.unwrap();

    let err = run_transform(&h.ctx, RunOptions::default(), &SilentProgress)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransientStore);
    assert!(err.is_retryable());
    // The artifact was written, the ledger does not know yet.
    let key = transformed_key("d/part-r-00000", &digest(b"unit")).unwrap();
    assert!(h.objects.get(BUCKET, &key).await.is_ok());
    assert_eq!(h.store.find_pending_for(Stage::Transform).await.unwrap().len(), 1);

    let retry = run_transform(&h.ctx, RunOptions::default(), &SilentProgress)
        .await
        .unwrap();
    assert_eq!(retry.processed, 1);
    let record = h.store.get(&digest(b"unit")).await.unwrap().unwrap();
    assert_eq!(record.outputs.transformed_path.as_deref(), Some(key.as_str()));
}

#[tokio::test]
async fn score_packages_predictions_per_unit() {
    let h = harness().await;
    seed_raw(
        h.objects.as_ref(),
        &[("d/part-r-00000", b"aaaa"), ("d/part-r-00001", b"bbbb")],
    )
    .await;
    run_ingest(&h.ctx, &SilentProgress).await.unwrap();
    run_transform(&h.ctx, RunOptions::default(), &SilentProgress)
        .await
        .unwrap();

    let score = run_score(&h.ctx, RunOptions::default(), &SilentProgress)
        .await
        .unwrap();
    assert_eq!(score.processed, 2);

    let first = scored_key("d/part-r-00000", &digest(b"aaaa")).unwrap();
    let bytes = h.objects.get(BUCKET, &first).await.unwrap();
    let table = PredictionTable::from_bytes(&bytes).unwrap();
    assert_eq!(table.len(), 8);
    assert!(table.rows.iter().all(|r| r.p_label == Some(0.7)));

    let record = h.store.get(&digest(b"bbbb")).await.unwrap().unwrap();
    let second = scored_key("d/part-r-00001", &digest(b"bbbb")).unwrap();
    assert_eq!(record.outputs.scored_path.as_deref(), Some(second.as_str()));
}

#[tokio::test]
async fn monitor_observes_each_output_once() {
    let h = harness().await;
    put_reference(h.objects.as_ref(), &[0, 1, 2, 3]).await;

    // One scored output with a known label distribution: 2×0, 1×1, 1×3.
    let scored = seed_scored(&h, "h1", "2024-08-07/part-r-00000", &[0, 0, 1, 3]).await;

    let first = run_monitor(&h.ctx, &SilentProgress).await.unwrap();
    assert_eq!(first.processed, 1);

    let metrics = h.store.metrics_for(&scored).await.unwrap().expect("metrics");
    let sum: f64 = metrics.distribution_shares.values().sum();
    assert!((sum - 1.0).abs() < 1e-6);
    assert_eq!(metrics.distribution_shares.get(&0), Some(&0.5));
    assert_eq!(metrics.dominant_value_share, 0.5);
    assert!(metrics.drift_score > 0.0 && metrics.drift_score <= 1.0);

    let second = run_monitor(&h.ctx, &SilentProgress).await.unwrap();
    assert_eq!(second.discovered, 0);
    assert_eq!(second.processed, 0);
    assert_eq!(h.store.list_metrics().await.unwrap().len(), 1);
}

#[tokio::test]
async fn monitor_without_reference_is_not_found() {
    let h = harness().await;
    seed_scored(&h, "h1", "d/part-r-00000", &[0, 1]).await;

    let err = run_monitor(&h.ctx, &SilentProgress).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn monitor_with_nothing_pending_skips_reference() {
    // No reference dataset and no scored outputs: nothing to observe.
    let h = harness().await;
    let report = run_monitor(&h.ctx, &SilentProgress).await.unwrap();
    assert_eq!(report.discovered, 0);
    assert!(report.is_clean());

    // The whole chain succeeds on an empty bucket too.
    let chain = run_pipeline(&h.ctx, RunOptions::default(), &SilentProgress)
        .await
        .unwrap();
    assert!(chain.is_clean());
    assert_eq!(chain.stages.len(), 4);
}

#[tokio::test]
async fn reuploaded_key_keeps_committed_artifacts() {
    let h = harness().await;
    put_reference(h.objects.as_ref(), &[0, 1, 2, 3]).await;
    let source = "d/part-r-00000";

    seed_raw(h.objects.as_ref(), &[(source, b"version one")]).await;
    run_pipeline(&h.ctx, RunOptions::default(), &SilentProgress)
        .await
        .unwrap();
    let h1 = digest(b"version one");
    let first = h.store.get(&h1).await.unwrap().unwrap();
    let first_transformed = first.outputs.transformed_path.clone().unwrap();
    let before = h.objects.get(BUCKET, &first_transformed).await.unwrap();

    // Same key, new bytes: a second unit with its own artifacts.
    seed_raw(h.objects.as_ref(), &[(source, b"version two!")]).await;
    let report = run_pipeline(&h.ctx, RunOptions::default(), &SilentProgress)
        .await
        .unwrap();
    assert!(report.is_clean());

    let h2 = digest(b"version two!");
    let second = h.store.get(&h2).await.unwrap().unwrap();
    assert_eq!(second.source_path, source);
    assert_ne!(second.outputs.transformed_path, first.outputs.transformed_path);
    assert_ne!(second.outputs.scored_path, first.outputs.scored_path);

    // h1's committed artifact is untouched.
    let after = h.objects.get(BUCKET, &first_transformed).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(after, b"features:version one");

    // Both scored outputs were observed.
    let status = h.store.status().await.unwrap();
    assert_eq!(status.records, 2);
    assert_eq!(status.metrics, 2);
    assert_eq!(status.pending_monitor, 0);
}

#[tokio::test]
async fn concurrent_transforms_commit_each_unit_once() {
    let h = harness().await;
    seed_raw(
        h.objects.as_ref(),
        &[("d/part-r-00000", b"first"), ("d/part-r-00001", b"second")],
    )
    .await;
    run_ingest(&h.ctx, &SilentProgress).await.unwrap();

    let (a, b) = tokio::join!(
        run_transform(&h.ctx, RunOptions::default(), &SilentProgress),
        run_transform(&h.ctx, RunOptions::default(), &SilentProgress),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    // Exactly one commit per hash across both invocations, no stale writes.
    assert_eq!(a.processed + b.processed, 2);
    assert!(a.is_clean() && b.is_clean());
    assert_eq!(a.unchanged + b.unchanged, a.discovered + b.discovered - 2);

    for (bytes, source) in [
        (b"first".as_slice(), "d/part-r-00000"),
        (b"second".as_slice(), "d/part-r-00001"),
    ] {
        let hash = digest(bytes);
        let record = h.store.get(&hash).await.unwrap().unwrap();
        let expected = transformed_key(source, &hash).unwrap();
        assert_eq!(record.outputs.transformed_path.as_deref(), Some(expected.as_str()));
    }
    assert!(h.store.find_pending_for(Stage::Transform).await.unwrap().is_empty());
}

#[tokio::test]
async fn full_chain_reaches_metrics() {
    let h = harness().await;
    put_reference(h.objects.as_ref(), &[0, 1, 2, 3]).await;
    seed_raw(h.objects.as_ref(), &[("2024-08-07/part-r-00000", b"abcd")]).await;

    let report = run_pipeline(&h.ctx, RunOptions::default(), &SilentProgress)
        .await
        .unwrap();
    assert!(report.is_clean());
    let processed: Vec<usize> = report.stages.iter().map(|s| s.processed).collect();
    assert_eq!(processed, vec![1, 1, 1, 1]);

    let status = h.store.status().await.unwrap();
    assert_eq!(status.records, 1);
    assert_eq!(status.scored, 1);
    assert_eq!(status.metrics, 1);
    assert_eq!(status.pending_monitor, 0);
}

#[tokio::test]
async fn full_chain_on_filesystem_store() {
    let (ctx, store, root) = fs_harness().await;
    put_reference(ctx.objects.as_ref(), &[0, 1, 2, 3]).await;
    seed_raw(
        ctx.objects.as_ref(),
        &[
            ("2024-08-07/part-r-00000", b"abcd"),
            ("2024-08-07/part-r-00001", b"efgh"),
        ],
    )
    .await;

    let report = run_pipeline(&ctx, RunOptions::default(), &SilentProgress)
        .await
        .unwrap();
    assert!(report.is_clean(), "{report:?}");
    let processed: Vec<usize> = report.stages.iter().map(|s| s.processed).collect();
    assert_eq!(processed, vec![2, 2, 2, 2]);

    let hash = digest(b"abcd");
    let scored = scored_key("2024-08-07/part-r-00000", &hash).unwrap();
    assert!(root.join(BUCKET).join(&scored).is_file());
    // Raw input is still a plain file next to its artifacts.
    assert!(root.join(BUCKET).join("2024-08-07/part-r-00000").is_file());

    // A second chain finds nothing new, including among derived artifacts.
    let again = run_pipeline(&ctx, RunOptions::default(), &SilentProgress)
        .await
        .unwrap();
    assert_eq!(again.stages[0].discovered, 2);
    assert!(again.stages.iter().all(|s| s.processed == 0));

    let status = store.status().await.unwrap();
    assert_eq!(status.scored, 2);
    assert_eq!(status.metrics, 2);
    let _ = std::fs::remove_dir_all(&root);
}
