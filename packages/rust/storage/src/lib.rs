//! libSQL ledger store.
//!
//! The [`LedgerStore`] struct holds the ledger (one row per content hash) and
//! the append-only metrics table. It is the only shared mutable resource of
//! the pipeline.
//!
//! **Access rules:**
//! - every operation opens a short-lived connection and never holds a
//!   transaction across object-store I/O;
//! - stage outputs are set with conditional updates, so concurrent workers
//!   coordinate through the database alone;
//! - every statement is parameterized; column names come from a fixed match
//!   on [`Stage`], never from input.

mod migrations;
pub mod secrets;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ledgerflow_shared::{
    LedgerConfig, LedgerRecord, LedgerflowError, MetricsRecord, Result, Stage, StageOutputs,
};

pub use secrets::{EnvSecrets, LedgerCredentials, SecretsProvider, StaticSecrets, resolve_credentials};

/// Milliseconds a local connection waits on a locked database before failing.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Substrings of driver errors that mean "try again later".
const TRANSIENT_MARKERS: &[&str] = &[
    "locked",
    "busy",
    "connection",
    "timed out",
    "timeout",
    "unavailable",
    "hrana",
];

// ---------------------------------------------------------------------------
// Ledger protocol
// ---------------------------------------------------------------------------

/// Result of [`Ledger::register_if_absent`].
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub record: LedgerRecord,
    /// False when the hash was already registered, by this or another worker.
    pub created: bool,
}

/// Result of a successful [`Ledger::commit_stage_output`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The output was null and is now set.
    Committed,
    /// The output was already set to the same value; nothing changed.
    AlreadyCommitted,
}

/// Access protocol every stage uses to coordinate through the ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Raw insert. Fails with [`LedgerflowError::DuplicateKey`] if the hash exists.
    async fn register(&self, content_hash: &str, source_path: &str) -> Result<LedgerRecord>;

    async fn get(&self, content_hash: &str) -> Result<Option<LedgerRecord>>;

    /// Records whose prerequisite output is set and whose `stage` output is
    /// null. For [`Stage::Monitor`] this is scored outputs with no metrics
    /// row. [`Stage::Ingest`] discovers work from the object store and has no
    /// pending set here. No ordering guarantee.
    async fn find_pending_for(&self, stage: Stage) -> Result<Vec<LedgerRecord>>;

    /// Records whose prerequisite output is set, whether or not `stage` has
    /// already run. Used for forced reprocessing.
    async fn find_ready_for(&self, stage: Stage) -> Result<Vec<LedgerRecord>>;

    /// Set the output of a ledger-backed stage.
    ///
    /// Refuses to overwrite a different value ([`LedgerflowError::StaleWrite`])
    /// and to skip ahead of the prerequisite ([`LedgerflowError::OutOfOrder`]).
    async fn commit_stage_output(
        &self,
        content_hash: &str,
        stage: Stage,
        output_path: &str,
    ) -> Result<CommitOutcome>;

    /// Append a metrics row. Returns false if a row for the same `output_ref`
    /// already exists.
    async fn append_metrics(&self, record: &MetricsRecord) -> Result<bool>;

    /// Insert if unseen; a concurrent registration of the same hash is success.
    async fn register_if_absent(
        &self,
        content_hash: &str,
        source_path: &str,
    ) -> Result<Registration> {
        match self.register(content_hash, source_path).await {
            Ok(record) => Ok(Registration {
                record,
                created: true,
            }),
            Err(LedgerflowError::DuplicateKey { .. }) => {
                debug!(content_hash, "already registered");
                let record = self.get(content_hash).await?.ok_or_else(|| {
                    LedgerflowError::not_found(format!("ledger record {content_hash}"))
                })?;
                Ok(Registration {
                    record,
                    created: false,
                })
            }
            Err(e) => Err(e),
        }
    }
}

/// Per-stage counts for the `status` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStatus {
    pub records: u64,
    pub transformed: u64,
    pub scored: u64,
    pub metrics: u64,
    pub pending_transform: u64,
    pub pending_score: u64,
    pub pending_monitor: u64,
}

// ---------------------------------------------------------------------------
// LedgerStore
// ---------------------------------------------------------------------------

/// libSQL-backed [`Ledger`] plus the metrics table.
pub struct LedgerStore {
    db: Database,
    local: bool,
    location: String,
    mutations: AtomicU64,
}

impl LedgerStore {
    /// Open or create a local database file and apply migrations.
    pub async fn open_local(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LedgerflowError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(classify)?;

        let store = Self {
            db,
            local: true,
            location: path.display().to_string(),
            mutations: AtomicU64::new(0),
        };
        store.enable_wal().await?;
        store.run_migrations().await?;
        Ok(store)
    }

    /// Connect to a remote libSQL server and apply migrations.
    pub async fn open_remote(url: &str, auth_token: &str) -> Result<Self> {
        let db = libsql::Builder::new_remote(url.to_string(), auth_token.to_string())
            .build()
            .await
            .map_err(classify)?;

        let store = Self {
            db,
            local: false,
            location: url.to_string(),
            mutations: AtomicU64::new(0),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Open whatever the credential document points at.
    pub async fn open(creds: &LedgerCredentials) -> Result<Self> {
        if creds.is_remote() {
            Self::open_remote(&creds.url, creds.auth_token.as_deref().unwrap_or("")).await
        } else {
            Self::open_local(Path::new(creds.local_path())).await
        }
    }

    /// Resolve credentials by logical name, falling back to the configured
    /// local database when nothing is published under that name.
    pub async fn connect_with(
        secrets: &dyn SecretsProvider,
        config: &LedgerConfig,
    ) -> Result<Self> {
        match resolve_credentials(secrets, &config.secret_name).await? {
            Some(creds) => {
                info!(secret = %config.secret_name, remote = creds.is_remote(), "ledger credentials resolved");
                Self::open(&creds).await
            }
            None => {
                debug!(path = %config.default_path, "no ledger credentials published, using local database");
                Self::open_local(Path::new(&config.default_path)).await
            }
        }
    }

    /// Where the database lives, for diagnostics.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Number of rows written through this handle since it was opened.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Short-lived connection for a single operation.
    async fn conn(&self) -> Result<Connection> {
        let conn = self.db.connect().map_err(classify)?;
        if self.local {
            // PRAGMA busy_timeout returns a row, so it goes through query().
            conn.query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), ())
                .await
                .map_err(classify)?;
        }
        Ok(conn)
    }

    async fn enable_wal(&self) -> Result<()> {
        let conn = self.conn().await?;
        conn.query("PRAGMA journal_mode = WAL", ())
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await?;
        let conn = self.conn().await?;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                conn.execute_batch(migration.sql).await.map_err(|e| {
                    LedgerflowError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Highest applied migration, or 0 on a fresh database.
    pub async fn schema_version(&self) -> Result<u32> {
        let conn = self.conn().await?;
        let exists = {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
                    (),
                )
                .await
                .map_err(classify)?;
            match rows.next().await.map_err(classify)? {
                Some(row) => row.get::<i64>(0).map_err(classify)? > 0,
                None => false,
            }
        };
        if !exists {
            return Ok(0);
        }

        let mut rows = conn
            .query("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", ())
            .await
            .map_err(classify)?;
        match rows.next().await.map_err(classify)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(classify)? as u32),
            None => Ok(0),
        }
    }

    fn record_mutation(&self, rows: u64) {
        self.mutations.fetch_add(rows, Ordering::SeqCst);
    }

    async fn query_records(&self, sql: &str) -> Result<Vec<LedgerRecord>> {
        let conn = self.conn().await?;
        let mut rows = conn.query(sql, ()).await.map_err(classify)?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(classify)? {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    // -----------------------------------------------------------------------
    // Metrics
    // -----------------------------------------------------------------------

    /// All metrics rows, oldest first.
    pub async fn list_metrics(&self) -> Result<Vec<MetricsRecord>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT output_ref, timestamp, distribution_shares, drift_score,
                        missing_value_share, dominant_value_share
                 FROM metrics ORDER BY timestamp, id",
                (),
            )
            .await
            .map_err(classify)?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(classify)? {
            records.push(row_to_metrics(&row)?);
        }
        Ok(records)
    }

    /// The metrics row observing `output_ref`, if any.
    pub async fn metrics_for(&self, output_ref: &str) -> Result<Option<MetricsRecord>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT output_ref, timestamp, distribution_shares, drift_score,
                        missing_value_share, dominant_value_share
                 FROM metrics WHERE output_ref = ?1",
                params![output_ref],
            )
            .await
            .map_err(classify)?;

        match rows.next().await.map_err(classify)? {
            Some(row) => Ok(Some(row_to_metrics(&row)?)),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub async fn status(&self) -> Result<LedgerStatus> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*),
                        COUNT(transformed_path),
                        COUNT(scored_path),
                        (SELECT COUNT(*) FROM metrics),
                        (SELECT COUNT(*) FROM ledger l
                          WHERE l.scored_path IS NOT NULL
                            AND NOT EXISTS (SELECT 1 FROM metrics m WHERE m.output_ref = l.scored_path))
                 FROM ledger",
                (),
            )
            .await
            .map_err(classify)?;

        let Some(row) = rows.next().await.map_err(classify)? else {
            return Ok(LedgerStatus::default());
        };
        let count = |i: i32| -> Result<u64> { Ok(row.get::<i64>(i).map_err(classify)? as u64) };

        let records = count(0)?;
        let transformed = count(1)?;
        let scored = count(2)?;
        Ok(LedgerStatus {
            records,
            transformed,
            scored,
            metrics: count(3)?,
            pending_transform: records.saturating_sub(transformed),
            pending_score: transformed.saturating_sub(scored),
            pending_monitor: count(4)?,
        })
    }
}

#[async_trait]
impl Ledger for LedgerStore {
    async fn register(&self, content_hash: &str, source_path: &str) -> Result<LedgerRecord> {
        let created_at = Utc::now();
        let conn = self.conn().await?;
        let result = conn
            .execute(
                "INSERT INTO ledger (content_hash, source_path, created_at) VALUES (?1, ?2, ?3)",
                params![content_hash, source_path, created_at.to_rfc3339()],
            )
            .await;

        match result {
            Ok(rows) => {
                self.record_mutation(rows);
                info!(content_hash, source_path, "registered new unit");
                Ok(LedgerRecord {
                    content_hash: content_hash.to_string(),
                    source_path: source_path.to_string(),
                    outputs: StageOutputs::default(),
                    created_at,
                })
            }
            Err(e) if is_unique_violation(&e) => Err(LedgerflowError::DuplicateKey {
                content_hash: content_hash.to_string(),
            }),
            Err(e) => Err(classify(e)),
        }
    }

    async fn get(&self, content_hash: &str) -> Result<Option<LedgerRecord>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT content_hash, source_path, transformed_path, scored_path, created_at
                 FROM ledger WHERE content_hash = ?1",
                params![content_hash],
            )
            .await
            .map_err(classify)?;

        match rows.next().await.map_err(classify)? {
            Some(row) => Ok(Some(row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_pending_for(&self, stage: Stage) -> Result<Vec<LedgerRecord>> {
        let sql = match stage {
            Stage::Ingest => return Ok(Vec::new()),
            Stage::Transform => {
                "SELECT content_hash, source_path, transformed_path, scored_path, created_at
                 FROM ledger WHERE transformed_path IS NULL"
            }
            Stage::Score => {
                "SELECT content_hash, source_path, transformed_path, scored_path, created_at
                 FROM ledger WHERE transformed_path IS NOT NULL AND scored_path IS NULL"
            }
            Stage::Monitor => {
                "SELECT content_hash, source_path, transformed_path, scored_path, created_at
                 FROM ledger l
                 WHERE l.scored_path IS NOT NULL
                   AND NOT EXISTS (SELECT 1 FROM metrics m WHERE m.output_ref = l.scored_path)"
            }
        };
        self.query_records(sql).await
    }

    async fn find_ready_for(&self, stage: Stage) -> Result<Vec<LedgerRecord>> {
        let sql = match stage {
            Stage::Ingest => return Ok(Vec::new()),
            Stage::Transform => {
                "SELECT content_hash, source_path, transformed_path, scored_path, created_at
                 FROM ledger"
            }
            Stage::Score => {
                "SELECT content_hash, source_path, transformed_path, scored_path, created_at
                 FROM ledger WHERE transformed_path IS NOT NULL"
            }
            Stage::Monitor => {
                "SELECT content_hash, source_path, transformed_path, scored_path, created_at
                 FROM ledger WHERE scored_path IS NOT NULL"
            }
        };
        self.query_records(sql).await
    }

    async fn commit_stage_output(
        &self,
        content_hash: &str,
        stage: Stage,
        output_path: &str,
    ) -> Result<CommitOutcome> {
        let sql = match stage {
            Stage::Transform => {
                "UPDATE ledger SET transformed_path = ?2
                 WHERE content_hash = ?1 AND transformed_path IS NULL"
            }
            Stage::Score => {
                "UPDATE ledger SET scored_path = ?2
                 WHERE content_hash = ?1 AND scored_path IS NULL AND transformed_path IS NOT NULL"
            }
            Stage::Ingest | Stage::Monitor => {
                return Err(LedgerflowError::validation(format!(
                    "{stage} has no ledger output column"
                )));
            }
        };

        let conn = self.conn().await?;
        let rows = conn
            .execute(sql, params![content_hash, output_path])
            .await
            .map_err(classify)?;
        drop(conn);

        if rows > 0 {
            self.record_mutation(rows);
            debug!(content_hash, %stage, output_path, "stage output committed");
            return Ok(CommitOutcome::Committed);
        }

        // Nothing updated: work out why from the current row.
        let record = self
            .get(content_hash)
            .await?
            .ok_or_else(|| LedgerflowError::not_found(format!("ledger record {content_hash}")))?;

        match record.outputs.get(stage) {
            Some(existing) if existing == output_path => Ok(CommitOutcome::AlreadyCommitted),
            Some(existing) => {
                warn!(content_hash, %stage, existing, attempted = output_path, "stale write refused");
                Err(LedgerflowError::StaleWrite {
                    content_hash: content_hash.to_string(),
                    stage,
                    existing: existing.to_string(),
                    attempted: output_path.to_string(),
                })
            }
            None => Err(LedgerflowError::OutOfOrder {
                content_hash: content_hash.to_string(),
                stage,
                prerequisite: stage.prerequisite().unwrap_or(Stage::Ingest),
            }),
        }
    }

    async fn append_metrics(&self, record: &MetricsRecord) -> Result<bool> {
        let shares = serde_json::to_string(&record.distribution_shares)
            .map_err(|e| LedgerflowError::validation(format!("distribution shares: {e}")))?;
        let id = Uuid::now_v7().to_string();

        let conn = self.conn().await?;
        let rows = conn
            .execute(
                "INSERT INTO metrics (id, output_ref, timestamp, distribution_shares,
                                      drift_score, missing_value_share, dominant_value_share)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(output_ref) DO NOTHING",
                params![
                    id,
                    record.output_ref.as_str(),
                    record.timestamp.to_rfc3339(),
                    shares,
                    record.drift_score,
                    record.missing_value_share,
                    record.dominant_value_share
                ],
            )
            .await
            .map_err(classify)?;

        self.record_mutation(rows);
        if rows == 0 {
            debug!(output_ref = %record.output_ref, "metrics already recorded");
        }
        Ok(rows > 0)
    }
}

// ---------------------------------------------------------------------------
// Row mapping and error classification
// ---------------------------------------------------------------------------

fn classify(err: libsql::Error) -> LedgerflowError {
    let message = err.to_string();
    let lower = message.to_ascii_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        LedgerflowError::TransientStore(message)
    } else {
        LedgerflowError::Storage(message)
    }
}

fn is_unique_violation(err: &libsql::Error) -> bool {
    let message = err.to_string();
    message.contains("UNIQUE constraint failed") || message.contains("PRIMARY KEY constraint failed")
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LedgerflowError::Storage(format!("invalid timestamp {s:?}: {e}")))
}

fn row_to_record(row: &libsql::Row) -> Result<LedgerRecord> {
    let created_at: String = row.get(4).map_err(classify)?;
    Ok(LedgerRecord {
        content_hash: row.get::<String>(0).map_err(classify)?,
        source_path: row.get::<String>(1).map_err(classify)?,
        outputs: StageOutputs {
            transformed_path: row.get::<Option<String>>(2).map_err(classify)?,
            scored_path: row.get::<Option<String>>(3).map_err(classify)?,
        },
        created_at: parse_timestamp(&created_at)?,
    })
}

fn row_to_metrics(row: &libsql::Row) -> Result<MetricsRecord> {
    let timestamp: String = row.get(1).map_err(classify)?;
    let shares: String = row.get(2).map_err(classify)?;
    Ok(MetricsRecord {
        output_ref: row.get::<String>(0).map_err(classify)?,
        timestamp: parse_timestamp(&timestamp)?,
        distribution_shares: serde_json::from_str(&shares)
            .map_err(|e| LedgerflowError::Storage(format!("invalid distribution shares: {e}")))?,
        drift_score: row.get::<f64>(3).map_err(classify)?,
        missing_value_share: row.get::<f64>(4).map_err(classify)?,
        dominant_value_share: row.get::<f64>(5).map_err(classify)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use ledgerflow_shared::ErrorKind;

    /// Create a temp file ledger for testing.
    async fn test_store() -> LedgerStore {
        let tmp = std::env::temp_dir().join(format!("lf_test_{}.db", Uuid::now_v7()));
        LedgerStore::open_local(&tmp).await.expect("open test db")
    }

    fn metrics(output_ref: &str) -> MetricsRecord {
        MetricsRecord {
            output_ref: output_ref.into(),
            timestamp: Utc::now(),
            distribution_shares: BTreeMap::from([(0, 0.25), (1, 0.75)]),
            drift_score: 0.1,
            missing_value_share: 0.0,
            dominant_value_share: 0.75,
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let store = test_store().await;
        assert_eq!(store.schema_version().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn reopen_is_idempotent() {
        let tmp = std::env::temp_dir().join(format!("lf_test_{}.db", Uuid::now_v7()));
        let first = LedgerStore::open_local(&tmp).await.unwrap();
        first.register("h1", "d/a").await.unwrap();
        drop(first);

        let second = LedgerStore::open_local(&tmp).await.unwrap();
        assert_eq!(second.schema_version().await.unwrap(), 2);
        assert!(second.get("h1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let store = test_store().await;

        let first = store.register_if_absent("h1", "2024-08-07/part-r-00000").await.unwrap();
        assert!(first.created);

        let second = store.register_if_absent("h1", "2024-08-07/part-r-00000").await.unwrap();
        assert!(!second.created);
        assert_eq!(second.record.content_hash, "h1");
        assert_eq!(second.record.created_at, first.record.created_at);

        let raw = store.register("h1", "elsewhere").await.unwrap_err();
        assert_eq!(raw.kind(), ErrorKind::DuplicateKey);
        assert_eq!(store.status().await.unwrap().records, 1);
    }

    #[tokio::test]
    async fn concurrent_registration_creates_one_row() {
        let store = Arc::new(test_store().await);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.register_if_absent("h-shared", "d/x").await
            }));
        }

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().expect("register").created {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.status().await.unwrap().records, 1);
    }

    #[tokio::test]
    async fn commit_protocol() {
        let store = test_store().await;
        store.register("h1", "d/a").await.unwrap();
        store.register("h2", "d/b").await.unwrap();

        let out = store
            .commit_stage_output("h1", Stage::Transform, "d/processed_a")
            .await
            .unwrap();
        assert_eq!(out, CommitOutcome::Committed);

        let again = store
            .commit_stage_output("h1", Stage::Transform, "d/processed_a")
            .await
            .unwrap();
        assert_eq!(again, CommitOutcome::AlreadyCommitted);

        let stale = store
            .commit_stage_output("h1", Stage::Transform, "d/processed_other")
            .await
            .unwrap_err();
        assert!(matches!(stale, LedgerflowError::StaleWrite { .. }));

        let skipped = store
            .commit_stage_output("h2", Stage::Score, "d/b/predictions.parquet")
            .await
            .unwrap_err();
        assert!(matches!(
            skipped,
            LedgerflowError::OutOfOrder {
                prerequisite: Stage::Transform,
                ..
            }
        ));

        let missing = store
            .commit_stage_output("nope", Stage::Transform, "x")
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        assert!(
            store
                .commit_stage_output("h1", Stage::Monitor, "x")
                .await
                .is_err()
        );

        let record = store.get("h1").await.unwrap().unwrap();
        assert_eq!(record.outputs.transformed_path.as_deref(), Some("d/processed_a"));
        assert!(record.outputs.is_monotonic());
    }

    #[tokio::test]
    async fn pending_sets_follow_commits() {
        let store = test_store().await;
        store.register("h1", "d/a").await.unwrap();
        store.register("h2", "d/b").await.unwrap();

        assert_eq!(store.find_pending_for(Stage::Transform).await.unwrap().len(), 2);
        assert!(store.find_pending_for(Stage::Score).await.unwrap().is_empty());
        assert!(store.find_pending_for(Stage::Ingest).await.unwrap().is_empty());

        store
            .commit_stage_output("h1", Stage::Transform, "d/processed_a")
            .await
            .unwrap();
        let transform: Vec<String> = store
            .find_pending_for(Stage::Transform)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.content_hash)
            .collect();
        assert_eq!(transform, vec!["h2"]);
        let score = store.find_pending_for(Stage::Score).await.unwrap();
        assert_eq!(score.len(), 1);
        assert_eq!(score[0].content_hash, "h1");

        store
            .commit_stage_output("h1", Stage::Score, "d/a/predictions.parquet")
            .await
            .unwrap();
        assert!(store.find_pending_for(Stage::Score).await.unwrap().is_empty());
        assert_eq!(store.find_pending_for(Stage::Monitor).await.unwrap().len(), 1);
        assert_eq!(store.find_ready_for(Stage::Score).await.unwrap().len(), 1);
        assert_eq!(store.find_ready_for(Stage::Transform).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn metrics_are_unique_per_output() {
        let store = test_store().await;
        store.register("h1", "d/a").await.unwrap();
        store
            .commit_stage_output("h1", Stage::Transform, "d/processed_a")
            .await
            .unwrap();
        store
            .commit_stage_output("h1", Stage::Score, "d/a/predictions.parquet")
            .await
            .unwrap();

        assert!(store.append_metrics(&metrics("d/a/predictions.parquet")).await.unwrap());
        assert!(!store.append_metrics(&metrics("d/a/predictions.parquet")).await.unwrap());
        assert!(store.find_pending_for(Stage::Monitor).await.unwrap().is_empty());

        let rows = store.list_metrics().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].distribution_shares.get(&1), Some(&0.75));
        assert!(store.metrics_for("d/a/predictions.parquet").await.unwrap().is_some());
        assert!(store.metrics_for("d/other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_and_mutation_count() {
        let store = test_store().await;
        store.register("h1", "d/a").await.unwrap();
        store.register("h2", "d/b").await.unwrap();
        store
            .commit_stage_output("h1", Stage::Transform, "d/processed_a")
            .await
            .unwrap();
        assert_eq!(store.mutation_count(), 3);

        store
            .commit_stage_output("h1", Stage::Transform, "d/processed_a")
            .await
            .unwrap();
        assert_eq!(store.mutation_count(), 3);

        let status = store.status().await.unwrap();
        assert_eq!(
            status,
            LedgerStatus {
                records: 2,
                transformed: 1,
                scored: 0,
                metrics: 0,
                pending_transform: 1,
                pending_score: 1,
                pending_monitor: 0,
            }
        );
    }

    #[tokio::test]
    async fn connect_with_falls_back_to_default_path() {
        let config = LedgerConfig {
            secret_name: format!("LF_TEST_ABSENT_{}", Uuid::now_v7().simple()),
            default_path: std::env::temp_dir()
                .join(format!("lf_test_{}.db", Uuid::now_v7()))
                .display()
                .to_string(),
        };
        let store = LedgerStore::connect_with(&StaticSecrets::new(), &config)
            .await
            .unwrap();
        assert_eq!(store.location(), config.default_path);
    }

    #[tokio::test]
    async fn connect_with_uses_published_credentials() {
        let path = std::env::temp_dir().join(format!("lf_test_{}.db", Uuid::now_v7()));
        let secrets = StaticSecrets::new().with(
            "LEDGER_CONN",
            serde_json::json!({ "url": format!("file:{}", path.display()) }).to_string(),
        );
        let store = LedgerStore::connect_with(&secrets, &LedgerConfig::default())
            .await
            .unwrap();
        assert_eq!(store.location(), path.display().to_string());
    }

    #[tokio::test]
    async fn mistyped_output_column_is_an_error() {
        let store = test_store().await;
        store.register("h1", "d/a").await.unwrap();
        store.register("h2", "d/b").await.unwrap();

        let conn = store.conn().await.unwrap();
        conn.execute(
            "UPDATE ledger SET transformed_path = X'00FF' WHERE content_hash = ?1",
            params!["h1"],
        )
        .await
        .unwrap();
        drop(conn);

        let err = store.get("h1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);

        // NULL still decodes as an unset output.
        let clean = store.get("h2").await.unwrap().unwrap();
        assert_eq!(clean.outputs.transformed_path, None);
        assert_eq!(clean.outputs.scored_path, None);
    }

    #[test]
    fn classifies_lock_errors_as_transient() {
        let err = classify(libsql::Error::ConnectionFailed("refused".into()));
        assert_eq!(err.kind(), ErrorKind::TransientStore);
        let err = classify(libsql::Error::Misuse("bad statement".into()));
        assert_eq!(err.kind(), ErrorKind::Storage);
    }
}
