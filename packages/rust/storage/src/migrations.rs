//! Schema for the ledger database.
//!
//! Migrations are applied in ascending order on open. Every statement is
//! idempotent so that two workers opening a fresh database at the same time
//! both succeed.

/// A versioned block of SQL.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "ledger table keyed by content hash",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS ledger (
    content_hash     TEXT PRIMARY KEY,
    source_path      TEXT NOT NULL,
    transformed_path TEXT,
    scored_path      TEXT,
    created_at       TEXT NOT NULL,
    CHECK (scored_path IS NULL OR transformed_path IS NOT NULL)
);

CREATE INDEX IF NOT EXISTS idx_ledger_transformed ON ledger(transformed_path);
CREATE INDEX IF NOT EXISTS idx_ledger_scored ON ledger(scored_path);

INSERT OR IGNORE INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "append-only metrics table, one row per scored output",
            sql: r#"
CREATE TABLE IF NOT EXISTS metrics (
    id                   TEXT PRIMARY KEY,
    output_ref           TEXT NOT NULL UNIQUE,
    timestamp            TEXT NOT NULL,
    distribution_shares  TEXT NOT NULL,
    drift_score          REAL NOT NULL,
    missing_value_share  REAL NOT NULL,
    dominant_value_share REAL NOT NULL
);

INSERT OR IGNORE INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
