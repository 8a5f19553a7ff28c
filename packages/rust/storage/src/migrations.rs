//! SQL migration definitions for the experiment log.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: experiments, runs",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- A named pipeline being tuned
CREATE TABLE IF NOT EXISTS experiments (
    id                   TEXT PRIMARY KEY,
    name                 TEXT NOT NULL UNIQUE,
    pipeline_fingerprint TEXT NOT NULL,
    created_at           TEXT NOT NULL
);

-- One pipeline run under one configuration
CREATE TABLE IF NOT EXISTS runs (
    id            TEXT PRIMARY KEY,
    experiment_id TEXT NOT NULL REFERENCES experiments(id) ON DELETE CASCADE,
    config_id     TEXT NOT NULL,
    fingerprint   TEXT NOT NULL,
    params_json   TEXT NOT NULL,
    score         REAL,
    input_tokens  INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    input_cost    REAL NOT NULL DEFAULT 0,
    output_cost   REAL NOT NULL DEFAULT 0,
    total_latency REAL NOT NULL DEFAULT 0,
    num_success   INTEGER NOT NULL DEFAULT 0,
    num_failure   INTEGER NOT NULL DEFAULT 0,
    output_path   TEXT,
    created_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_experiment ON runs(experiment_id);
CREATE INDEX IF NOT EXISTS idx_runs_fingerprint ON runs(fingerprint);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Record the input dataset hash per run",
            sql: r#"
ALTER TABLE runs ADD COLUMN dataset_hash TEXT;

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
