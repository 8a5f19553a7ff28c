//! libSQL experiment log (offline mode).
//!
//! The [`Storage`] struct wraps a local libSQL database that records every
//! pipeline run: which experiment it belongs to, the configuration that
//! produced it, its score and its aggregate usage. Runs are looked up by
//! pipeline fingerprint so a sweep can tell whether a configuration was
//! already evaluated.
//!
//! **Access rules:**
//! - `fieldforge run` / `fieldforge grid`: read-write via [`Storage::open`]
//! - `fieldforge runs list`: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use fieldforge_shared::{FieldforgeError, Result};
use libsql::{Connection, Database, params};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Map any libSQL failure into a storage error.
fn db_err(e: impl std::fmt::Display) -> FieldforgeError {
    FieldforgeError::Storage(e.to_string())
}

/// Fixed-width RFC 3339 so timestamps sort as text.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| FieldforgeError::Storage(format!("invalid date: {e}")))
}

/// A named pipeline whose runs are grouped together.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentRecord {
    pub id: String,
    pub name: String,
    pub pipeline_fingerprint: String,
    pub created_at: DateTime<Utc>,
}

/// One logged pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub id: String,
    pub experiment_id: String,
    /// Short hash of the grouped parameters (see `fieldforge_shared::config_id`).
    pub config_id: String,
    /// Deep pipeline fingerprint at the time of the run.
    pub fingerprint: String,
    pub params: Value,
    pub score: Option<f64>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_latency: f64,
    pub num_success: u64,
    pub num_failure: u64,
    pub output_path: Option<String>,
    pub dataset_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    /// A fresh run with a new UUID v7 id, stamped now, with zeroed usage.
    pub fn new(
        experiment_id: impl Into<String>,
        config_id: impl Into<String>,
        fingerprint: impl Into<String>,
        params: Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            experiment_id: experiment_id.into(),
            config_id: config_id.into(),
            fingerprint: fingerprint.into(),
            params,
            score: None,
            input_tokens: 0,
            output_tokens: 0,
            input_cost: 0.0,
            output_cost: 0.0,
            total_latency: 0.0,
            num_success: 0,
            num_failure: 0,
            output_path: None,
            dataset_hash: None,
            created_at: Utc::now(),
        }
    }

    pub fn total_cost(&self) -> f64 {
        self.input_cost + self.output_cost
    }
}

const RUN_COLUMNS: &str = "id, experiment_id, config_id, fingerprint, params_json, score, \
     input_tokens, output_tokens, input_cost, output_cost, total_latency, \
     num_success, num_failure, output_path, dataset_hash, created_at";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FieldforgeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` for listing only.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FieldforgeError::Storage(format!(
                "no experiment log at {}",
                path.display()
            )));
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        FieldforgeError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 before the first migration.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0,
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(FieldforgeError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Experiments
    // -----------------------------------------------------------------------

    /// Return the id of experiment `name`, creating it if needed.
    ///
    /// An existing experiment whose pipeline changed shape gets its
    /// fingerprint refreshed.
    pub async fn ensure_experiment(&self, name: &str, fingerprint: &str) -> Result<String> {
        self.check_writable()?;
        if let Some(existing) = self.get_experiment_by_name(name).await? {
            if existing.pipeline_fingerprint != fingerprint {
                tracing::info!(experiment = name, "pipeline changed, updating fingerprint");
                self.conn
                    .execute(
                        "UPDATE experiments SET pipeline_fingerprint = ?1 WHERE id = ?2",
                        params![fingerprint, existing.id.as_str()],
                    )
                    .await
                    .map_err(db_err)?;
            }
            return Ok(existing.id);
        }

        let id = Uuid::now_v7().to_string();
        let now = timestamp(&Utc::now());
        self.conn
            .execute(
                "INSERT INTO experiments (id, name, pipeline_fingerprint, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id.as_str(), name, fingerprint, now.as_str()],
            )
            .await
            .map_err(db_err)?;
        tracing::debug!(experiment = name, id = %id, "experiment created");
        Ok(id)
    }

    pub async fn get_experiment_by_name(&self, name: &str) -> Result<Option<ExperimentRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, pipeline_fingerprint, created_at FROM experiments WHERE name = ?1",
                params![name],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_experiment(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    pub async fn list_experiments(&self) -> Result<Vec<ExperimentRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, pipeline_fingerprint, created_at FROM experiments ORDER BY name",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_experiment(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    pub async fn record_run(&self, run: &RunRecord) -> Result<()> {
        self.check_writable()?;
        let params_json = serde_json::to_string(&run.params)?;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO runs ({RUN_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    run.id.as_str(),
                    run.experiment_id.as_str(),
                    run.config_id.as_str(),
                    run.fingerprint.as_str(),
                    params_json,
                    run.score,
                    run.input_tokens as i64,
                    run.output_tokens as i64,
                    run.input_cost,
                    run.output_cost,
                    run.total_latency,
                    run.num_success as i64,
                    run.num_failure as i64,
                    run.output_path.as_deref(),
                    run.dataset_hash.as_deref(),
                    timestamp(&run.created_at),
                ],
            )
            .await
            .map_err(db_err)?;
        tracing::debug!(run = %run.id, config = %run.config_id, score = ?run.score, "run recorded");
        Ok(())
    }

    /// Most recent runs first, optionally restricted to one experiment.
    pub async fn list_runs(&self, experiment_id: Option<&str>, limit: usize) -> Result<Vec<RunRecord>> {
        let mut rows = match experiment_id {
            Some(id) => self
                .conn
                .query(
                    &format!(
                        "SELECT {RUN_COLUMNS} FROM runs WHERE experiment_id = ?1
                         ORDER BY created_at DESC, id DESC LIMIT ?2"
                    ),
                    params![id, limit as i64],
                )
                .await
                .map_err(db_err)?,
            None => self
                .conn
                .query(
                    &format!(
                        "SELECT {RUN_COLUMNS} FROM runs ORDER BY created_at DESC, id DESC LIMIT ?1"
                    ),
                    params![limit as i64],
                )
                .await
                .map_err(db_err)?,
        };

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_run(&row)?);
        }
        Ok(results)
    }

    /// Latest run logged under `fingerprint`, if any.
    pub async fn find_run(&self, fingerprint: &str) -> Result<Option<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE fingerprint = ?1
                     ORDER BY created_at DESC, id DESC LIMIT 1"
                ),
                params![fingerprint],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Highest-scoring run of an experiment; the earliest wins a tie.
    pub async fn best_run(&self, experiment_id: &str) -> Result<Option<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs
                     WHERE experiment_id = ?1 AND score IS NOT NULL
                     ORDER BY score DESC, created_at ASC, id ASC LIMIT 1"
                ),
                params![experiment_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }
}

fn row_to_experiment(row: &libsql::Row) -> Result<ExperimentRecord> {
    Ok(ExperimentRecord {
        id: row.get::<String>(0).map_err(db_err)?,
        name: row.get::<String>(1).map_err(db_err)?,
        pipeline_fingerprint: row.get::<String>(2).map_err(db_err)?,
        created_at: parse_time(&row.get::<String>(3).map_err(db_err)?)?,
    })
}

/// Convert a row selected with [`RUN_COLUMNS`] to a [`RunRecord`].
fn row_to_run(row: &libsql::Row) -> Result<RunRecord> {
    let params_json = row.get::<String>(4).map_err(db_err)?;
    Ok(RunRecord {
        id: row.get::<String>(0).map_err(db_err)?,
        experiment_id: row.get::<String>(1).map_err(db_err)?,
        config_id: row.get::<String>(2).map_err(db_err)?,
        fingerprint: row.get::<String>(3).map_err(db_err)?,
        params: serde_json::from_str(&params_json)?,
        score: row.get::<f64>(5).ok(),
        input_tokens: row.get::<i64>(6).map_err(db_err)? as u64,
        output_tokens: row.get::<i64>(7).map_err(db_err)? as u64,
        input_cost: row.get::<f64>(8).map_err(db_err)?,
        output_cost: row.get::<f64>(9).map_err(db_err)?,
        total_latency: row.get::<f64>(10).map_err(db_err)?,
        num_success: row.get::<i64>(11).map_err(db_err)? as u64,
        num_failure: row.get::<i64>(12).map_err(db_err)? as u64,
        output_path: row.get::<String>(13).ok(),
        dataset_hash: row.get::<String>(14).ok(),
        created_at: parse_time(&row.get::<String>(15).map_err(db_err)?)?,
    })
}
