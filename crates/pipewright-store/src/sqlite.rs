use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection};
use tracing::{debug, warn};

use pipewright_core::error::{PipelineError, Result};
use pipewright_core::run::PipelineRun;
use pipewright_core::traits::RunLog;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS runs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        pipeline_id TEXT NOT NULL,
        run_id TEXT NOT NULL,
        status TEXT NOT NULL,
        record TEXT NOT NULL,
        recorded_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_runs_pipeline ON runs(pipeline_id, seq);
    CREATE INDEX IF NOT EXISTS idx_runs_run ON runs(run_id);";

fn db_err(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Storage(e.to_string())
}

/// SQLite-backed run log.
///
/// Every append inserts a row and drops older rows of the same run, so
/// the table holds one (latest) record per run. Runs beyond `max_runs`
/// per pipeline are pruned oldest first; 0 keeps every run.
pub struct SqliteRunLog {
    conn: Mutex<Connection>,
    max_runs: usize,
}

impl SqliteRunLog {
    /// Open or create a database at the given path.
    pub fn open(path: &Path, max_runs: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err(format!("Failed to create db directory: {e}")))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite run log opened");
        Ok(Self {
            conn: Mutex::new(conn),
            max_runs,
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory(max_runs: usize) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_runs,
        })
    }
}

impl RunLog for SqliteRunLog {
    fn append<'a>(&'a self, pipeline_id: &'a str, run: &'a PipelineRun) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let record = serde_json::to_string(run)?;
            let conn = self.conn.lock().map_err(db_err)?;

            conn.execute(
                "INSERT INTO runs (pipeline_id, run_id, status, record, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    pipeline_id,
                    run.id,
                    run.status.to_string(),
                    record,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(db_err)?;
            let seq = conn.last_insert_rowid();

            conn.execute(
                "DELETE FROM runs WHERE pipeline_id = ?1 AND run_id = ?2 AND seq < ?3",
                params![pipeline_id, run.id, seq],
            )
            .map_err(db_err)?;

            if self.max_runs > 0 {
                let pruned = conn
                    .execute(
                        "DELETE FROM runs WHERE pipeline_id = ?1 AND seq NOT IN (
                            SELECT seq FROM runs WHERE pipeline_id = ?1
                            ORDER BY seq DESC LIMIT ?2
                         )",
                        params![pipeline_id, self.max_runs as i64],
                    )
                    .map_err(db_err)?;
                if pruned > 0 {
                    debug!(pipeline_id, pruned, "Pruned old runs");
                }
            }
            Ok(())
        })
    }

    fn load_recent<'a>(
        &'a self,
        pipeline_id: &'a str,
        limit: Option<usize>,
    ) -> BoxFuture<'a, Result<Vec<PipelineRun>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let limit = limit.map_or(-1, |l| l as i64);

            let mut stmt = conn
                .prepare(
                    "SELECT record FROM runs WHERE pipeline_id = ?1
                     ORDER BY seq DESC LIMIT ?2",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![pipeline_id, limit], |row| row.get::<_, String>(0))
                .map_err(db_err)?;

            let mut runs = Vec::new();
            for row in rows {
                let record = row.map_err(db_err)?;
                match serde_json::from_str::<PipelineRun>(&record) {
                    Ok(run) => runs.push(run),
                    Err(e) => warn!(pipeline_id, error = %e, "Skipping unreadable run record"),
                }
            }
            Ok(runs)
        })
    }
}
