pub mod jsonl;
pub mod sqlite;

pub use jsonl::JsonlRunLog;
pub use sqlite::SqliteRunLog;

use std::sync::Arc;

use pipewright_core::config::{RunLogBackend, RunLogConfig};
use pipewright_core::error::Result;
use pipewright_core::traits::RunLog;

/// Open the run log backend selected in config.
pub fn open(config: &RunLogConfig) -> Result<Arc<dyn RunLog>> {
    let dir = config.dir_path();
    let max_runs = config.max_runs_per_pipeline;
    Ok(match config.backend {
        RunLogBackend::Jsonl => Arc::new(JsonlRunLog::new(dir, max_runs)),
        RunLogBackend::Sqlite => Arc::new(SqliteRunLog::open(&dir.join("runs.db"), max_runs)?),
    })
}
