use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use pipewright_core::error::{PipelineError, Result};
use pipewright_core::run::PipelineRun;
use pipewright_core::traits::RunLog;

/// JSONL run log: one file per pipeline, one run record per line.
///
/// Appends are crash-resilient: a process dying mid-write loses at most the
/// last line, which is skipped on load. Writers for the same pipeline are
/// serialized. Once a file holds more than twice `max_runs` lines it is
/// compacted to the latest record of the newest `max_runs` runs.
pub struct JsonlRunLog {
    dir: PathBuf,
    max_runs: usize,
    writers: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl JsonlRunLog {
    /// `max_runs` of 0 keeps every run.
    pub fn new(dir: PathBuf, max_runs: usize) -> Self {
        Self {
            dir,
            max_runs,
            writers: Mutex::new(HashMap::new()),
        }
    }

    /// File holding the runs of one pipeline.
    pub fn path_for(&self, pipeline_id: &str) -> PathBuf {
        let name: String = pipeline_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.jsonl"))
    }

    fn writer_lock(&self, pipeline_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut writers = self
            .writers
            .lock()
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(writers.entry(pipeline_id.to_string()).or_default().clone())
    }

    async fn compact(&self, path: &Path, pipeline_id: &str) -> Result<()> {
        let records = read_records(path, pipeline_id).await?;
        let kept = newest_runs(records, Some(self.max_runs));

        let mut body = String::new();
        for run in kept.iter().rev() {
            body.push_str(&serde_json::to_string(run)?);
            body.push('\n');
        }

        let tmp = path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(pipeline_id, kept = kept.len(), "Run log compacted");
        Ok(())
    }
}

impl RunLog for JsonlRunLog {
    fn append<'a>(&'a self, pipeline_id: &'a str, run: &'a PipelineRun) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let lock = self.writer_lock(pipeline_id)?;
            let _guard = lock.lock().await;

            tokio::fs::create_dir_all(&self.dir).await?;
            let path = self.path_for(pipeline_id);
            let line = format!("{}\n", serde_json::to_string(run)?);

            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            drop(file);

            if self.max_runs > 0 {
                let lines = tokio::fs::read_to_string(&path).await?.lines().count();
                if lines > self.max_runs * 2 {
                    self.compact(&path, pipeline_id).await?;
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
            let records = read_records(&self.path_for(pipeline_id), pipeline_id).await?;
            Ok(newest_runs(records, limit))
        })
    }
}

/// Records in file order. A missing file reads as empty; malformed lines
/// are skipped.
async fn read_records(path: &Path, pipeline_id: &str) -> Result<Vec<PipelineRun>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<PipelineRun>(line) {
            Ok(run) if run.pipeline_id == pipeline_id => records.push(run),
            Ok(_) => {}
            Err(e) => warn!(path = %path.display(), line = index + 1, error = %e, "Skipping malformed run record"),
        }
    }
    Ok(records)
}

/// Newest first, latest record per run id.
fn newest_runs(records: Vec<PipelineRun>, limit: Option<usize>) -> Vec<PipelineRun> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .rev()
        .filter(|run| seen.insert(run.id.clone()))
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_core::run::{RunStatus, TriggerDescriptor};

    fn run(pipeline_id: &str, status: RunStatus) -> PipelineRun {
        let mut run = PipelineRun::new(pipeline_id, TriggerDescriptor::manual());
        run.status = status;
        run
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlRunLog::new(dir.path().to_path_buf(), 10);
        assert!(log.load_recent("nothing", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_latest_record_wins_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlRunLog::new(dir.path().join("runs"), 10);

        let mut first = run("daily", RunStatus::Running);
        let second = run("daily", RunStatus::Success);
        log.append("daily", &first).await.unwrap();
        log.append("daily", &second).await.unwrap();
        first.status = RunStatus::Failed;
        log.append("daily", &first).await.unwrap();

        let recent = log.load_recent("daily", None).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, first.id);
        assert_eq!(recent[0].status, RunStatus::Failed);
        assert_eq!(recent[1].id, second.id);

        let limited = log.load_recent("daily", Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert!(log.load_recent("other", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlRunLog::new(dir.path().to_path_buf(), 10);
        let good = run("p", RunStatus::Success);
        log.append("p", &good).await.unwrap();

        let path = log.path_for("p");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"id\": \"trunc");
        std::fs::write(&path, content).unwrap();

        let recent = log.load_recent("p", None).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, good.id);
    }

    #[tokio::test]
    async fn test_compaction_caps_runs() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlRunLog::new(dir.path().to_path_buf(), 3);

        let mut ids = Vec::new();
        for _ in 0..10 {
            let r = run("busy", RunStatus::Success);
            ids.push(r.id.clone());
            log.append("busy", &r).await.unwrap();
        }

        let lines = std::fs::read_to_string(log.path_for("busy"))
            .unwrap()
            .lines()
            .count();
        assert!(lines <= 6);

        let recent = log.load_recent("busy", None).await.unwrap();
        assert!(recent.len() >= 3);
        assert_eq!(recent[0].id, ids[9]);
        assert_eq!(recent[1].id, ids[8]);
        assert_eq!(recent[2].id, ids[7]);
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(JsonlRunLog::new(dir.path().to_path_buf(), 0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let log = log.clone();
            tasks.push(tokio::spawn(async move {
                let r = run("shared", RunStatus::Success);
                log.append("shared", &r).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(log.load_recent("shared", None).await.unwrap().len(), 16);
    }

    #[test]
    fn test_path_sanitized() {
        let log = JsonlRunLog::new(PathBuf::from("/tmp/runs"), 1);
        assert_eq!(log.path_for("a/b c"), PathBuf::from("/tmp/runs/a_b_c.jsonl"));
    }
}
