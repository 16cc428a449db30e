//! Persistence of terminal job records.
//!
//! The orchestrator hands every finished job to a [`HistorySink`] exactly
//! once. Sinks are strategies behind `Arc<dyn HistorySink>`:
//!
//! - [`JsonFileHistory`]: one JSON object per line, appended
//! - [`MemoryHistory`]: kept in process, for tests and embedding
//! - [`NoopHistory`]: discards records

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::Result;
use crate::orchestrator::JobRecord;

/// Destination for finished-job records.
#[async_trait]
pub trait HistorySink: Send + Sync {
    /// Persist one terminal record.
    async fn record(&self, record: &JobRecord) -> Result<()>;

    /// Short name for logs.
    fn sink_type(&self) -> &'static str;
}

/// Sink that keeps nothing.
#[derive(Debug, Default)]
pub struct NoopHistory;

#[async_trait]
impl HistorySink for NoopHistory {
    async fn record(&self, _record: &JobRecord) -> Result<()> {
        Ok(())
    }

    fn sink_type(&self) -> &'static str {
        "noop"
    }
}

/// Sink that keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    records: Mutex<Vec<JobRecord>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record received so far, oldest first.
    pub fn records(&self) -> Vec<JobRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}

#[async_trait]
impl HistorySink for MemoryHistory {
    async fn record(&self, record: &JobRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }

    fn sink_type(&self) -> &'static str {
        "memory"
    }
}

/// Append-only JSON lines file.
#[derive(Debug, Clone)]
pub struct JsonFileHistory {
    path: PathBuf,
}

impl JsonFileHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every record in the file. A missing file is empty history.
    pub fn load(&self) -> Result<Vec<JobRecord>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(Into::into))
            .collect()
    }
}

#[async_trait]
impl HistorySink for JsonFileHistory {
    async fn record(&self, record: &JobRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!("Recorded job {} in {}", record.job_id, self.path.display());
        Ok(())
    }

    fn sink_type(&self) -> &'static str {
        "json-file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{JobRequest, MigrationJob, TaskStatus};

    fn record(id: &str) -> JobRecord {
        let mut job = MigrationJob::new(id, &JobRequest::new("a", "b"), vec!["t".into()]);
        job.start();
        job.tasks[0].rows_migrated = 3;
        job.tasks[0].advance(TaskStatus::Done);
        job.finish();
        job.record()
    }

    #[tokio::test]
    async fn test_json_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonFileHistory::new(dir.path().join("nested/history.jsonl"));
        assert!(sink.load().unwrap().is_empty());

        sink.record(&record("j1")).await.unwrap();
        sink.record(&record("j2")).await.unwrap();

        let loaded = sink.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].job_id, "j1");
        assert_eq!(loaded[1].rows_migrated, 3);
        assert_eq!(sink.sink_type(), "json-file");
    }

    #[tokio::test]
    async fn test_memory_sink() {
        let sink = MemoryHistory::new();
        sink.record(&record("j1")).await.unwrap();
        assert_eq!(sink.records().len(), 1);
        NoopHistory.record(&record("j2")).await.unwrap();
    }
}
