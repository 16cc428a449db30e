//! Migration job and per-table task state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MigrationConfig;
use crate::error::{MigrateError, Result};

/// Lifecycle of a whole job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Lifecycle of one table.
///
/// `Pending → Creating → Copying → Indexing → Done`, with `Failed` and
/// `Cancelled` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Creating,
    Copying,
    Indexing,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Position on the forward path. Terminal states share the top rank.
    pub fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Creating => 1,
            TaskStatus::Copying => 2,
            TaskStatus::Indexing => 3,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 4
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Creating => "creating",
            TaskStatus::Copying => "copying",
            TaskStatus::Indexing => "indexing",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Per-job behavior switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub create_tables: bool,
    pub truncate_tables: bool,
    pub include_indexes: bool,
    pub use_transactions: bool,
    pub batch_size: usize,
    pub acknowledge_warnings: bool,
    pub override_errors: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self::from(&MigrationConfig::default())
    }
}

impl From<&MigrationConfig> for JobOptions {
    fn from(config: &MigrationConfig) -> Self {
        Self {
            create_tables: config.create_tables,
            truncate_tables: config.truncate_tables,
            include_indexes: config.include_indexes,
            use_transactions: config.use_transactions,
            batch_size: config.batch_size,
            acknowledge_warnings: config.acknowledge_warnings,
            override_errors: config.override_errors,
        }
    }
}

impl JobOptions {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(MigrateError::Config("batch_size must be at least 1".into()));
        }
        Ok(())
    }
}

/// What a caller submits.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub source_id: String,
    pub dest_id: String,
    /// Tables by name. Empty means every table in the source default schema.
    pub tables: Vec<String>,
    pub options: JobOptions,
}

impl JobRequest {
    pub fn new(source_id: impl Into<String>, dest_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            dest_id: dest_id.into(),
            tables: Vec::new(),
            options: JobOptions::default(),
        }
    }

    pub fn tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = tables.into_iter().map(Into::into).collect();
        self
    }

    pub fn options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

/// Progress and outcome of one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMigrationTask {
    pub table: String,
    /// Source row count taken when the copy started.
    pub total_rows: Option<i64>,
    pub rows_migrated: i64,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// `MigrateError::kind` of `last_error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// A non-transactional batch failed midway, so some of its rows may
    /// have been written.
    #[serde(default)]
    pub partial_batch_risk: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TableMigrationTask {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            total_rows: None,
            rows_migrated: 0,
            status: TaskStatus::Pending,
            last_error: None,
            error_kind: None,
            partial_batch_risk: false,
            started_at: None,
            finished_at: None,
        }
    }

    /// Move forward to `next`. Returns false (and changes nothing) when the
    /// move would go backward or leave a terminal state.
    pub fn advance(&mut self, next: TaskStatus) -> bool {
        if self.status.is_terminal() || next.rank() <= self.status.rank() {
            return false;
        }
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.status = next;
        true
    }

    /// Mark the task failed with `error`.
    pub fn fail(&mut self, error: &MigrateError) -> bool {
        if !self.advance(TaskStatus::Failed) {
            return false;
        }
        self.last_error = Some(error.to_string());
        self.error_kind = Some(error.kind().to_string());
        true
    }
}

/// A constraint that could not be added after the load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintError {
    pub table: String,
    pub constraint: String,
    pub error: String,
}

/// A submitted job.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationJob {
    pub id: String,
    pub source_id: String,
    pub dest_id: String,
    pub tasks: Vec<TableMigrationTask>,
    pub options: JobOptions,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub constraint_errors: Vec<ConstraintError>,
}

impl MigrationJob {
    pub fn new(id: impl Into<String>, request: &JobRequest, tables: Vec<String>) -> Self {
        Self {
            id: id.into(),
            source_id: request.source_id.clone(),
            dest_id: request.dest_id.clone(),
            tasks: tables.into_iter().map(TableMigrationTask::new).collect(),
            options: request.options.clone(),
            status: JobStatus::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            constraint_errors: Vec::new(),
        }
    }

    pub fn task(&self, table: &str) -> Option<&TableMigrationTask> {
        self.tasks.iter().find(|t| t.table == table)
    }

    pub fn task_mut(&mut self, table: &str) -> Option<&mut TableMigrationTask> {
        self.tasks.iter_mut().find(|t| t.table == table)
    }

    pub fn rows_migrated(&self) -> i64 {
        self.tasks.iter().map(|t| t.rows_migrated).sum()
    }

    /// Enter `Running`. Only a queued job can start.
    pub fn start(&mut self) -> bool {
        if self.status != JobStatus::Queued {
            return false;
        }
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// Terminal status implied by the tasks.
    ///
    /// `Completed` iff every task is `Done`. Otherwise `Failed` when any task
    /// failed, else `Cancelled`.
    pub fn outcome(&self) -> JobStatus {
        if self.tasks.iter().all(|t| t.status == TaskStatus::Done) {
            JobStatus::Completed
        } else if self.tasks.iter().any(|t| t.status == TaskStatus::Failed) {
            JobStatus::Failed
        } else {
            JobStatus::Cancelled
        }
    }

    /// Enter the terminal status given by [`outcome`](Self::outcome).
    pub fn finish(&mut self) -> JobStatus {
        if !self.status.is_terminal() {
            self.status = self.outcome();
            self.finished_at = Some(Utc::now());
        }
        self.status
    }

    /// Terminal record for history sinks.
    pub fn record(&self) -> JobRecord {
        let started = self.started_at.unwrap_or(self.submitted_at);
        let finished = self.finished_at.unwrap_or_else(Utc::now);
        let duration_seconds = (finished - started).num_milliseconds().max(0) as f64 / 1000.0;
        let rows = self.rows_migrated();
        let rows_per_second = if duration_seconds > 0.0 {
            (rows as f64 / duration_seconds) as i64
        } else {
            0
        };

        let failures: Vec<String> = self
            .tasks
            .iter()
            .filter_map(|t| t.last_error.as_ref().map(|e| format!("{}: {}", t.table, e)))
            .collect();

        JobRecord {
            job_id: self.id.clone(),
            source_id: self.source_id.clone(),
            dest_id: self.dest_id.clone(),
            status: self.status,
            tables: self.tasks.clone(),
            started_at: started,
            finished_at: finished,
            rows_migrated: rows,
            duration_seconds,
            rows_per_second,
            error_summary: if failures.is_empty() {
                None
            } else {
                Some(failures.join("; "))
            },
            constraint_errors: self.constraint_errors.clone(),
        }
    }
}

/// Immutable summary of a finished job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub source_id: String,
    pub dest_id: String,
    pub status: JobStatus,
    /// Final state of every task.
    pub tables: Vec<TableMigrationTask>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rows_migrated: i64,
    pub duration_seconds: f64,
    pub rows_per_second: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    #[serde(default)]
    pub constraint_errors: Vec<ConstraintError>,
}

impl JobRecord {
    /// Pretty JSON, as printed by the CLI.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Tables that did not finish as `Done`.
    pub fn unfinished(&self) -> impl Iterator<Item = &TableMigrationTask> {
        self.tables.iter().filter(|t| t.status != TaskStatus::Done)
    }
}
