//! Migration orchestrator - main workflow coordinator.
//!
//! A job goes through these phases:
//!
//! 1. Validate options, connections and a fresh compatibility report
//! 2. Prepare the destination (truncate, create tables in dependency order)
//! 3. Transfer data through a bounded worker pool; a table starts only
//!    after every table it references has loaded
//! 4. Add deferred foreign keys between tables that both loaded
//!
//! Each phase reports through the [`ProgressBus`]; the terminal
//! [`JobRecord`] goes to the bus and the [`HistorySink`].

mod job;
mod plan;
mod retry;
mod worker;

pub use job::{
    ConstraintError, JobOptions, JobRecord, JobRequest, JobStatus, MigrationJob,
    TableMigrationTask, TaskStatus,
};
pub use plan::MigrationPlan;
pub use retry::RetryPolicy;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MigrationConfig;
use crate::core::traits::DialectAdapter;
use crate::core::{ForeignKey, Table};
use crate::error::{MigrateError, Result};
use crate::history::{HistorySink, NoopHistory};
use crate::inspector::{CompatibilityReport, SchemaInspector};
use crate::progress::{EventKind, ProgressBus, ProgressEvent};
use crate::registry::ConnectionRegistry;
use worker::{run_table, JobContext};

/// Live handle on a submitted job.
pub struct JobTicket {
    id: String,
    state: Arc<Mutex<MigrationJob>>,
    cancel: CancellationToken,
    handle: JoinHandle<JobRecord>,
}

impl JobTicket {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> JobStatus {
        self.snapshot().status
    }

    /// Current state of the job and its tasks.
    pub fn snapshot(&self) -> MigrationJob {
        self.state
            .lock()
            .map(|j| j.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Ask the job to stop at the next batch boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the terminal record.
    pub async fn wait(self) -> Result<JobRecord> {
        self.handle
            .await
            .map_err(|e| MigrateError::Internal(format!("job {} aborted: {}", self.id, e)))
    }
}

struct JobEntry {
    state: Arc<Mutex<MigrationJob>>,
    cancel: CancellationToken,
}

/// Validates, plans and runs migration jobs.
pub struct Orchestrator {
    registry: Arc<ConnectionRegistry>,
    bus: ProgressBus,
    history: Arc<dyn HistorySink>,
    retry: RetryPolicy,
    workers: usize,
    inspect_concurrency: usize,
    jobs: Arc<RwLock<HashMap<String, JobEntry>>>,
}

/// Everything submission-time validation produced.
#[derive(Debug, Clone)]
pub struct ValidatedJob {
    pub report: CompatibilityReport,
    pub plan: MigrationPlan,
    /// Source tables by name.
    pub tables: BTreeMap<String, Table>,
    /// Tables kept out of the run by compatibility errors, with the reasons.
    pub blocked: BTreeMap<String, String>,
    pub dest_schema: String,
}

impl Orchestrator {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            bus: ProgressBus::default(),
            history: Arc::new(NoopHistory),
            retry: RetryPolicy::default(),
            workers: 2,
            inspect_concurrency: 4,
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Tuning from the `migration` section of a config file.
    pub fn from_config(registry: Arc<ConnectionRegistry>, config: &MigrationConfig) -> Self {
        Self::new(registry)
            .with_retry_policy(RetryPolicy::from(config))
            .with_workers(config.get_workers())
            .with_inspect_concurrency(config.get_inspect_concurrency())
    }

    pub fn with_bus(mut self, bus: ProgressBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = history;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_inspect_concurrency(mut self, n: usize) -> Self {
        self.inspect_concurrency = n.max(1);
        self
    }

    pub fn bus(&self) -> &ProgressBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Run every submission check and compute the load order, without
    /// touching data.
    pub async fn validate(&self, request: &JobRequest) -> Result<ValidatedJob> {
        request.options.validate()?;
        if let Some(blank) = request.tables.iter().find(|t| t.trim().is_empty()) {
            return Err(MigrateError::Config(format!(
                "table name '{}' is empty",
                blank
            )));
        }
        // Tables land in the destination's default schema, so one connection
        // on both sides would copy every table onto itself.
        if request.source_id == request.dest_id {
            return Err(MigrateError::Config(format!(
                "source and destination are both connection '{}'",
                request.source_id
            )));
        }
        for id in [&request.source_id, &request.dest_id] {
            if !self.registry.contains(id).await {
                return Err(MigrateError::NotFound(format!("connection {}", id)));
            }
        }

        let inspector = SchemaInspector::new(Arc::clone(&self.registry), self.inspect_concurrency);
        let (source, _, report) = inspector
            .compatibility(&request.source_id, &request.dest_id, &request.tables)
            .await?;
        report.ensure_runnable(
            request.options.create_tables,
            request.options.acknowledge_warnings,
            request.options.override_errors,
        )?;

        let selected: Vec<Table> = report
            .tables
            .iter()
            .filter_map(|name| source.find(name).cloned())
            .collect();
        let blocked = report.blocked_tables(request.options.override_errors);
        let plan = MigrationPlan::build(&selected);
        let dest_schema = self
            .registry
            .lease(&request.dest_id)
            .await?
            .default_schema()
            .to_string();

        Ok(ValidatedJob {
            report,
            plan,
            tables: selected.into_iter().map(|t| (t.name.clone(), t)).collect(),
            blocked,
            dest_schema,
        })
    }

    /// Validate `request` and start it in the background.
    ///
    /// Validation failures (`Config`, `NotFound`, `IncompatibleSchema`) are
    /// returned here and no job is created.
    pub async fn submit(&self, request: JobRequest) -> Result<JobTicket> {
        let validated = self.validate(&request).await?;
        let id = uuid::Uuid::new_v4().to_string();
        let job = MigrationJob::new(&id, &request, validated.plan.order.clone());
        let state = Arc::new(Mutex::new(job));
        let cancel = CancellationToken::new();

        if let Ok(mut jobs) = self.jobs.write() {
            jobs.insert(
                id.clone(),
                JobEntry {
                    state: Arc::clone(&state),
                    cancel: cancel.clone(),
                },
            );
        }

        let runner = JobRunner {
            id: id.clone(),
            request,
            validated,
            registry: Arc::clone(&self.registry),
            bus: self.bus.clone(),
            history: Arc::clone(&self.history),
            retry: self.retry.clone(),
            workers: self.workers,
            state: Arc::clone(&state),
            cancel: cancel.clone(),
        };
        info!("Submitted job {}", id);
        let handle = tokio::spawn(runner.run());

        Ok(JobTicket {
            id,
            state,
            cancel,
            handle,
        })
    }

    /// Submit and wait for the terminal record.
    pub async fn run(&self, request: JobRequest) -> Result<JobRecord> {
        self.submit(request).await?.wait().await
    }

    /// Cancel a running job by id.
    pub fn cancel(&self, job_id: &str) -> Result<()> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| MigrateError::Internal("job table poisoned".into()))?;
        let entry = jobs
            .get(job_id)
            .ok_or_else(|| MigrateError::NotFound(format!("job {}", job_id)))?;
        entry.cancel.cancel();
        Ok(())
    }

    /// Snapshot of a submitted job.
    pub fn job(&self, job_id: &str) -> Result<MigrationJob> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| MigrateError::Internal("job table poisoned".into()))?;
        let entry = jobs
            .get(job_id)
            .ok_or_else(|| MigrateError::NotFound(format!("job {}", job_id)))?;
        let job = entry
            .state
            .lock()
            .map(|j| j.clone())
            .unwrap_or_else(|e| e.into_inner().clone());
        Ok(job)
    }
}

/// Executes one validated job.
struct JobRunner {
    id: String,
    request: JobRequest,
    validated: ValidatedJob,
    registry: Arc<ConnectionRegistry>,
    bus: ProgressBus,
    history: Arc<dyn HistorySink>,
    retry: RetryPolicy,
    workers: usize,
    state: Arc<Mutex<MigrationJob>>,
    cancel: CancellationToken,
}

impl JobRunner {
    fn lock(&self) -> std::sync::MutexGuard<'_, MigrationJob> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn job_event(&self, started: Instant) {
        let event = {
            let job = self.lock();
            let total: Option<i64> = job.tasks.iter().map(|t| t.total_rows).sum();
            ProgressEvent::job(
                &job.id,
                job.rows_migrated(),
                total,
                started.elapsed(),
                job.status,
            )
        };
        self.bus.progress(event);
    }

    async fn run(self) -> JobRecord {
        let started = Instant::now();
        self.lock().start();
        self.job_event(started);
        info!(
            "Job {}: {} tables, order {:?}",
            self.id,
            self.validated.plan.order.len(),
            self.validated.plan.order
        );

        let ctx = match self.prepare(started).await {
            Ok(ctx) => Some(Arc::new(ctx)),
            Err(e) => {
                error!("Job {}: preparing destination failed: {}", self.id, e);
                None
            }
        };

        if let Some(ctx) = ctx {
            info!("Phase 3: Transferring data");
            self.transfer(&ctx).await;

            info!("Phase 4: Adding deferred constraints");
            self.add_deferred_constraints(&ctx).await;
        }

        let record = {
            let mut job = self.lock();
            for task in job.tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
                task.fail(&MigrateError::Internal(
                    "task stopped without reporting a result".into(),
                ));
            }
            let status = job.finish();
            info!(
                "Job {} {}: {} rows in {} tables",
                self.id,
                status,
                job.rows_migrated(),
                job.tasks.len()
            );
            job.record()
        };
        self.job_event(started);

        if let Err(e) = self.history.record(&record).await {
            warn!(
                "Job {}: {} history sink failed: {}",
                self.id,
                self.history.sink_type(),
                e
            );
        }
        self.bus.finished(record.clone());
        record
    }

    /// Phase 2: truncate and create destination tables.
    ///
    /// Tables blocked by compatibility errors fail first and are left
    /// untouched. Failures here that concern one table fail that task only;
    /// a failed truncate fails every task, since no table is in a known state.
    async fn prepare(&self, started: Instant) -> Result<JobContext> {
        info!("Phase 2: Preparing destination");
        let options = &self.request.options;
        let plan = &self.validated.plan;
        let schema = self.validated.dest_schema.clone();
        let blocked = &self.validated.blocked;

        for (name, reason) in blocked {
            warn!("{}: not migrated, {}", name, reason);
            let e = MigrateError::IncompatibleSchema(reason.clone());
            self.set_task(name, |t| t.fail(&e), started);
        }

        let (inline_fks, created) = {
            let leased = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(MigrateError::Cancelled),
                lease = self.registry.lease(&self.request.dest_id) => lease,
            };
            let dest = match leased {
                Ok(d) => d,
                Err(e) => {
                    self.fail_all(&e, started);
                    return Err(e);
                }
            };
            let inline_fks = !dest.supports_deferred_constraints();

            let mut existing = HashSet::new();
            for name in &plan.order {
                match dest.table_exists(&schema, name).await {
                    Ok(true) => {
                        existing.insert(name.clone());
                    }
                    Ok(false) => {}
                    Err(e) => {
                        self.fail_all(&e, started);
                        return Err(e);
                    }
                }
            }

            if options.truncate_tables {
                let targets: Vec<String> = plan
                    .reverse_order()
                    .into_iter()
                    .filter(|t| existing.contains(t) && !blocked.contains_key(t))
                    .collect();
                if !targets.is_empty() {
                    debug!("Truncating {:?}", targets);
                    if let Err(e) = dest.truncate_tables(&schema, &targets).await {
                        self.fail_all(&e, started);
                        return Err(e);
                    }
                }
            }

            let mut created = HashSet::new();
            if options.create_tables {
                for name in &plan.order {
                    if existing.contains(name) || blocked.contains_key(name) {
                        continue;
                    }
                    let Some(table) = self.validated.tables.get(name) else {
                        continue;
                    };
                    self.set_task(name, |t| t.advance(TaskStatus::Creating), started);
                    match dest.create_table(table, &schema, inline_fks).await {
                        Ok(()) => {
                            created.insert(name.clone());
                        }
                        Err(e) => {
                            error!("{}: create table failed: {}", name, e);
                            self.set_task(name, |t| t.fail(&e), started);
                        }
                    }
                }
                info!("Created {} tables", created.len());
            }
            (inline_fks, created)
        };

        Ok(JobContext {
            job_id: self.id.clone(),
            source_id: self.request.source_id.clone(),
            dest_id: self.request.dest_id.clone(),
            dest_schema: schema,
            options: options.clone(),
            retry: self.retry.clone(),
            registry: Arc::clone(&self.registry),
            bus: self.bus.clone(),
            cancel: self.cancel.clone(),
            state: Arc::clone(&self.state),
            started,
            inline_fks,
            created,
        })
    }

    fn set_task(
        &self,
        table: &str,
        f: impl FnOnce(&mut TableMigrationTask) -> bool,
        started: Instant,
    ) {
        let event = {
            let mut job = self.lock();
            let Some(task) = job.task_mut(table) else {
                return;
            };
            if !f(task) {
                return;
            }
            ProgressEvent::table(
                &self.id,
                EventKind::Task,
                &task.table,
                task.rows_migrated,
                task.total_rows,
                started.elapsed(),
                task.status,
            )
        };
        self.bus.progress(event);
    }

    fn fail_all(&self, error: &MigrateError, started: Instant) {
        let names: Vec<String> = self.lock().tasks.iter().map(|t| t.table.clone()).collect();
        for name in names {
            if matches!(error, MigrateError::Cancelled) {
                self.set_task(&name, |t| t.advance(TaskStatus::Cancelled), started);
                continue;
            }
            let e = MigrateError::ddl(&name, error.to_string());
            self.set_task(&name, |t| t.fail(&e), started);
        }
    }

    /// Phase 3: one spawned task per table, gated on its dependencies and
    /// on the worker semaphore.
    async fn transfer(&self, ctx: &Arc<JobContext>) {
        let plan = &self.validated.plan;
        let workers = Arc::new(Semaphore::new(self.workers));

        let mut senders = HashMap::new();
        let mut signals = HashMap::new();
        for name in &plan.order {
            let (tx, rx) = watch::channel(None::<bool>);
            senders.insert(name.clone(), tx);
            signals.insert(name.clone(), rx);
        }

        let mut handles = Vec::with_capacity(plan.order.len());
        for name in &plan.order {
            let (Some(table), Some(done)) = (self.validated.tables.get(name), senders.remove(name))
            else {
                continue;
            };
            let dependencies: Vec<_> = plan
                .dependencies_of(name)
                .filter_map(|d| signals.get(d).map(|rx| (d.clone(), rx.clone())))
                .collect();

            let ctx = Arc::clone(ctx);
            let table = table.clone();
            let workers = Arc::clone(&workers);
            handles.push(tokio::spawn(async move {
                let ok = run_table(ctx, table, dependencies, workers).await;
                let _ = done.send(Some(ok));
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Job {}: table worker panicked: {}", self.id, e);
            }
        }
    }

    /// Phase 4: add foreign keys of tables this job created.
    ///
    /// A constraint is added only when both of its tables loaded. Every
    /// constraint that is skipped or fails lands in `constraint_errors`.
    async fn add_deferred_constraints(&self, ctx: &JobContext) {
        if ctx.inline_fks || ctx.created.is_empty() {
            return;
        }

        let statuses: HashMap<String, TaskStatus> = self
            .lock()
            .tasks
            .iter()
            .map(|t| (t.table.to_lowercase(), t.status))
            .collect();
        let loaded = |name: &str| statuses.get(&name.to_lowercase()) == Some(&TaskStatus::Done);

        let mut errors = Vec::new();
        let mut pending: Vec<(&Table, Vec<ForeignKey>)> = Vec::new();
        for name in &self.validated.plan.order {
            if !ctx.created.contains(name) {
                continue;
            }
            let Some(table) = self.validated.tables.get(name) else {
                continue;
            };
            let mut addable = Vec::new();
            for fk in &table.foreign_keys {
                if !statuses.contains_key(&fk.ref_table.to_lowercase()) {
                    warn!(
                        "{}: foreign key {} references {} outside this job, not added",
                        name,
                        fk.name,
                        fk.ref_full_name()
                    );
                    errors.push(ConstraintError {
                        table: name.clone(),
                        constraint: fk.name.clone(),
                        error: format!("references {} outside this job", fk.ref_full_name()),
                    });
                } else if self.cancel.is_cancelled() {
                    errors.push(ConstraintError {
                        table: name.clone(),
                        constraint: fk.name.clone(),
                        error: "skipped: job cancelled".into(),
                    });
                } else if !loaded(name) || !loaded(&fk.ref_table) {
                    errors.push(ConstraintError {
                        table: name.clone(),
                        constraint: fk.name.clone(),
                        error: format!("skipped: {} or {} did not load", name, fk.ref_table),
                    });
                } else {
                    addable.push(fk.clone());
                }
            }
            if !addable.is_empty() {
                pending.push((table, addable));
            }
        }

        if !pending.is_empty() {
            match self.registry.lease(&ctx.dest_id).await {
                Ok(dest) => {
                    for (table, fks) in pending {
                        let failures = dest.create_foreign_keys(table, &fks, &ctx.dest_schema).await;
                        debug!(
                            "{}: added {} of {} foreign keys",
                            table.name,
                            fks.len() - failures.len(),
                            fks.len()
                        );
                        for (constraint, e) in failures {
                            warn!("{}: foreign key {} failed: {}", table.name, constraint, e);
                            errors.push(ConstraintError {
                                table: table.name.clone(),
                                constraint,
                                error: e.to_string(),
                            });
                        }
                    }
                }
                Err(e) => {
                    for (table, fks) in pending {
                        for fk in fks {
                            errors.push(ConstraintError {
                                table: table.name.clone(),
                                constraint: fk.name,
                                error: e.to_string(),
                            });
                        }
                    }
                }
            }
        }

        self.lock().constraint_errors = errors;
    }
}

