//! Per-table transfer: dependency gating, the batch loop, verification and
//! index creation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::{MigrationJob, TableMigrationTask, TaskStatus};
use super::retry::RetryPolicy;
use super::JobOptions;
use crate::core::traits::DialectAdapter;
use crate::core::{Row, SqlValue, Table};
use crate::error::{MigrateError, Result};
use crate::progress::{EventKind, ProgressBus, ProgressEvent};
use crate::registry::{ConnectionRegistry, Lease};

/// Completion signal of one table: `None` while running, then whether it
/// finished `Done`.
pub(crate) type DoneSignal = watch::Receiver<Option<bool>>;

/// State shared by every worker of one job.
pub(crate) struct JobContext {
    pub job_id: String,
    pub source_id: String,
    pub dest_id: String,
    pub dest_schema: String,
    pub options: JobOptions,
    pub retry: RetryPolicy,
    pub registry: Arc<ConnectionRegistry>,
    pub bus: ProgressBus,
    pub cancel: CancellationToken,
    pub state: Arc<Mutex<MigrationJob>>,
    pub started: Instant,
    /// Foreign keys are part of CREATE TABLE and enforcement is switched
    /// off while loading.
    pub inline_fks: bool,
    /// Tables this job created on the destination.
    pub created: HashSet<String>,
}

impl JobContext {
    pub fn lock(&self) -> MutexGuard<'_, MigrationJob> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lease a handle, giving up when the job is cancelled first.
    pub async fn lease(&self, connection_id: &str) -> Result<Lease> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(MigrateError::Cancelled),
            lease = self.registry.lease(connection_id) => lease,
        }
    }

    pub fn task_status(&self, table: &str) -> Option<TaskStatus> {
        self.lock().task(table).map(|t| t.status)
    }

    fn task_event(&self, kind: EventKind, task: &TableMigrationTask) -> ProgressEvent {
        ProgressEvent::table(
            &self.job_id,
            kind,
            &task.table,
            task.rows_migrated,
            task.total_rows,
            self.started.elapsed(),
            task.status,
        )
    }

    /// Apply `f` to the task, then publish a task event if its status moved.
    fn update(&self, table: &str, f: impl FnOnce(&mut TableMigrationTask) -> bool) -> bool {
        let event = {
            let mut job = self.lock();
            let Some(task) = job.task_mut(table) else {
                return false;
            };
            if !f(task) {
                return false;
            }
            self.task_event(EventKind::Task, task)
        };
        self.bus.progress(event);
        true
    }

    pub fn transition(&self, table: &str, next: TaskStatus) -> bool {
        self.update(table, |t| t.advance(next))
    }

    pub fn fail_task(&self, table: &str, error: &MigrateError) {
        self.update(table, |t| t.fail(error));
    }

    pub fn cancel_task(&self, table: &str) {
        self.transition(table, TaskStatus::Cancelled);
    }

    fn set_total(&self, table: &str, total: i64) {
        if let Some(task) = self.lock().task_mut(table) {
            task.total_rows = Some(total);
        }
    }

    fn flag_partial_batch(&self, table: &str) {
        if let Some(task) = self.lock().task_mut(table) {
            task.partial_batch_risk = true;
        }
    }

    /// Record committed rows and publish a batch snapshot.
    fn batch_done(&self, table: &str, rows_migrated: i64) {
        let event = {
            let mut job = self.lock();
            let Some(task) = job.task_mut(table) else {
                return;
            };
            task.rows_migrated = rows_migrated;
            ProgressEvent::table(
                &self.job_id,
                EventKind::Batch,
                &task.table,
                task.rows_migrated,
                task.total_rows,
                self.started.elapsed(),
                task.status,
            )
        };
        self.bus.progress(event);
    }
}

/// Wait for dependencies and a worker slot, then migrate `table`.
///
/// Returns whether the table finished `Done`. Every path leaves the task in
/// a terminal state.
pub(crate) async fn run_table(
    ctx: Arc<JobContext>,
    table: Table,
    dependencies: Vec<(String, DoneSignal)>,
    workers: Arc<Semaphore>,
) -> bool {
    let name = table.name.clone();
    if ctx.task_status(&name).map_or(true, |s| s.is_terminal()) {
        return false;
    }

    for (dependency, mut signal) in dependencies {
        let outcome = match signal.wait_for(Option::is_some).await {
            Ok(v) => *v,
            Err(_) => None,
        };
        if outcome != Some(true) {
            if ctx.cancel.is_cancelled() {
                ctx.cancel_task(&name);
            } else {
                warn!("{}: skipped, dependency {} did not load", name, dependency);
                ctx.fail_task(
                    &name,
                    &MigrateError::DependencyFailed {
                        table: name.clone(),
                        dependency,
                    },
                );
            }
            return false;
        }
    }

    let _permit = match workers.acquire_owned().await {
        Ok(p) => p,
        Err(_) => {
            ctx.fail_task(&name, &MigrateError::Internal("worker pool closed".into()));
            return false;
        }
    };
    if ctx.cancel.is_cancelled() {
        ctx.cancel_task(&name);
        return false;
    }

    match TableWorker::new(&ctx, &table).run().await {
        Ok(()) => true,
        Err(MigrateError::Cancelled) => {
            info!("{}: cancelled", name);
            ctx.cancel_task(&name);
            false
        }
        Err(e) => {
            error!("{}: {}", name, e);
            ctx.fail_task(&name, &e);
            false
        }
    }
}

/// Where each destination column's value comes from.
struct Projection {
    /// Destination table restricted to the columns being written.
    dest: Table,
    /// Source column index per destination column.
    sources: Vec<usize>,
}

impl Projection {
    /// Match source columns to destination columns by name.
    fn build(source: &Table, dest: &Table) -> Result<Self> {
        let mut target = dest.clone();
        target.columns.clear();
        let mut sources = Vec::new();
        for (i, col) in source.columns.iter().enumerate() {
            match dest.column(&col.name) {
                Some(d) => {
                    target.columns.push(d.clone());
                    sources.push(i);
                }
                None => warn!(
                    "{}: column {} missing on destination, not copied",
                    source.name, col.name
                ),
            }
        }
        if target.columns.is_empty() {
            return Err(MigrateError::write(
                &source.name,
                "no source column exists on the destination",
                false,
            ));
        }
        Ok(Self {
            dest: target,
            sources,
        })
    }

    /// Reorder and coerce one batch. A value that cannot be represented
    /// fails the batch.
    fn convert(&self, rows: Vec<Row>) -> Result<Vec<Row>> {
        rows.into_iter()
            .map(|mut row| {
                self.sources
                    .iter()
                    .zip(&self.dest.columns)
                    .map(|(&i, col)| {
                        let value = row
                            .get_mut(i)
                            .map(|v| std::mem::replace(v, SqlValue::Null))
                            .unwrap_or(SqlValue::Null);
                        value.coerce(&col.canonical).map_err(|e| {
                            MigrateError::write(
                                &self.dest.name,
                                format!("column {}: {}", col.name, e),
                                false,
                            )
                        })
                    })
                    .collect()
            })
            .collect()
    }
}

/// Copies one table. Holds a destination lease for its whole run.
struct TableWorker<'a> {
    ctx: &'a JobContext,
    table: &'a Table,
}

impl<'a> TableWorker<'a> {
    fn new(ctx: &'a JobContext, table: &'a Table) -> Self {
        Self { ctx, table }
    }

    async fn run(&self) -> Result<()> {
        let ctx = self.ctx;
        let name = &self.table.name;
        let dest = ctx.lease(&ctx.dest_id).await?;

        let dest_table = dest.describe_table(&ctx.dest_schema, name).await?;
        let projection = Projection::build(self.table, &dest_table)?;

        let total = {
            let source = ctx.lease(&ctx.source_id).await?;
            source.row_count(&self.table.schema, name).await?
        };
        let baseline = dest.row_count(&ctx.dest_schema, &dest_table.name).await?;
        ctx.set_total(name, total);
        ctx.transition(name, TaskStatus::Copying);
        debug!("{}: copying {} rows", name, total);

        if ctx.inline_fks {
            dest.set_constraint_enforcement(&ctx.dest_schema, &dest_table.name, false)
                .await?;
        }
        let copied = self.copy_rows(&dest, &projection).await;
        if ctx.inline_fks {
            if let Err(e) = dest
                .set_constraint_enforcement(&ctx.dest_schema, &dest_table.name, true)
                .await
            {
                warn!("{}: re-enabling constraints failed: {}", name, e);
            }
        }
        let migrated = copied?;

        let written = dest.row_count(&ctx.dest_schema, &dest_table.name).await? - baseline;
        if migrated != total || written != total {
            return Err(MigrateError::Verification {
                table: name.clone(),
                expected: total,
                actual: if migrated != total { migrated } else { written },
            });
        }

        if ctx.options.include_indexes && ctx.created.contains(name) && !self.table.indexes.is_empty()
        {
            ctx.transition(name, TaskStatus::Indexing);
            let created = dest.create_indexes(self.table, &ctx.dest_schema).await?;
            debug!("{}: created {} indexes", name, created);
        }

        ctx.transition(name, TaskStatus::Done);
        info!("{}: {} rows migrated", name, migrated);
        Ok(())
    }

    /// Stream, convert and write every row. Returns rows written.
    ///
    /// A transient read error restarts the scan from row 0 and skips rows
    /// already written.
    async fn copy_rows(&self, dest: &Lease, projection: &Projection) -> Result<i64> {
        let ctx = self.ctx;
        let name = &self.table.name;
        let retry = &ctx.retry;
        let use_tx = ctx.options.use_transactions;
        let mut migrated: i64 = 0;
        let mut read_retries: u32 = 0;

        'scan: loop {
            let source = ctx.lease(&ctx.source_id).await?;
            let mut batches = source.stream_rows(self.table, ctx.options.batch_size);
            let mut skip = migrated as usize;

            loop {
                if ctx.cancel.is_cancelled() {
                    return Err(MigrateError::Cancelled);
                }

                let next = retry
                    .with_timeout(&format!("read batch from {}", name), async {
                        Ok(batches.recv().await)
                    })
                    .await
                    .and_then(|b| b.transpose());

                let batch = match next {
                    Ok(Some(batch)) => batch,
                    Ok(None) => break 'scan,
                    Err(e) if retry.should_retry(&e, read_retries) => {
                        let delay = retry.delay(read_retries);
                        read_retries += 1;
                        warn!(
                            "{}: read failed ({}), restarting scan {}/{} in {:?}",
                            name, e, read_retries, retry.max_retries, delay
                        );
                        tokio::time::sleep(delay).await;
                        continue 'scan;
                    }
                    Err(e) => return Err(e),
                };

                let is_last = batch.is_last;
                let mut rows = batch.rows;
                if skip > 0 {
                    let n = skip.min(rows.len());
                    rows.drain(..n);
                    skip -= n;
                }

                if !rows.is_empty() {
                    let rows = projection.convert(rows)?;
                    let label = format!("write batch to {}", name);
                    let written = retry
                        .run(&label, || dest.write_batch(&projection.dest, rows.clone(), use_tx))
                        .await;
                    match written {
                        Ok(n) => {
                            migrated += n as i64;
                            ctx.batch_done(name, migrated);
                        }
                        Err(e) => {
                            if !use_tx {
                                ctx.flag_partial_batch(name);
                            }
                            return Err(e);
                        }
                    }
                }

                if is_last {
                    break 'scan;
                }
            }
        }

        Ok(migrated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Column;
    use crate::dialect::CanonicalType;

    fn source() -> Table {
        let mut t = Table::new("shop", "orders");
        t.columns
            .push(Column::new("id", "int", CanonicalType::Integer).not_null());
        t.columns.push(Column::new("note", "text", CanonicalType::Text));
        t.columns.push(Column::new(
            "total",
            "varchar",
            CanonicalType::VariableString(20),
        ));
        t
    }

    fn dest() -> Table {
        let mut t = Table::new("public", "orders");
        t.columns.push(Column::new(
            "total",
            "numeric",
            CanonicalType::Decimal {
                precision: 10,
                scale: 2,
            },
        ));
        t.columns
            .push(Column::new("id", "bigint", CanonicalType::BigInteger).not_null());
        t
    }

    #[test]
    fn test_projection_reorders_and_drops() {
        let p = Projection::build(&source(), &dest()).unwrap();
        assert_eq!(p.dest.column_names(), vec!["id", "total"]);
        assert_eq!(p.sources, vec![0, 2]);

        let rows = p
            .convert(vec![vec![
                SqlValue::I32(7),
                SqlValue::Text("x".into()),
                SqlValue::Text("12.50".into()),
            ]])
            .unwrap();
        assert_eq!(rows[0][0], SqlValue::I64(7));
        assert!(matches!(rows[0][1], SqlValue::Decimal(_)));
    }

    #[test]
    fn test_unrepresentable_value_fails_batch() {
        let p = Projection::build(&source(), &dest()).unwrap();
        let err = p
            .convert(vec![vec![
                SqlValue::I32(1),
                SqlValue::Null,
                SqlValue::Text("abc".into()),
            ]])
            .unwrap_err();
        assert!(matches!(err, MigrateError::Write { transient: false, .. }));
        assert!(err.to_string().contains("total"));
    }

    #[test]
    fn test_projection_without_shared_columns() {
        let mut other = dest();
        other.columns.clear();
        other
            .columns
            .push(Column::new("unrelated", "int", CanonicalType::Integer));
        assert!(Projection::build(&source(), &other).is_err());
    }
}
