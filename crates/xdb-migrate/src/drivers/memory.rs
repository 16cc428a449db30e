//! In-process adapter backed by shared maps.
//!
//! Speaks any vendor's dialect for DDL generation but keeps rows in memory.
//! Used for dry runs and for exercising the orchestrator without a server;
//! the fault hooks let callers inject transient and permanent failures.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::DbType;
use crate::core::traits::{Dialect, DialectAdapter};
use crate::core::{Batch, ForeignKey, Page, Row, SqlValue, Table};
use crate::drivers::common::spawn_paged_reader;
use crate::drivers::DialectImpl;
use crate::error::{MigrateError, Result};

#[derive(Debug, Clone)]
struct MemTable {
    def: Table,
    rows: Vec<Row>,
}

#[derive(Debug, Clone, Copy)]
enum WriteFault {
    Transient(u32),
    Permanent,
    Discard,
}

#[derive(Debug)]
struct MemoryState {
    tables: BTreeMap<String, MemTable>,
    write_faults: HashMap<String, WriteFault>,
    read_faults: HashMap<String, u32>,
    ddl_faults: BTreeSet<String>,
    ddl_log: Vec<String>,
    write_log: Vec<String>,
    enforcement_log: Vec<(String, bool)>,
    write_delay: Option<Duration>,
    supports_deferred: bool,
}

/// Adapter whose "database" is a shared in-memory map.
///
/// Clones share state, so a clone handed to the registry sees the same
/// tables as the value kept by the caller.
#[derive(Debug, Clone)]
pub struct MemoryAdapter {
    dialect: DialectImpl,
    default_schema: String,
    state: Arc<Mutex<MemoryState>>,
}

fn key(schema: &str, table: &str) -> String {
    format!("{}.{}", schema, table).to_lowercase()
}

impl MemoryAdapter {
    /// Empty database that generates `db_type` DDL.
    pub fn new(db_type: DbType, default_schema: impl Into<String>) -> Self {
        Self {
            dialect: DialectImpl::for_db_type(db_type),
            default_schema: default_schema.into(),
            state: Arc::new(Mutex::new(MemoryState {
                tables: BTreeMap::new(),
                write_faults: HashMap::new(),
                read_faults: HashMap::new(),
                ddl_faults: BTreeSet::new(),
                ddl_log: Vec::new(),
                write_log: Vec::new(),
                enforcement_log: Vec::new(),
                write_delay: None,
                supports_deferred: true,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a table with rows. Rows are in `table.columns` order.
    pub fn insert_table(&self, mut table: Table, rows: Vec<Row>) {
        table.sync_primary_key_flags();
        let k = key(&table.schema, &table.name);
        self.state().tables.insert(k, MemTable { def: table, rows });
    }

    /// Current rows of `schema.table`.
    pub fn rows(&self, schema: &str, table: &str) -> Vec<Row> {
        self.state()
            .tables
            .get(&key(schema, table))
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Current definition of `schema.table`.
    pub fn table(&self, schema: &str, table: &str) -> Option<Table> {
        self.state()
            .tables
            .get(&key(schema, table))
            .map(|t| t.def.clone())
    }

    /// Fail the next `times` writes to `schema.table` with a transient error.
    pub fn fail_writes_transiently(&self, schema: &str, table: &str, times: u32) {
        self.state()
            .write_faults
            .insert(key(schema, table), WriteFault::Transient(times));
    }

    /// Fail every write to `schema.table` with a non-transient error.
    pub fn fail_writes_permanently(&self, schema: &str, table: &str) {
        self.state()
            .write_faults
            .insert(key(schema, table), WriteFault::Permanent);
    }

    /// Acknowledge writes to `schema.table` without storing the rows.
    pub fn discard_writes(&self, schema: &str, table: &str) {
        self.state()
            .write_faults
            .insert(key(schema, table), WriteFault::Discard);
    }

    /// Fail the next `times` page reads of `schema.table` transiently.
    pub fn fail_reads_transiently(&self, schema: &str, table: &str, times: u32) {
        self.state().read_faults.insert(key(schema, table), times);
    }

    /// Fail every DDL statement that targets `schema.table`.
    pub fn fail_ddl(&self, schema: &str, table: &str) {
        self.state().ddl_faults.insert(key(schema, table));
    }

    /// Sleep this long inside every write.
    pub fn set_write_delay(&self, delay: Duration) {
        self.state().write_delay = Some(delay);
    }

    /// Pretend foreign keys cannot be added after load.
    pub fn set_supports_deferred_constraints(&self, supported: bool) {
        self.state().supports_deferred = supported;
    }

    /// Every DDL statement executed so far, in order.
    pub fn executed_ddl(&self) -> Vec<String> {
        self.state().ddl_log.clone()
    }

    /// Full name of the table of every successful write, in order.
    pub fn write_log(&self) -> Vec<String> {
        self.state().write_log.clone()
    }

    /// Every constraint enforcement toggle, in order.
    pub fn enforcement_log(&self) -> Vec<(String, bool)> {
        self.state().enforcement_log.clone()
    }

    fn check_ddl(&self, target: &str, sql: &str) -> Result<()> {
        let mut state = self.state();
        if state.ddl_faults.contains(&target.to_lowercase()) {
            return Err(MigrateError::ddl(target, "injected DDL failure"));
        }
        state.ddl_log.push(sql.to_string());
        Ok(())
    }

    fn read_page(&self, table: &Table, page: &Page, limit: usize) -> Result<Vec<Row>> {
        let mut state = self.state();
        let k = key(&table.schema, &table.name);
        if let Some(left) = state.read_faults.get_mut(&k) {
            if *left > 0 {
                *left -= 1;
                return Err(MigrateError::read(
                    table.full_name(),
                    "injected transient read failure",
                    true,
                ));
            }
        }
        let stored = state
            .tables
            .get(&k)
            .ok_or_else(|| MigrateError::NotFound(format!("table {}", table.full_name())))?;

        // Project stored rows onto the requested column list.
        let indices: Vec<Option<usize>> = table
            .columns
            .iter()
            .map(|c| {
                stored
                    .def
                    .columns
                    .iter()
                    .position(|s| s.name.eq_ignore_ascii_case(&c.name))
            })
            .collect();
        let project = |row: &Row| -> Row {
            indices
                .iter()
                .map(|i| i.and_then(|i| row.get(i).cloned()).unwrap_or(SqlValue::Null))
                .collect()
        };

        match page {
            Page::Keyset { column, after } => {
                let pos = stored
                    .def
                    .columns
                    .iter()
                    .position(|c| c.name.eq_ignore_ascii_case(column))
                    .ok_or_else(|| {
                        MigrateError::read(table.full_name(), format!("no column {}", column), false)
                    })?;
                let mut keyed: Vec<(i64, &Row)> = stored
                    .rows
                    .iter()
                    .filter_map(|r| r.get(pos).and_then(|v| v.as_i64()).map(|k| (k, r)))
                    .filter(|(k, _)| after.map_or(true, |a| *k > a))
                    .collect();
                keyed.sort_by_key(|(k, _)| *k);
                Ok(keyed.into_iter().take(limit).map(|(_, r)| project(r)).collect())
            }
            Page::Offset { offset, .. } => Ok(stored
                .rows
                .iter()
                .skip(*offset as usize)
                .take(limit)
                .map(project)
                .collect()),
        }
    }

    /// Without `within_tx`, rows ahead of a failure stay written: an
    /// injected fault lands after the first half of the batch and a
    /// constraint violation after the last good row.
    fn store_rows(&self, table: &Table, rows: Vec<Row>, within_tx: bool) -> Result<u64> {
        let mut guard = self.state();
        let state = &mut *guard;
        let k = key(&table.schema, &table.name);
        let name = table.full_name();

        let fault = match state.write_faults.get_mut(&k) {
            Some(WriteFault::Transient(left)) if *left > 0 => {
                *left -= 1;
                Some(MigrateError::write(
                    &name,
                    "injected transient write failure",
                    true,
                ))
            }
            Some(WriteFault::Permanent) => {
                Some(MigrateError::write(&name, "injected write failure", false))
            }
            Some(WriteFault::Discard) => return Ok(rows.len() as u64),
            _ => None,
        };

        match fault {
            None => apply_rows(state, table, rows, within_tx),
            Some(e) => {
                if !within_tx {
                    let prefix = rows.len() / 2;
                    apply_rows(state, table, rows.into_iter().take(prefix).collect(), false)?;
                }
                Err(e)
            }
        }
    }
}

/// Validate and append `rows` to the stored table.
///
/// Within a transaction a bad row rejects the whole call; otherwise the rows
/// before it are kept.
fn apply_rows(
    state: &mut MemoryState,
    table: &Table,
    rows: Vec<Row>,
    within_tx: bool,
) -> Result<u64> {
    let name = table.full_name();
    let stored = state
        .tables
        .get_mut(&key(&table.schema, &table.name))
        .ok_or_else(|| MigrateError::write(&name, "table does not exist", false))?;

    let indices: Vec<Option<usize>> = stored
        .def
        .columns
        .iter()
        .map(|c| {
            table
                .columns
                .iter()
                .position(|s| s.name.eq_ignore_ascii_case(&c.name))
        })
        .collect();
    let pk: Vec<usize> = stored
        .def
        .primary_key
        .iter()
        .filter_map(|p| {
            stored
                .def
                .columns
                .iter()
                .position(|c| c.name.eq_ignore_ascii_case(p))
        })
        .collect();
    let key_of = |r: &Row| -> String {
        pk.iter()
            .map(|i| format!("{:?}", r.get(*i)))
            .collect::<Vec<_>>()
            .join("|")
    };
    let mut seen: BTreeSet<String> = if pk.is_empty() {
        BTreeSet::new()
    } else {
        stored.rows.iter().map(key_of).collect()
    };

    let mut accepted: Vec<Row> = Vec::with_capacity(rows.len());
    let mut failure = None;
    for row in rows {
        let row: Row = indices
            .iter()
            .map(|i| i.and_then(|i| row.get(i).cloned()).unwrap_or(SqlValue::Null))
            .collect();
        let null_in = stored
            .def
            .columns
            .iter()
            .zip(&row)
            .find(|(col, value)| !col.is_nullable && value.is_null())
            .map(|(col, _)| col.name.clone());
        if let Some(column) = null_in {
            failure = Some(MigrateError::write(
                &name,
                format!("NULL in NOT NULL column {}", column),
                false,
            ));
            break;
        }
        if !pk.is_empty() && !seen.insert(key_of(&row)) {
            failure = Some(MigrateError::write(
                &name,
                format!("duplicate primary key {}", key_of(&row)),
                false,
            ));
            break;
        }
        accepted.push(row);
    }

    if within_tx {
        if let Some(e) = failure {
            return Err(e);
        }
    }
    let n = accepted.len() as u64;
    if n > 0 {
        stored.rows.extend(accepted);
        state.write_log.push(name);
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(n),
    }
}

#[async_trait]
impl DialectAdapter for MemoryAdapter {
    fn dialect(&self) -> &DialectImpl {
        &self.dialect
    }

    fn default_schema(&self) -> &str {
        &self.default_schema
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        Ok(vec!["memory".to_string()])
    }

    async fn list_schemas(&self) -> Result<Vec<String>> {
        let mut schemas: BTreeSet<String> = self
            .state()
            .tables
            .values()
            .map(|t| t.def.schema.clone())
            .collect();
        schemas.insert(self.default_schema.clone());
        Ok(schemas.into_iter().collect())
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .state()
            .tables
            .values()
            .filter(|t| t.def.schema.eq_ignore_ascii_case(schema))
            .map(|t| t.def.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn describe_table(&self, schema: &str, table: &str) -> Result<Table> {
        self.table(schema, table)
            .ok_or_else(|| MigrateError::NotFound(format!("table {}.{}", schema, table)))
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        Ok(self.state().tables.contains_key(&key(schema, table)))
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<i64> {
        self.state()
            .tables
            .get(&key(schema, table))
            .map(|t| t.rows.len() as i64)
            .ok_or_else(|| MigrateError::NotFound(format!("table {}.{}", schema, table)))
    }

    fn stream_rows(&self, table: &Table, batch_size: usize) -> mpsc::Receiver<Result<Batch>> {
        let adapter = self.clone();
        let def = table.clone();
        spawn_paged_reader(table.clone(), batch_size, move |page| {
            let result = adapter.read_page(&def, &page, batch_size);
            async move { result }
        })
    }

    async fn write_batch(&self, table: &Table, rows: Vec<Row>, within_tx: bool) -> Result<u64> {
        let delay = self.state().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.store_rows(table, rows, within_tx)
    }

    async fn execute_ddl(&self, target: &str, sql: &str) -> Result<()> {
        self.check_ddl(target, sql)
    }

    async fn truncate_tables(&self, schema: &str, tables: &[String]) -> Result<()> {
        let mut state = self.state();
        for name in tables {
            let t = state
                .tables
                .get_mut(&key(schema, name))
                .ok_or_else(|| MigrateError::ddl(format!("{}.{}", schema, name), "no such table"))?;
            t.rows.clear();
        }
        debug!("memory: truncated {} tables in {}", tables.len(), schema);
        Ok(())
    }

    async fn set_constraint_enforcement(
        &self,
        schema: &str,
        table: &str,
        enabled: bool,
    ) -> Result<()> {
        self.state()
            .enforcement_log
            .push((format!("{}.{}", schema, table), enabled));
        Ok(())
    }

    async fn sample_rows(&self, table: &Table, limit: usize) -> Result<Vec<Row>> {
        self.read_page(
            table,
            &Page::Offset {
                order_by: Vec::new(),
                offset: 0,
            },
            limit,
        )
    }

    async fn close(&self) {}

    fn supports_deferred_constraints(&self) -> bool {
        self.state().supports_deferred
    }

    async fn create_table(&self, table: &Table, schema: &str, inline_fks: bool) -> Result<()> {
        let target = format!("{}.{}", schema, table.name);
        let sql = self.dialect.create_table_sql(table, schema, inline_fks);
        self.check_ddl(&target, &sql)?;

        let mut def = table.clone();
        def.schema = schema.to_string();
        def.indexes.clear();
        if !inline_fks {
            def.foreign_keys.clear();
        }
        for col in &mut def.columns {
            col.data_type = self.dialect.column_type(col);
        }
        def.sync_primary_key_flags();

        self.state()
            .tables
            .entry(key(schema, &table.name))
            .or_insert(MemTable {
                def,
                rows: Vec::new(),
            });
        Ok(())
    }

    async fn create_indexes(&self, table: &Table, schema: &str) -> Result<usize> {
        let target = format!("{}.{}", schema, table.name);
        for idx in &table.indexes {
            let sql = self.dialect.create_index_sql(table, idx, schema);
            self.check_ddl(&target, &sql)?;
            if let Some(t) = self.state().tables.get_mut(&key(schema, &table.name)) {
                t.def.indexes.push(idx.clone());
            }
        }
        Ok(table.indexes.len())
    }

    async fn create_foreign_keys(
        &self,
        table: &Table,
        fks: &[ForeignKey],
        schema: &str,
    ) -> Vec<(String, MigrateError)> {
        let target = format!("{}.{}", schema, table.name);
        let mut failures = Vec::new();
        for fk in fks {
            let sql = self.dialect.add_foreign_key_sql(table, fk, schema);
            if let Err(e) = self.check_ddl(&target, &sql) {
                failures.push((fk.name.clone(), e));
                continue;
            }
            let mut state = self.state();
            if !state.tables.contains_key(&key(schema, &fk.ref_table)) {
                failures.push((
                    fk.name.clone(),
                    MigrateError::ddl(&target, format!("referenced table {} missing", fk.ref_table)),
                ));
                continue;
            }
            if let Some(t) = state.tables.get_mut(&key(schema, &table.name)) {
                t.def.foreign_keys.push(fk.clone());
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Column;
    use crate::dialect::CanonicalType;

    fn users(n: i32) -> (Table, Vec<Row>) {
        let mut t = Table::new("app", "users");
        t.columns
            .push(Column::new("id", "int", CanonicalType::Integer).not_null());
        t.columns
            .push(Column::new("name", "varchar", CanonicalType::VariableString(20)));
        t.primary_key = vec!["id".into()];
        let rows = (1..=n)
            .map(|i| vec![SqlValue::I32(i), SqlValue::Text(format!("user{}", i))])
            .collect();
        (t, rows)
    }

    #[tokio::test]
    async fn test_stream_keyset_pages() {
        let db = MemoryAdapter::new(DbType::Mysql, "app");
        let (t, rows) = users(25);
        db.insert_table(t.clone(), rows);

        let mut rx = db.stream_rows(&t, 10);
        let mut total = 0;
        while let Some(batch) = rx.recv().await {
            let batch = batch.unwrap();
            total += batch.len();
            if batch.is_last {
                break;
            }
        }
        assert_eq!(total, 25);
    }

    #[tokio::test]
    async fn test_duplicate_primary_key_is_permanent() {
        let db = MemoryAdapter::new(DbType::Postgresql, "public");
        let (t, rows) = users(3);
        db.insert_table(t.clone(), rows);

        let err = db
            .write_batch(&t, vec![vec![SqlValue::I32(2), SqlValue::Null]], true)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(db.row_count("app", "users").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_transient_write_fault_clears() {
        let db = MemoryAdapter::new(DbType::Postgresql, "public");
        let (t, _) = users(0);
        db.insert_table(t.clone(), Vec::new());
        db.fail_writes_transiently("app", "users", 1);

        let row = vec![SqlValue::I32(1), SqlValue::Null];
        assert!(db.write_batch(&t, vec![row.clone()], true).await.unwrap_err().is_transient());
        assert_eq!(db.write_batch(&t, vec![row], true).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fault_outside_transaction_keeps_prefix() {
        let db = MemoryAdapter::new(DbType::Postgresql, "public");
        let (t, rows) = users(10);
        db.insert_table(t.clone(), Vec::new());
        db.fail_writes_transiently("app", "users", 1);

        assert!(db.write_batch(&t, rows.clone(), true).await.is_err());
        assert_eq!(db.row_count("app", "users").await.unwrap(), 0);

        db.fail_writes_transiently("app", "users", 1);
        assert!(db.write_batch(&t, rows.clone(), false).await.unwrap_err().is_transient());
        assert_eq!(db.row_count("app", "users").await.unwrap(), 5);

        // Replaying the batch trips over the rows that already landed.
        let err = db.write_batch(&t, rows, false).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("duplicate primary key"));
        assert_eq!(db.row_count("app", "users").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_constraint_violation_outside_transaction_keeps_good_rows() {
        let db = MemoryAdapter::new(DbType::Postgresql, "public");
        let (t, mut rows) = users(4);
        db.insert_table(t.clone(), Vec::new());
        rows[2][0] = SqlValue::Null;

        assert!(db.write_batch(&t, rows.clone(), true).await.is_err());
        assert_eq!(db.row_count("app", "users").await.unwrap(), 0);
        assert!(db.write_batch(&t, rows, false).await.is_err());
        assert_eq!(db.row_count("app", "users").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_create_table_records_ddl() {
        let db = MemoryAdapter::new(DbType::Sqlserver, "dbo");
        let (t, _) = users(0);
        db.create_table(&t, "dbo", false).await.unwrap();

        let created = db.table("dbo", "users").unwrap();
        assert_eq!(created.columns[1].data_type, "NVARCHAR(20)");
        assert!(db.executed_ddl()[0].starts_with("CREATE TABLE [dbo].[users]"));
        assert!(db.table_exists("DBO", "USERS").await.unwrap());
    }

    #[tokio::test]
    async fn test_foreign_key_to_missing_table_fails() {
        let db = MemoryAdapter::new(DbType::Postgresql, "public");
        let (t, _) = users(0);
        db.create_table(&t, "public", false).await.unwrap();
        let fk = ForeignKey {
            name: "fk_users_team".into(),
            columns: vec!["id".into()],
            ref_schema: "public".into(),
            ref_table: "teams".into(),
            ref_columns: vec!["id".into()],
            on_delete: "NO ACTION".into(),
            on_update: "NO ACTION".into(),
        };
        let failures = db.create_foreign_keys(&t, &[fk], "public").await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "fk_users_team");
    }
}
