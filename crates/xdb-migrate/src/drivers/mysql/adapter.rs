//! MySQL/MariaDB adapter.
//!
//! Catalog queries and table scans go through a single-connection SQLx pool.
//! Writes, DDL and session settings go through one dedicated `mysql_async`
//! connection, opened on first use, so `FOREIGN_KEY_CHECKS` set on it stays
//! in effect for the writes that follow.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder, SslOpts, TxOpts};
use rust_decimal::Decimal;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::{MySql, Row as _, ValueRef};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::config::{DbType, Endpoint};
use crate::core::traits::{Dialect, DialectAdapter};
use crate::core::{Batch, Column, ForeignKey, Index, Row, SqlValue, Table};
use crate::dialect::{CanonicalType, ToCanonical};
use crate::drivers::common::{spawn_paged_reader, SslMode};
use crate::drivers::DialectImpl;
use crate::error::{MigrateError, Result};

/// Server error numbers worth retrying: lock wait timeout, deadlock,
/// server gone away, lost connection.
const TRANSIENT_SERVER_ERRORS: &[u16] = &[1205, 1213, 2006, 2013];

const SYSTEM_SCHEMAS: &[&str] = &["information_schema", "mysql", "performance_schema", "sys"];

/// MySQL/MariaDB connection handle.
pub struct MysqlAdapter {
    pool: MySqlPool,
    writer: Mutex<Option<Conn>>,
    writer_opts: Opts,
    dialect: DialectImpl,
    default_schema: String,
}

impl MysqlAdapter {
    /// Open the read pool. The write connection is opened on first use.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let ssl_mode = SslMode::parse(&endpoint.ssl_mode)?;
        let sqlx_ssl = match ssl_mode {
            SslMode::Disable => MySqlSslMode::Disabled,
            SslMode::Prefer => MySqlSslMode::Preferred,
            SslMode::Require => MySqlSslMode::Required,
            SslMode::VerifyCa => MySqlSslMode::VerifyCa,
            SslMode::VerifyFull => MySqlSslMode::VerifyIdentity,
        };
        if ssl_mode == SslMode::Disable {
            warn!("MySQL TLS is disabled. Credentials will be transmitted in plaintext.");
        }

        let options = MySqlConnectOptions::new()
            .host(&endpoint.host)
            .port(endpoint.port())
            .database(&endpoint.database)
            .username(&endpoint.user)
            .password(&endpoint.password)
            .ssl_mode(sqlx_ssl);

        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(endpoint.connect_timeout_secs))
            .connect_with(options)
            .await
            .map_err(|e| MigrateError::connection(e, format!("connecting to {}", endpoint.describe())))?;

        let ssl_opts = if ssl_mode.uses_tls() {
            Some(SslOpts::default().with_danger_accept_invalid_certs(ssl_mode.accepts_invalid_certs()))
        } else {
            None
        };
        let mut builder = OptsBuilder::default()
            .ip_or_hostname(endpoint.host.clone())
            .tcp_port(endpoint.port())
            .db_name(Some(endpoint.database.clone()))
            .user(Some(endpoint.user.clone()))
            .pass(Some(endpoint.password.clone()))
            .init(vec!["SET NAMES utf8mb4"]);
        if let Some(ssl) = ssl_opts {
            builder = builder.ssl_opts(ssl);
        }

        Ok(Self {
            pool,
            writer: Mutex::new(None),
            writer_opts: builder.into(),
            dialect: DialectImpl::for_db_type(DbType::Mysql),
            default_schema: endpoint.default_schema(),
        })
    }

    /// The write connection, opened if needed. The guard always holds `Some`.
    async fn writer(&self) -> Result<MutexGuard<'_, Option<Conn>>> {
        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            let conn = Conn::new(self.writer_opts.clone())
                .await
                .map_err(|e| MigrateError::connection(e, "opening MySQL write connection"))?;
            *guard = Some(conn);
        }
        Ok(guard)
    }

    /// Run statements on the write connection, dropping it on transient
    /// failure so the next call reconnects.
    async fn run_on_writer(&self, statements: &[String]) -> std::result::Result<(), (String, bool)> {
        let mut guard = self.writer().await.map_err(|e| (e.to_string(), true))?;
        let result = match guard.as_mut() {
            Some(conn) => {
                let mut result = Ok(());
                for sql in statements {
                    if let Err(e) = conn.query_drop(sql.as_str()).await {
                        result = Err(e);
                        break;
                    }
                }
                result
            }
            None => return Err(("write connection unavailable".to_string(), true)),
        };
        result.map_err(|e| {
            let transient = is_transient_write(&e);
            if transient {
                *guard = None;
            }
            (e.to_string(), transient)
        })
    }

    async fn fetch_rows(&self, table: &Table, sql: &str) -> Result<Vec<Row>> {
        fetch_rows(&self.pool, table, sql).await
    }

    async fn load_columns(&self, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT
                CAST(COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME,
                CAST(DATA_TYPE AS CHAR(255)) AS DATA_TYPE,
                CAST(COLUMN_TYPE AS CHAR(255)) AS COLUMN_TYPE,
                CAST(CASE
                    WHEN CHARACTER_MAXIMUM_LENGTH IS NULL THEN 0
                    WHEN CHARACTER_MAXIMUM_LENGTH > 2147483647 THEN -1
                    ELSE CHARACTER_MAXIMUM_LENGTH
                END AS SIGNED) AS max_length,
                CAST(COALESCE(NUMERIC_PRECISION, 0) AS SIGNED) AS num_precision,
                CAST(COALESCE(NUMERIC_SCALE, 0) AS SIGNED) AS num_scale,
                CAST(IF(IS_NULLABLE = 'YES', 1, 0) AS SIGNED) AS is_nullable,
                CAST(IF(EXTRA LIKE '%auto_increment%', 1, 0) AS SIGNED) AS is_identity,
                CAST(COLUMN_DEFAULT AS CHAR(4000)) AS COLUMN_DEFAULT,
                CAST(ORDINAL_POSITION AS SIGNED) AS ORDINAL_POSITION
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&table.schema)
            .bind(&table.name)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| catalog_error(e, "loading MySQL columns"))?;

        for row in rows {
            let column_type: String = get(&row, "COLUMN_TYPE")?;
            let mut data_type: String = get(&row, "DATA_TYPE")?;
            if column_type.starts_with("tinyint(1)") {
                data_type = "tinyint(1)".to_string();
            }
            if column_type.contains("unsigned") {
                data_type.push_str(" unsigned");
            }
            let max_length: i64 = get(&row, "max_length")?;
            let precision: i64 = get(&row, "num_precision")?;
            let scale: i64 = get(&row, "num_scale")?;
            let (max_length, precision, scale) = (max_length as i32, precision as i32, scale as i32);
            let info = self
                .dialect
                .to_canonical(&data_type, max_length, precision, scale);

            table.columns.push(Column {
                name: get(&row, "COLUMN_NAME")?,
                data_type,
                canonical: info.canonical_type,
                canonical_warning: info.warning,
                max_length,
                precision,
                scale,
                is_nullable: get::<i64>(&row, "is_nullable")? == 1,
                is_primary_key: false,
                is_identity: get::<i64>(&row, "is_identity")? == 1,
                default_expr: get(&row, "COLUMN_DEFAULT")?,
                ordinal_pos: get::<i64>(&row, "ORDINAL_POSITION")? as i32,
            });
        }
        Ok(())
    }

    async fn load_primary_key(&self, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT CAST(COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME
            FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY'
            ORDER BY ORDINAL_POSITION
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&table.schema)
            .bind(&table.name)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| catalog_error(e, "loading MySQL primary key"))?;

        for row in rows {
            table.primary_key.push(get(&row, "COLUMN_NAME")?);
        }
        table.sync_primary_key_flags();
        Ok(())
    }

    async fn load_indexes(&self, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT
                CAST(INDEX_NAME AS CHAR(255)) AS INDEX_NAME,
                CAST(GROUP_CONCAT(COLUMN_NAME ORDER BY SEQ_IN_INDEX SEPARATOR ',') AS CHAR(4096)) AS columns,
                CAST(IF(NON_UNIQUE = 0, 1, 0) AS SIGNED) AS is_unique
            FROM INFORMATION_SCHEMA.STATISTICS
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
              AND INDEX_NAME != 'PRIMARY'
            GROUP BY INDEX_NAME, NON_UNIQUE
            ORDER BY INDEX_NAME
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&table.schema)
            .bind(&table.name)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| catalog_error(e, "loading MySQL indexes"))?;

        for row in rows {
            let columns: String = get(&row, "columns")?;
            table.indexes.push(Index {
                name: get(&row, "INDEX_NAME")?,
                columns: columns.split(',').map(|s| s.to_string()).collect(),
                is_unique: get::<i64>(&row, "is_unique")? == 1,
            });
        }
        Ok(())
    }

    async fn load_foreign_keys(&self, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT
                CAST(rc.CONSTRAINT_NAME AS CHAR(255)) AS CONSTRAINT_NAME,
                CAST(kcu.COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME,
                CAST(kcu.REFERENCED_TABLE_SCHEMA AS CHAR(255)) AS REFERENCED_TABLE_SCHEMA,
                CAST(kcu.REFERENCED_TABLE_NAME AS CHAR(255)) AS REFERENCED_TABLE_NAME,
                CAST(kcu.REFERENCED_COLUMN_NAME AS CHAR(255)) AS REFERENCED_COLUMN_NAME,
                CAST(rc.DELETE_RULE AS CHAR(64)) AS DELETE_RULE,
                CAST(rc.UPDATE_RULE AS CHAR(64)) AS UPDATE_RULE
            FROM INFORMATION_SCHEMA.REFERENTIAL_CONSTRAINTS rc
            JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu
                ON rc.CONSTRAINT_SCHEMA = kcu.CONSTRAINT_SCHEMA
                AND rc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME
                AND rc.TABLE_NAME = kcu.TABLE_NAME
            WHERE rc.CONSTRAINT_SCHEMA = ? AND rc.TABLE_NAME = ?
            ORDER BY rc.CONSTRAINT_NAME, kcu.ORDINAL_POSITION
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&table.schema)
            .bind(&table.name)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| catalog_error(e, "loading MySQL foreign keys"))?;

        for row in rows {
            let name: String = get(&row, "CONSTRAINT_NAME")?;
            let column: String = get(&row, "COLUMN_NAME")?;
            let ref_column: String = get(&row, "REFERENCED_COLUMN_NAME")?;
            match table.foreign_keys.iter_mut().find(|fk| fk.name == name) {
                Some(fk) => {
                    fk.columns.push(column);
                    fk.ref_columns.push(ref_column);
                }
                None => table.foreign_keys.push(ForeignKey {
                    name,
                    columns: vec![column],
                    ref_schema: get(&row, "REFERENCED_TABLE_SCHEMA")?,
                    ref_table: get(&row, "REFERENCED_TABLE_NAME")?,
                    ref_columns: vec![ref_column],
                    on_delete: get(&row, "DELETE_RULE")?,
                    on_update: get(&row, "UPDATE_RULE")?,
                }),
            }
        }

        debug!(
            "Loaded {} foreign keys for {}.{}",
            table.foreign_keys.len(),
            table.schema,
            table.name
        );
        Ok(())
    }
}

#[async_trait]
impl DialectAdapter for MysqlAdapter {
    fn dialect(&self) -> &DialectImpl {
        &self.dialect
    }

    fn default_schema(&self) -> &str {
        &self.default_schema
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MigrateError::connection(e, "testing MySQL connection"))?;
        Ok(())
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let rows: Vec<MySqlRow> = sqlx::query(
            "SELECT CAST(SCHEMA_NAME AS CHAR(255)) AS name FROM INFORMATION_SCHEMA.SCHEMATA ORDER BY SCHEMA_NAME",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| catalog_error(e, "listing MySQL databases"))?;
        rows.iter().map(|r| get(r, "name")).collect()
    }

    /// Schemas and databases are the same thing on MySQL; system schemas
    /// are left out.
    async fn list_schemas(&self) -> Result<Vec<String>> {
        Ok(self
            .list_databases()
            .await?
            .into_iter()
            .filter(|s| !SYSTEM_SCHEMAS.contains(&s.to_lowercase().as_str()))
            .collect())
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        let rows: Vec<MySqlRow> = sqlx::query(
            r#"
            SELECT CAST(TABLE_NAME AS CHAR(255)) AS TABLE_NAME
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
        "#,
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| catalog_error(e, "listing MySQL tables"))?;
        rows.iter().map(|r| get(r, "TABLE_NAME")).collect()
    }

    async fn describe_table(&self, schema: &str, table: &str) -> Result<Table> {
        if !self.table_exists(schema, table).await? {
            return Err(MigrateError::NotFound(format!("table {}.{}", schema, table)));
        }
        let mut t = Table::new(schema, table);
        self.load_columns(&mut t).await?;
        self.load_primary_key(&mut t).await?;
        self.load_indexes(&mut t).await?;
        self.load_foreign_keys(&mut t).await?;
        Ok(t)
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        let row: MySqlRow = sqlx::query(
            r#"
            SELECT CAST(COUNT(*) AS SIGNED) AS cnt
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
        "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| catalog_error(e, "checking MySQL table"))?;
        Ok(get::<i64>(&row, "cnt")? > 0)
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<i64> {
        let sql = self.dialect.row_count_sql(schema, table);
        let row: MySqlRow = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| read_error(format!("{}.{}", schema, table), e))?;
        row.try_get::<i64, _>(0)
            .map_err(|e| read_error(format!("{}.{}", schema, table), e))
    }

    fn stream_rows(&self, table: &Table, batch_size: usize) -> mpsc::Receiver<Result<Batch>> {
        let pool = self.pool.clone();
        let dialect = self.dialect.clone();
        let def = table.clone();
        spawn_paged_reader(table.clone(), batch_size, move |page| {
            let pool = pool.clone();
            let def = def.clone();
            let sql = dialect.page_query(&def, &page, batch_size);
            async move { fetch_rows(&pool, &def, &sql).await }
        })
    }

    async fn write_batch(&self, table: &Table, rows: Vec<Row>, within_tx: bool) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let row_count = rows.len() as u64;
        let per_stmt = self.dialect.rows_per_insert(table.columns.len());

        let mut guard = self.writer().await?;
        let result = match guard.as_mut() {
            Some(conn) => insert_rows(conn, &self.dialect, table, &rows, per_stmt, within_tx).await,
            None => {
                return Err(MigrateError::write(
                    table.full_name(),
                    "write connection unavailable",
                    true,
                ))
            }
        };
        match result {
            Ok(()) => {
                debug!("MySQL: wrote {} rows to {}", row_count, table.full_name());
                Ok(row_count)
            }
            Err(e) => {
                let transient = is_transient_write(&e);
                if transient {
                    *guard = None;
                }
                Err(MigrateError::write(table.full_name(), e.to_string(), transient))
            }
        }
    }

    async fn execute_ddl(&self, target: &str, sql: &str) -> Result<()> {
        self.run_on_writer(&[sql.to_string()])
            .await
            .map_err(|(msg, _)| MigrateError::ddl(target, msg))
    }

    async fn truncate_tables(&self, schema: &str, tables: &[String]) -> Result<()> {
        let mut statements = vec!["SET FOREIGN_KEY_CHECKS = 0".to_string()];
        statements.extend(
            tables
                .iter()
                .map(|t| format!("TRUNCATE TABLE {}", self.dialect.qualify(schema, t))),
        );
        let result = self.run_on_writer(&statements).await;
        // Restore checks even when a TRUNCATE failed.
        let restore = self
            .run_on_writer(&["SET FOREIGN_KEY_CHECKS = 1".to_string()])
            .await;
        result.map_err(|(msg, _)| MigrateError::ddl(schema, msg))?;
        restore.map_err(|(msg, _)| MigrateError::ddl(schema, msg))
    }

    /// MySQL only toggles checks per session, so `table` is ignored and the
    /// setting covers every later write on this handle.
    async fn set_constraint_enforcement(
        &self,
        schema: &str,
        table: &str,
        enabled: bool,
    ) -> Result<()> {
        let sql = format!("SET FOREIGN_KEY_CHECKS = {}", if enabled { 1 } else { 0 });
        self.run_on_writer(&[sql])
            .await
            .map_err(|(msg, _)| MigrateError::ddl(format!("{}.{}", schema, table), msg))
    }

    async fn sample_rows(&self, table: &Table, limit: usize) -> Result<Vec<Row>> {
        let sql = self.dialect.sample_sql(table, limit);
        self.fetch_rows(table, &sql).await
    }

    async fn close(&self) {
        if let Some(conn) = self.writer.lock().await.take() {
            let _ = conn.disconnect().await;
        }
        self.pool.close().await;
    }
}

async fn insert_rows(
    conn: &mut Conn,
    dialect: &DialectImpl,
    table: &Table,
    rows: &[Row],
    per_stmt: usize,
    within_tx: bool,
) -> std::result::Result<(), mysql_async::Error> {
    if within_tx {
        let mut tx = conn.start_transaction(TxOpts::default()).await?;
        for chunk in rows.chunks(per_stmt) {
            let sql = dialect.insert_sql(table, chunk.len());
            let params: Vec<mysql_async::Value> =
                chunk.iter().flat_map(|r| r.iter().map(to_mysql_value)).collect();
            tx.exec_drop(sql.as_str(), params).await?;
        }
        tx.commit().await
    } else {
        for chunk in rows.chunks(per_stmt) {
            let sql = dialect.insert_sql(table, chunk.len());
            let params: Vec<mysql_async::Value> =
                chunk.iter().flat_map(|r| r.iter().map(to_mysql_value)).collect();
            conn.exec_drop(sql.as_str(), params).await?;
        }
        Ok(())
    }
}

async fn fetch_rows(pool: &MySqlPool, table: &Table, sql: &str) -> Result<Vec<Row>> {
    let rows: Vec<MySqlRow> = sqlx::query(sql)
        .fetch_all(pool)
        .await
        .map_err(|e| read_error(table.full_name(), e))?;
    rows.iter()
        .map(|row| decode_row(row, &table.columns).map_err(|e| read_error(table.full_name(), e)))
        .collect()
}

fn decode_row(row: &MySqlRow, columns: &[Column]) -> std::result::Result<Row, sqlx::Error> {
    columns
        .iter()
        .enumerate()
        .map(|(i, col)| decode_value(row, i, col))
        .collect()
}

fn decode_value(row: &MySqlRow, i: usize, col: &Column) -> std::result::Result<SqlValue, sqlx::Error> {
    if row.try_get_raw(i)?.is_null() {
        return Ok(SqlValue::Null);
    }
    let native = col.data_type.to_lowercase();
    let unsigned = native.contains("unsigned");
    let base = native
        .split(|c: char| c.is_whitespace())
        .next()
        .unwrap_or_default();

    Ok(match base {
        "tinyint(1)" | "bool" | "boolean" => SqlValue::Bool(row.try_get::<bool, _>(i)?),
        "tinyint" if unsigned => SqlValue::I16(row.try_get::<u8, _>(i)? as i16),
        "tinyint" => SqlValue::I16(row.try_get::<i8, _>(i)? as i16),
        "smallint" if unsigned => SqlValue::I32(row.try_get::<u16, _>(i)? as i32),
        "smallint" => SqlValue::I16(row.try_get::<i16, _>(i)?),
        "mediumint" | "int" | "integer" if unsigned => SqlValue::I64(row.try_get::<u32, _>(i)? as i64),
        "mediumint" | "int" | "integer" => SqlValue::I32(row.try_get::<i32, _>(i)?),
        "bigint" if unsigned => SqlValue::Decimal(Decimal::from(row.try_get::<u64, _>(i)?)),
        "bigint" => SqlValue::I64(row.try_get::<i64, _>(i)?),
        "bit" => {
            let bytes = row.try_get_unchecked::<Vec<u8>, _>(i)?;
            let v = bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
            if col.canonical == CanonicalType::Boolean {
                SqlValue::Bool(v != 0)
            } else {
                SqlValue::I64(v as i64)
            }
        }
        "year" => SqlValue::I32(row.try_get_unchecked::<u16, _>(i)? as i32),
        "decimal" | "numeric" | "dec" | "fixed" => SqlValue::Decimal(row.try_get::<Decimal, _>(i)?),
        "float" => SqlValue::F32(row.try_get::<f32, _>(i)?),
        "double" | "real" => SqlValue::F64(row.try_get::<f64, _>(i)?),
        "date" => SqlValue::Date(row.try_get::<chrono::NaiveDate, _>(i)?),
        "time" => SqlValue::Time(row.try_get::<chrono::NaiveTime, _>(i)?),
        "datetime" => SqlValue::DateTime(row.try_get::<chrono::NaiveDateTime, _>(i)?),
        "timestamp" => SqlValue::DateTime(
            row.try_get::<chrono::DateTime<chrono::Utc>, _>(i)?
                .naive_utc(),
        ),
        "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" => {
            SqlValue::Bytes(row.try_get::<Vec<u8>, _>(i)?)
        }
        _ => SqlValue::Text(row.try_get_unchecked::<String, _>(i)?),
    })
}

/// Bind form of a value. Temporal values use the protocol's own date/time
/// encoding and decimals travel as strings, so no precision is lost.
fn to_mysql_value(value: &SqlValue) -> mysql_async::Value {
    use mysql_async::Value;
    match value {
        SqlValue::Null => Value::NULL,
        SqlValue::Bool(b) => Value::Int(*b as i64),
        SqlValue::I16(i) => Value::Int(*i as i64),
        SqlValue::I32(i) => Value::Int(*i as i64),
        SqlValue::I64(i) => Value::Int(*i),
        SqlValue::F32(f) => Value::Float(*f),
        SqlValue::F64(f) => Value::Double(*f),
        SqlValue::Text(s) => Value::Bytes(s.as_bytes().to_vec()),
        SqlValue::Bytes(b) => Value::Bytes(b.clone()),
        SqlValue::Uuid(u) => Value::Bytes(u.to_string().into_bytes()),
        SqlValue::Decimal(d) => Value::Bytes(d.to_string().into_bytes()),
        SqlValue::DateTime(dt) => datetime_value(dt),
        SqlValue::DateTimeOffset(dto) => datetime_value(&dto.naive_utc()),
        SqlValue::Date(d) => Value::Date(d.year() as u16, d.month() as u8, d.day() as u8, 0, 0, 0, 0),
        SqlValue::Time(t) => Value::Time(
            false,
            0,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
            t.nanosecond() / 1_000,
        ),
    }
}

fn datetime_value(dt: &chrono::NaiveDateTime) -> mysql_async::Value {
    mysql_async::Value::Date(
        dt.year() as u16,
        dt.month() as u8,
        dt.day() as u8,
        dt.hour() as u8,
        dt.minute() as u8,
        dt.second() as u8,
        dt.nanosecond() / 1_000,
    )
}

fn get<T>(row: &MySqlRow, column: &str) -> Result<T>
where
    T: for<'r> sqlx::Decode<'r, MySql> + sqlx::Type<MySql>,
{
    row.try_get(column)
        .map_err(|e| MigrateError::connection(e, format!("reading catalog column {}", column)))
}

fn is_transient_read(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
            .is_some_and(|e| TRANSIENT_SERVER_ERRORS.contains(&e.number())),
        _ => false,
    }
}

fn is_transient_write(e: &mysql_async::Error) -> bool {
    match e {
        mysql_async::Error::Io(_) => true,
        mysql_async::Error::Server(server) => TRANSIENT_SERVER_ERRORS.contains(&server.code),
        _ => false,
    }
}

fn read_error(table: String, e: sqlx::Error) -> MigrateError {
    let transient = is_transient_read(&e);
    MigrateError::read(table, e.to_string(), transient)
}

fn catalog_error(e: sqlx::Error, context: &str) -> MigrateError {
    if is_transient_read(&e) {
        MigrateError::connection(e, context)
    } else {
        MigrateError::read("information_schema", format!("{}: {}", context, e), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_temporal_binds() {
        let dt = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_micro_opt(8, 15, 30, 250)
            .unwrap();
        assert_eq!(
            to_mysql_value(&SqlValue::DateTime(dt)),
            mysql_async::Value::Date(2024, 3, 9, 8, 15, 30, 250)
        );
        assert_eq!(
            to_mysql_value(&SqlValue::Decimal(Decimal::new(12345, 2))),
            mysql_async::Value::Bytes(b"123.45".to_vec())
        );
        assert_eq!(to_mysql_value(&SqlValue::Null), mysql_async::Value::NULL);
    }

    #[test]
    fn test_server_error_classification() {
        assert!(TRANSIENT_SERVER_ERRORS.contains(&1213));
        assert!(!TRANSIENT_SERVER_ERRORS.contains(&1062));
    }

    #[test]
    fn test_pool_errors_are_transient() {
        assert!(is_transient_read(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient_read(&sqlx::Error::RowNotFound));
    }
}
