//! Oracle adapter (ODPI-C through the `oracle` crate).
//!
//! The driver is synchronous, so every call runs on the blocking pool with a
//! shared handle to the single session.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use oracle::sql_type::ToSql;
use oracle::Connection;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{DbType, Endpoint};
use crate::core::traits::{Dialect, DialectAdapter};
use crate::core::{Batch, Column, ForeignKey, Index, Row, SqlValue, Table};
use crate::dialect::{CanonicalType, ToCanonical};
use crate::drivers::common::spawn_paged_reader;
use crate::drivers::DialectImpl;
use crate::error::{MigrateError, Result};

/// Message fragments of retryable failures: deadlock, lost session, and
/// listener/network timeouts.
const TRANSIENT_CODES: &[&str] = &[
    "ORA-00060",
    "ORA-03113",
    "ORA-03114",
    "ORA-12170",
    "ORA-12537",
    "ORA-12541",
    "DPI-1080",
];

/// Oracle connection handle.
pub struct OracleAdapter {
    conn: Arc<Connection>,
    dialect: DialectImpl,
    default_schema: String,
}

impl OracleAdapter {
    /// Open one session to `//host:port/service`.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let service = endpoint
            .service_name
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| endpoint.database.clone());
        let connect_string = format!("//{}:{}/{}", endpoint.host, endpoint.port(), service);
        let user = endpoint.user.clone();
        let password = endpoint.password.clone();

        let conn = tokio::task::spawn_blocking(move || {
            Connection::connect(&user, &password, &connect_string)
        })
        .await
        .map_err(|e| MigrateError::Internal(format!("oracle connect task failed: {}", e)))?
        .map_err(|e| MigrateError::connection(e, "connecting to Oracle"))?;

        info!("Connected to Oracle: {}", endpoint.describe());
        Ok(Self {
            conn: Arc::new(conn),
            dialect: DialectImpl::for_db_type(DbType::Oracle),
            default_schema: endpoint.default_schema(),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        run_blocking(Arc::clone(&self.conn), f).await
    }

    /// Rows of a catalog query with string binds, each column read as text.
    async fn catalog_query(
        &self,
        sql: &'static str,
        params: Vec<String>,
        ncols: usize,
        context: &'static str,
    ) -> Result<Vec<Vec<Option<String>>>> {
        self.blocking(move |conn| {
            let binds: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
            let rows = conn
                .query(sql, &binds)
                .map_err(|e| catalog_error(e, context))?;
            let mut out = Vec::new();
            for row in rows {
                let row = row.map_err(|e| catalog_error(e, context))?;
                let mut values = Vec::with_capacity(ncols);
                for i in 0..ncols {
                    values.push(
                        row.get::<usize, Option<String>>(i)
                            .map_err(|e| catalog_error(e, context))?,
                    );
                }
                out.push(values);
            }
            Ok(out)
        })
        .await
    }

    async fn load_columns(&self, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT
                COLUMN_NAME,
                DATA_TYPE,
                TO_CHAR(CASE WHEN DATA_TYPE IN ('CHAR', 'NCHAR', 'VARCHAR2', 'NVARCHAR2')
                             THEN CHAR_LENGTH ELSE DATA_LENGTH END),
                TO_CHAR(NVL(DATA_PRECISION, 0)),
                TO_CHAR(NVL(DATA_SCALE, -127)),
                NULLABLE,
                IDENTITY_COLUMN,
                TO_CHAR(COLUMN_ID)
            FROM ALL_TAB_COLUMNS
            WHERE OWNER = :1 AND TABLE_NAME = :2
            ORDER BY COLUMN_ID
        "#;

        let rows = self
            .catalog_query(
                query,
                vec![table.schema.clone(), table.name.clone()],
                8,
                "loading Oracle columns",
            )
            .await?;
        for row in rows {
            let num = |i: usize| -> i32 {
                row[i]
                    .as_deref()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0)
            };
            let data_type = row[1].clone().unwrap_or_default();
            let (max_length, precision, scale) = (num(2), num(3), num(4));
            let info = self
                .dialect
                .to_canonical(&data_type, max_length, precision, scale);
            table.columns.push(Column {
                name: row[0].clone().unwrap_or_default(),
                data_type,
                canonical: info.canonical_type,
                canonical_warning: info.warning,
                max_length,
                precision,
                scale,
                is_nullable: row[5].as_deref() == Some("Y"),
                is_primary_key: false,
                is_identity: row[6].as_deref() == Some("YES"),
                // DATA_DEFAULT is a LONG and rarely portable
                default_expr: None,
                ordinal_pos: num(7),
            });
        }

        debug!(
            "Loaded {} columns for {}",
            table.columns.len(),
            table.full_name()
        );
        Ok(())
    }

    async fn load_primary_key(&self, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT cc.COLUMN_NAME
            FROM ALL_CONSTRAINTS c
            JOIN ALL_CONS_COLUMNS cc
              ON cc.OWNER = c.OWNER AND cc.CONSTRAINT_NAME = c.CONSTRAINT_NAME
            WHERE c.OWNER = :1 AND c.TABLE_NAME = :2 AND c.CONSTRAINT_TYPE = 'P'
            ORDER BY cc.POSITION
        "#;
        let rows = self
            .catalog_query(
                query,
                vec![table.schema.clone(), table.name.clone()],
                1,
                "loading Oracle primary key",
            )
            .await?;
        table.primary_key = rows.into_iter().filter_map(|mut r| r.remove(0)).collect();
        table.sync_primary_key_flags();
        Ok(())
    }

    async fn load_indexes(&self, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT
                i.INDEX_NAME,
                i.UNIQUENESS,
                LISTAGG(ic.COLUMN_NAME, ',') WITHIN GROUP (ORDER BY ic.COLUMN_POSITION)
            FROM ALL_INDEXES i
            JOIN ALL_IND_COLUMNS ic
              ON ic.INDEX_OWNER = i.OWNER AND ic.INDEX_NAME = i.INDEX_NAME
            WHERE i.TABLE_OWNER = :1
              AND i.TABLE_NAME = :2
              AND i.INDEX_TYPE = 'NORMAL'
              AND NOT EXISTS (
                  SELECT 1 FROM ALL_CONSTRAINTS c
                  WHERE c.OWNER = i.TABLE_OWNER
                    AND c.INDEX_NAME = i.INDEX_NAME
                    AND c.CONSTRAINT_TYPE = 'P'
              )
            GROUP BY i.INDEX_NAME, i.UNIQUENESS
            ORDER BY i.INDEX_NAME
        "#;
        let rows = self
            .catalog_query(
                query,
                vec![table.schema.clone(), table.name.clone()],
                3,
                "loading Oracle indexes",
            )
            .await?;
        for row in rows {
            table.indexes.push(Index {
                name: row[0].clone().unwrap_or_default(),
                is_unique: row[1].as_deref() == Some("UNIQUE"),
                columns: split_list(row[2].as_deref().unwrap_or_default()),
            });
        }
        Ok(())
    }

    async fn load_foreign_keys(&self, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT
                c.CONSTRAINT_NAME,
                LISTAGG(cc.COLUMN_NAME, ',') WITHIN GROUP (ORDER BY cc.POSITION),
                r.OWNER,
                r.TABLE_NAME,
                LISTAGG(rc.COLUMN_NAME, ',') WITHIN GROUP (ORDER BY cc.POSITION),
                c.DELETE_RULE
            FROM ALL_CONSTRAINTS c
            JOIN ALL_CONS_COLUMNS cc
              ON cc.OWNER = c.OWNER AND cc.CONSTRAINT_NAME = c.CONSTRAINT_NAME
            JOIN ALL_CONSTRAINTS r
              ON r.OWNER = c.R_OWNER AND r.CONSTRAINT_NAME = c.R_CONSTRAINT_NAME
            JOIN ALL_CONS_COLUMNS rc
              ON rc.OWNER = r.OWNER AND rc.CONSTRAINT_NAME = r.CONSTRAINT_NAME
             AND rc.POSITION = cc.POSITION
            WHERE c.OWNER = :1 AND c.TABLE_NAME = :2 AND c.CONSTRAINT_TYPE = 'R'
            GROUP BY c.CONSTRAINT_NAME, r.OWNER, r.TABLE_NAME, c.DELETE_RULE
            ORDER BY c.CONSTRAINT_NAME
        "#;
        let rows = self
            .catalog_query(
                query,
                vec![table.schema.clone(), table.name.clone()],
                6,
                "loading Oracle foreign keys",
            )
            .await?;
        for row in rows {
            table.foreign_keys.push(ForeignKey {
                name: row[0].clone().unwrap_or_default(),
                columns: split_list(row[1].as_deref().unwrap_or_default()),
                ref_schema: row[2].clone().unwrap_or_default(),
                ref_table: row[3].clone().unwrap_or_default(),
                ref_columns: split_list(row[4].as_deref().unwrap_or_default()),
                on_delete: row[5].clone().unwrap_or_else(|| "NO ACTION".into()),
                // Oracle has no ON UPDATE rule
                on_update: "NO ACTION".into(),
            });
        }
        Ok(())
    }

    async fn simple(&self, target: &str, sql: &str) -> Result<()> {
        let target = target.to_string();
        let sql = sql.to_string();
        self.blocking(move |conn| {
            conn.execute(&sql, &[])
                .map_err(|e| MigrateError::ddl(&target, e.to_string()))?;
            Ok(())
        })
        .await
    }
}

async fn run_blocking<T, F>(conn: Arc<Connection>, f: F) -> Result<T>
where
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&conn))
        .await
        .map_err(|e| MigrateError::Internal(format!("oracle task failed: {}", e)))?
}

#[async_trait]
impl DialectAdapter for OracleAdapter {
    fn dialect(&self) -> &DialectImpl {
        &self.dialect
    }

    fn default_schema(&self) -> &str {
        &self.default_schema
    }

    async fn ping(&self) -> Result<()> {
        self.blocking(|conn| {
            conn.ping()
                .map_err(|e| MigrateError::connection(e, "testing Oracle connection"))
        })
        .await
    }

    /// Oracle users play the role of databases.
    async fn list_databases(&self) -> Result<Vec<String>> {
        let rows = self
            .catalog_query(
                "SELECT USERNAME FROM ALL_USERS ORDER BY USERNAME",
                Vec::new(),
                1,
                "listing Oracle users",
            )
            .await?;
        Ok(rows.into_iter().filter_map(|mut r| r.remove(0)).collect())
    }

    async fn list_schemas(&self) -> Result<Vec<String>> {
        let rows = self
            .catalog_query(
                "SELECT USERNAME FROM ALL_USERS WHERE ORACLE_MAINTAINED = 'N' ORDER BY USERNAME",
                Vec::new(),
                1,
                "listing Oracle schemas",
            )
            .await?;
        Ok(rows.into_iter().filter_map(|mut r| r.remove(0)).collect())
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        let rows = self
            .catalog_query(
                r#"
                SELECT TABLE_NAME FROM ALL_TABLES
                WHERE OWNER = :1 AND NESTED = 'NO' AND SECONDARY = 'N'
                ORDER BY TABLE_NAME
            "#,
                vec![schema.to_string()],
                1,
                "listing Oracle tables",
            )
            .await?;
        Ok(rows.into_iter().filter_map(|mut r| r.remove(0)).collect())
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
        let rows = self
            .catalog_query(
                "SELECT 1 FROM ALL_TABLES WHERE OWNER = :1 AND TABLE_NAME = :2",
                vec![schema.to_string(), table.to_string()],
                1,
                "checking Oracle table",
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<i64> {
        let name = format!("{}.{}", schema, table);
        let sql = self.dialect.row_count_sql(schema, table);
        self.blocking(move |conn| {
            let row = conn
                .query_row(&sql, &[])
                .map_err(|e| read_error(&name, e))?;
            row.get::<usize, i64>(0).map_err(|e| read_error(&name, e))
        })
        .await
    }

    fn stream_rows(&self, table: &Table, batch_size: usize) -> mpsc::Receiver<Result<Batch>> {
        let conn = Arc::clone(&self.conn);
        let dialect = self.dialect.clone();
        let def = table.clone();
        spawn_paged_reader(table.clone(), batch_size, move |page| {
            let conn = Arc::clone(&conn);
            let def = def.clone();
            let sql = dialect.page_query(&def, &page, batch_size);
            async move { run_blocking(conn, move |c| fetch_rows(c, &def, &sql)).await }
        })
    }

    /// Rows are inserted one execution at a time through a reused statement.
    /// Without `within_tx`, rows that made it in before a failure are kept.
    async fn write_batch(&self, table: &Table, rows: Vec<Row>, within_tx: bool) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let name = table.full_name();
        let sql = self.dialect.insert_sql(table, 1);
        let columns = table.columns.clone();

        self.blocking(move |conn| {
            let mut stmt = conn
                .statement(&sql)
                .build()
                .map_err(|e| write_error(&name, e))?;

            let mut written = 0u64;
            for row in &rows {
                let binds: Vec<Box<dyn ToSql>> = columns
                    .iter()
                    .zip(row)
                    .map(|(col, value)| bind_value(col, value))
                    .collect();
                let refs: Vec<&dyn ToSql> = binds.iter().map(|b| b.as_ref()).collect();
                if let Err(e) = stmt.execute(&refs) {
                    let err = write_error(&name, e);
                    let settle = if within_tx {
                        conn.rollback()
                    } else {
                        conn.commit()
                    };
                    if let Err(e) = settle {
                        warn!("{}: ending transaction after failure: {}", name, e);
                    }
                    return Err(err);
                }
                written += 1;
            }
            conn.commit().map_err(|e| write_error(&name, e))?;
            debug!("Oracle: wrote {} rows to {}", written, name);
            Ok(written)
        })
        .await
    }

    async fn execute_ddl(&self, target: &str, sql: &str) -> Result<()> {
        self.simple(target, sql).await
    }

    async fn create_table(&self, table: &Table, schema: &str, inline_fks: bool) -> Result<()> {
        if self.table_exists(schema, &table.name).await? {
            debug!("{}.{} already exists", schema, table.name);
            return Ok(());
        }
        let sql = self.dialect.create_table_sql(table, schema, inline_fks);
        self.execute_ddl(&format!("{}.{}", schema, table.name), &sql)
            .await
    }

    async fn truncate_tables(&self, schema: &str, tables: &[String]) -> Result<()> {
        for t in tables {
            let sql = format!("DELETE FROM {}", self.dialect.qualify(schema, t));
            self.simple(&format!("{}.{}", schema, t), &sql).await?;
        }
        self.blocking(|conn| {
            conn.commit()
                .map_err(|e| MigrateError::ddl("truncate", e.to_string()))
        })
        .await
    }

    async fn set_constraint_enforcement(
        &self,
        schema: &str,
        table: &str,
        enabled: bool,
    ) -> Result<()> {
        let names = self
            .catalog_query(
                r#"
                SELECT CONSTRAINT_NAME FROM ALL_CONSTRAINTS
                WHERE OWNER = :1 AND TABLE_NAME = :2 AND CONSTRAINT_TYPE = 'R'
            "#,
                vec![schema.to_string(), table.to_string()],
                1,
                "listing Oracle constraints",
            )
            .await?;
        let target = format!("{}.{}", schema, table);
        for name in names.into_iter().filter_map(|mut r| r.remove(0)) {
            let sql = format!(
                "ALTER TABLE {} {} CONSTRAINT {}",
                self.dialect.qualify(schema, table),
                if enabled { "ENABLE" } else { "DISABLE" },
                self.dialect.quote_ident(&name)
            );
            self.simple(&target, &sql).await?;
        }
        Ok(())
    }

    async fn sample_rows(&self, table: &Table, limit: usize) -> Result<Vec<Row>> {
        let sql = self.dialect.sample_sql(table, limit);
        let def = table.clone();
        self.blocking(move |conn| fetch_rows(conn, &def, &sql)).await
    }

    async fn close(&self) {
        let closed = self
            .blocking(|conn| {
                conn.close()
                    .map_err(|e| MigrateError::connection(e, "closing Oracle session"))
            })
            .await;
        if let Err(e) = closed {
            debug!("{}", e);
        }
    }
}

fn fetch_rows(conn: &Connection, table: &Table, sql: &str) -> Result<Vec<Row>> {
    let name = table.full_name();
    let rows = conn.query(sql, &[]).map_err(|e| read_error(&name, e))?;
    let mut out = Vec::new();
    for row in rows {
        let row = row.map_err(|e| read_error(&name, e))?;
        let mut values = Vec::with_capacity(table.columns.len());
        for (i, col) in table.columns.iter().enumerate() {
            values.push(decode_value(&row, i, col).map_err(|e| read_error(&name, e))?);
        }
        out.push(values);
    }
    Ok(out)
}

/// Decode by canonical type: Oracle's NUMBER alone covers booleans,
/// integers and decimals.
fn decode_value(
    row: &oracle::Row,
    i: usize,
    col: &Column,
) -> std::result::Result<SqlValue, oracle::Error> {
    fn opt<T>(v: Option<T>, f: impl FnOnce(T) -> SqlValue) -> SqlValue {
        v.map(f).unwrap_or(SqlValue::Null)
    }

    Ok(match &col.canonical {
        CanonicalType::Boolean => opt(row.get::<usize, Option<i64>>(i)?, |v| SqlValue::Bool(v != 0)),
        CanonicalType::Integer | CanonicalType::BigInteger => {
            opt(row.get::<usize, Option<i64>>(i)?, SqlValue::I64)
        }
        CanonicalType::Decimal { .. } => opt(row.get::<usize, Option<String>>(i)?, |s| {
            parse_number(&s).map(SqlValue::Decimal).unwrap_or(SqlValue::Text(s))
        }),
        CanonicalType::Float => opt(row.get::<usize, Option<f64>>(i)?, SqlValue::F64),
        CanonicalType::Binary => opt(row.get::<usize, Option<Vec<u8>>>(i)?, SqlValue::Bytes),
        CanonicalType::Date | CanonicalType::Timestamp => {
            opt(row.get::<usize, Option<NaiveDateTime>>(i)?, SqlValue::DateTime)
        }
        CanonicalType::TimestampTz => opt(
            row.get::<usize, Option<DateTime<FixedOffset>>>(i)?,
            SqlValue::DateTimeOffset,
        ),
        _ => opt(row.get::<usize, Option<String>>(i)?, SqlValue::Text),
    })
}

/// Oracle renders small fractions as `.5` and large values in scientific form.
fn parse_number(s: &str) -> Option<Decimal> {
    let trimmed = s.trim();
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .ok()
}

fn bind_value(col: &Column, value: &SqlValue) -> Box<dyn ToSql> {
    match value {
        SqlValue::Null => match col.canonical {
            CanonicalType::Binary => Box::new(Option::<Vec<u8>>::None),
            _ => Box::new(Option::<String>::None),
        },
        SqlValue::Bool(v) => Box::new(*v as i64),
        SqlValue::I16(v) => Box::new(*v as i64),
        SqlValue::I32(v) => Box::new(*v as i64),
        SqlValue::I64(v) => Box::new(*v),
        SqlValue::F32(v) => Box::new(*v as f64),
        SqlValue::F64(v) => Box::new(*v),
        SqlValue::Text(v) => Box::new(v.clone()),
        SqlValue::Bytes(v) => Box::new(v.clone()),
        SqlValue::Uuid(v) => Box::new(v.to_string()),
        // text keeps full precision; NUMBER parses it on insert
        SqlValue::Decimal(v) => Box::new(v.to_string()),
        SqlValue::DateTime(v) => Box::new(*v),
        SqlValue::DateTimeOffset(v) => Box::new(*v),
        SqlValue::Date(v) => Box::new(v.and_time(chrono::NaiveTime::MIN)),
        SqlValue::Time(v) => Box::new(v.format("%H:%M:%S%.f").to_string()),
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn is_transient_message(message: &str) -> bool {
    TRANSIENT_CODES.iter().any(|code| message.contains(code))
}

fn read_error(table: &str, e: oracle::Error) -> MigrateError {
    let message = e.to_string();
    let transient = is_transient_message(&message);
    MigrateError::read(table, message, transient)
}

fn write_error(table: &str, e: oracle::Error) -> MigrateError {
    let message = e.to_string();
    let transient = is_transient_message(&message);
    MigrateError::write(table, message, transient)
}

fn catalog_error(e: oracle::Error, context: &str) -> MigrateError {
    let message = e.to_string();
    if is_transient_message(&message) {
        MigrateError::connection(message, context)
    } else {
        MigrateError::read("ALL_TABLES", format!("{}: {}", context, message), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_codes() {
        assert!(is_transient_message("ORA-00060: deadlock detected while waiting for resource"));
        assert!(is_transient_message("ORA-03113: end-of-file on communication channel"));
        assert!(!is_transient_message("ORA-00001: unique constraint (APP.PK_ORDERS) violated"));
    }

    #[test]
    fn test_parse_number_forms() {
        assert_eq!(parse_number(".5"), Decimal::from_str("0.5").ok());
        assert_eq!(parse_number("-12.34"), Decimal::from_str("-12.34").ok());
        assert_eq!(parse_number("1E+3"), Some(Decimal::from(1000)));
        assert_eq!(parse_number("abc"), None);
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("ID,NAME"), vec!["ID", "NAME"]);
    }
}
