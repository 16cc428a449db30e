//! SQL Server adapter over Tiberius, pooled with bb8.

use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Query};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{DbType, Endpoint};
use crate::core::traits::{Dialect, DialectAdapter};
use crate::core::{Batch, Column, ForeignKey, Index, Row, SqlValue, Table};
use crate::dialect::ToCanonical;
use crate::drivers::common::{spawn_paged_reader, SslMode};
use crate::drivers::DialectImpl;

use super::MssqlDialect;
use crate::error::{MigrateError, Result};

/// Maximum TDS packet size.
const TDS_MAX_PACKET_SIZE: u32 = 32767;

/// TCP keepalive interval.
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Server error numbers worth retrying: deadlock victim, lock timeout and
/// the Azure SQL throttling/failover family.
const TRANSIENT_ERRORS: &[u32] = &[1205, 1222, 40197, 40501, 40613, 49918, 10928, 10929];

type TdsClient = Client<Compat<TcpStream>>;

/// bb8 connection manager for Tiberius clients.
#[derive(Clone)]
struct TiberiusManager {
    config: Config,
}

impl TiberiusManager {
    fn new(endpoint: &Endpoint) -> Result<Self> {
        let ssl_mode = SslMode::parse(&endpoint.ssl_mode)?;

        let mut config = Config::new();
        config.host(&endpoint.host);
        config.port(endpoint.port());
        config.database(&endpoint.database);
        config.authentication(AuthMethod::sql_server(&endpoint.user, &endpoint.password));

        match ssl_mode {
            SslMode::Disable => config.encryption(EncryptionLevel::NotSupported),
            // TDS default: encrypt the login packet only
            SslMode::Prefer => config.encryption(EncryptionLevel::Off),
            _ => config.encryption(EncryptionLevel::Required),
        }
        if endpoint.trust_server_cert || ssl_mode.accepts_invalid_certs() {
            config.trust_cert();
        }

        config.packet_size(TDS_MAX_PACKET_SIZE);
        Ok(Self { config })
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusManager {
    type Connection = TdsClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let io_err = |e: std::io::Error| tiberius::error::Error::Io {
            kind: e.kind(),
            message: e.to_string(),
        };
        let tcp = TcpStream::connect(self.config.get_addr())
            .await
            .map_err(io_err)?;
        tcp.set_nodelay(true).ok();

        let socket = socket2::SockRef::from(&tcp);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(TCP_KEEPALIVE_INTERVAL)
            .with_interval(TCP_KEEPALIVE_INTERVAL);
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            warn!("Failed to set TCP keepalive on SQL Server connection: {}", e);
        }

        Client::connect(self.config.clone(), tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// SQL Server connection handle.
pub struct MssqlAdapter {
    pool: Pool<TiberiusManager>,
    dialect: DialectImpl,
    default_schema: String,
}

impl MssqlAdapter {
    /// Build the pool and verify it with a round trip.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let manager = TiberiusManager::new(endpoint)?;
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(Duration::from_secs(endpoint.connect_timeout_secs.max(1)))
            .test_on_check_out(false)
            .build(manager)
            .await
            .map_err(|e| MigrateError::connection(e, "creating SQL Server pool"))?;

        let adapter = Self {
            pool,
            dialect: DialectImpl::for_db_type(DbType::Sqlserver),
            default_schema: endpoint.default_schema(),
        };
        adapter.ping().await?;
        info!("Connected to SQL Server: {}", endpoint.describe());
        Ok(adapter)
    }

    async fn client(&self) -> Result<PooledConnection<'_, TiberiusManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::connection(e, "getting SQL Server connection"))
    }

    /// Run a parameterized catalog query and return every row of the first result.
    async fn catalog_query(
        &self,
        sql: &str,
        params: &[&str],
        context: &str,
    ) -> Result<Vec<tiberius::Row>> {
        let mut client = self.client().await?;
        let mut query = Query::new(sql);
        for p in params {
            query.bind(p.to_string());
        }
        let stream = query
            .query(&mut client)
            .await
            .map_err(|e| catalog_error(e, context))?;
        stream
            .into_first_result()
            .await
            .map_err(|e| catalog_error(e, context))
    }

    async fn load_columns(&self, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT
                c.COLUMN_NAME,
                c.DATA_TYPE,
                CAST(ISNULL(c.CHARACTER_MAXIMUM_LENGTH, 0) AS INT),
                CAST(ISNULL(c.NUMERIC_PRECISION, ISNULL(c.DATETIME_PRECISION, 0)) AS INT),
                CAST(ISNULL(c.NUMERIC_SCALE, 0) AS INT),
                CAST(CASE WHEN c.IS_NULLABLE = 'YES' THEN 1 ELSE 0 END AS INT),
                CAST(ISNULL(COLUMNPROPERTY(OBJECT_ID(QUOTENAME(c.TABLE_SCHEMA) + '.' + QUOTENAME(c.TABLE_NAME)), c.COLUMN_NAME, 'IsIdentity'), 0) AS INT),
                c.COLUMN_DEFAULT,
                CAST(c.ORDINAL_POSITION AS INT)
            FROM INFORMATION_SCHEMA.COLUMNS c
            WHERE c.TABLE_SCHEMA = @P1 AND c.TABLE_NAME = @P2
            ORDER BY c.ORDINAL_POSITION
        "#;

        let rows = self
            .catalog_query(query, &[&table.schema, &table.name], "loading SQL Server columns")
            .await?;
        for row in rows {
            let data_type = text(&row, 1);
            let max_length = int(&row, 2);
            // datetime precision only matters for temporal columns
            let precision = int(&row, 3);
            let scale = int(&row, 4);
            let info = self
                .dialect
                .to_canonical(&data_type, max_length, precision, scale);
            table.columns.push(Column {
                name: text(&row, 0),
                data_type,
                canonical: info.canonical_type,
                canonical_warning: info.warning,
                max_length,
                precision,
                scale,
                is_nullable: int(&row, 5) == 1,
                is_primary_key: false,
                is_identity: int(&row, 6) == 1,
                default_expr: row
                    .try_get::<&str, _>(7)
                    .ok()
                    .flatten()
                    .map(String::from),
                ordinal_pos: int(&row, 8),
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
            SELECT c.COLUMN_NAME
            FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
            JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE c
                ON c.CONSTRAINT_NAME = tc.CONSTRAINT_NAME
                AND c.TABLE_SCHEMA = tc.TABLE_SCHEMA
                AND c.TABLE_NAME = tc.TABLE_NAME
            WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
              AND tc.TABLE_SCHEMA = @P1
              AND tc.TABLE_NAME = @P2
            ORDER BY c.ORDINAL_POSITION
        "#;

        let rows = self
            .catalog_query(query, &[&table.schema, &table.name], "loading SQL Server primary key")
            .await?;
        table.primary_key = rows.iter().map(|r| text(r, 0)).collect();
        table.sync_primary_key_flags();
        Ok(())
    }

    async fn load_indexes(&self, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT
                i.name AS index_name,
                CAST(i.is_unique AS INT),
                STUFF((
                    SELECT ',' + c2.name
                    FROM sys.index_columns ic2
                    JOIN sys.columns c2 ON ic2.object_id = c2.object_id AND ic2.column_id = c2.column_id
                    WHERE ic2.object_id = i.object_id AND ic2.index_id = i.index_id AND ic2.is_included_column = 0
                    ORDER BY ic2.key_ordinal
                    FOR XML PATH('')
                ), 1, 1, '') AS columns
            FROM sys.indexes i
            JOIN sys.tables tb ON i.object_id = tb.object_id
            JOIN sys.schemas s ON tb.schema_id = s.schema_id
            WHERE s.name = @P1
              AND tb.name = @P2
              AND i.is_primary_key = 0
              AND i.is_unique_constraint = 0
              AND i.type > 0
            ORDER BY i.name
        "#;

        let rows = self
            .catalog_query(query, &[&table.schema, &table.name], "loading SQL Server indexes")
            .await?;
        for row in rows {
            table.indexes.push(Index {
                name: text(&row, 0),
                is_unique: int(&row, 1) == 1,
                columns: split_list(&text(&row, 2)),
            });
        }
        Ok(())
    }

    async fn load_foreign_keys(&self, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT
                fk.name AS fk_name,
                STUFF((
                    SELECT ',' + pc2.name
                    FROM sys.foreign_key_columns fkc2
                    JOIN sys.columns pc2 ON fkc2.parent_object_id = pc2.object_id AND fkc2.parent_column_id = pc2.column_id
                    WHERE fkc2.constraint_object_id = fk.object_id
                    ORDER BY fkc2.constraint_column_id
                    FOR XML PATH('')
                ), 1, 1, '') AS parent_columns,
                rs.name AS ref_schema,
                rt.name AS ref_table,
                STUFF((
                    SELECT ',' + rc2.name
                    FROM sys.foreign_key_columns fkc2
                    JOIN sys.columns rc2 ON fkc2.referenced_object_id = rc2.object_id AND fkc2.referenced_column_id = rc2.column_id
                    WHERE fkc2.constraint_object_id = fk.object_id
                    ORDER BY fkc2.constraint_column_id
                    FOR XML PATH('')
                ), 1, 1, '') AS ref_columns,
                fk.delete_referential_action_desc,
                fk.update_referential_action_desc
            FROM sys.foreign_keys fk
            JOIN sys.tables pt ON fk.parent_object_id = pt.object_id
            JOIN sys.schemas ps ON pt.schema_id = ps.schema_id
            JOIN sys.tables rt ON fk.referenced_object_id = rt.object_id
            JOIN sys.schemas rs ON rt.schema_id = rs.schema_id
            WHERE ps.name = @P1 AND pt.name = @P2
            ORDER BY fk.name
        "#;

        let rows = self
            .catalog_query(query, &[&table.schema, &table.name], "loading SQL Server foreign keys")
            .await?;
        for row in rows {
            table.foreign_keys.push(ForeignKey {
                name: text(&row, 0),
                columns: split_list(&text(&row, 1)),
                ref_schema: text(&row, 2),
                ref_table: text(&row, 3),
                ref_columns: split_list(&text(&row, 4)),
                on_delete: text(&row, 5),
                on_update: text(&row, 6),
            });
        }
        Ok(())
    }

    async fn simple(&self, target: &str, sql: &str) -> Result<()> {
        let mut client = self.client().await?;
        client
            .execute(sql, &[])
            .await
            .map_err(|e| MigrateError::ddl(target, e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl DialectAdapter for MssqlAdapter {
    fn dialect(&self) -> &DialectImpl {
        &self.dialect
    }

    fn default_schema(&self) -> &str {
        &self.default_schema
    }

    async fn ping(&self) -> Result<()> {
        let mut client = self.client().await?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| MigrateError::connection(e, "testing SQL Server connection"))?
            .into_row()
            .await
            .map_err(|e| MigrateError::connection(e, "testing SQL Server connection"))?;
        Ok(())
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let rows = self
            .catalog_query(
                "SELECT name FROM sys.databases WHERE database_id > 4 ORDER BY name",
                &[],
                "listing SQL Server databases",
            )
            .await?;
        Ok(rows.iter().map(|r| text(r, 0)).collect())
    }

    async fn list_schemas(&self) -> Result<Vec<String>> {
        let rows = self
            .catalog_query(
                r#"
                SELECT name FROM sys.schemas
                WHERE name NOT IN ('sys', 'INFORMATION_SCHEMA', 'guest')
                  AND name NOT LIKE 'db[_]%'
                ORDER BY name
            "#,
                &[],
                "listing SQL Server schemas",
            )
            .await?;
        Ok(rows.iter().map(|r| text(r, 0)).collect())
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        let rows = self
            .catalog_query(
                r#"
                SELECT TABLE_NAME
                FROM INFORMATION_SCHEMA.TABLES
                WHERE TABLE_TYPE = 'BASE TABLE' AND TABLE_SCHEMA = @P1
                ORDER BY TABLE_NAME
            "#,
                &[schema],
                "listing SQL Server tables",
            )
            .await?;
        Ok(rows.iter().map(|r| text(r, 0)).collect())
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
                r#"
                SELECT 1
                FROM INFORMATION_SCHEMA.TABLES
                WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2
            "#,
                &[schema, table],
                "checking SQL Server table",
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<i64> {
        let name = format!("{}.{}", schema, table);
        let sql = format!("SELECT COUNT_BIG(*) FROM {}", self.dialect.qualify(schema, table));
        let mut client = self.client().await?;
        let row = client
            .simple_query(sql)
            .await
            .map_err(|e| read_error(&name, e))?
            .into_row()
            .await
            .map_err(|e| read_error(&name, e))?;
        Ok(row
            .and_then(|r| r.try_get::<i64, _>(0).ok().flatten())
            .unwrap_or(0))
    }

    fn stream_rows(&self, table: &Table, batch_size: usize) -> mpsc::Receiver<Result<Batch>> {
        let pool = self.pool.clone();
        let dialect = self.dialect.clone();
        let def = table.clone();
        spawn_paged_reader(table.clone(), batch_size, move |page| {
            let pool = pool.clone();
            let def = def.clone();
            let sql = dialect.page_query(&def, &page, batch_size);
            async move { fetch_rows(&pool, &def, sql).await }
        })
    }

    async fn write_batch(&self, table: &Table, rows: Vec<Row>, within_tx: bool) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let name = table.full_name();
        let qualified = self.dialect.qualify(&table.schema, &table.name);
        let identity = table.columns.iter().any(|c| c.is_identity);
        let per_stmt = self.dialect.rows_per_insert(table.columns.len());

        let mut client = self.client().await?;
        let prelude = MssqlDialect::new().write_prelude(&qualified, within_tx, identity);
        client
            .simple_query(prelude)
            .await
            .map_err(|e| write_error(&name, e))?
            .into_results()
            .await
            .map_err(|e| write_error(&name, e))?;

        let mut written = 0u64;
        let mut failure = None;
        for chunk in rows.chunks(per_stmt) {
            let sql = self.dialect.insert_sql(table, chunk.len());
            let mut query = Query::new(sql);
            for row in chunk {
                for (col, value) in table.columns.iter().zip(row) {
                    bind_value(&mut query, col, value);
                }
            }
            match query.execute(&mut client).await {
                Ok(result) => written += result.total(),
                Err(e) => {
                    failure = Some(write_error(&name, e));
                    break;
                }
            }
        }

        let mut epilogue = String::new();
        if identity {
            epilogue.push_str(&format!("SET IDENTITY_INSERT {} OFF; ", qualified));
        }
        if within_tx {
            epilogue.push_str(if failure.is_some() {
                "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION;"
            } else {
                "COMMIT TRANSACTION;"
            });
        }
        if !epilogue.is_empty() {
            let finished = match client.simple_query(epilogue).await {
                Ok(stream) => stream.into_results().await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = finished {
                // a failed rollback is secondary to the insert error
                match &failure {
                    Some(_) => warn!("{}: rollback failed: {}", name, e),
                    None => return Err(write_error(&name, e)),
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => {
                debug!("SQL Server: wrote {} rows to {}", written, name);
                Ok(written)
            }
        }
    }

    async fn execute_ddl(&self, target: &str, sql: &str) -> Result<()> {
        self.simple(target, sql).await
    }

    /// No IF NOT EXISTS for CREATE TABLE, so check the catalog first.
    async fn create_table(&self, table: &Table, schema: &str, inline_fks: bool) -> Result<()> {
        if self.table_exists(schema, &table.name).await? {
            debug!("{}.{} already exists", schema, table.name);
            return Ok(());
        }
        let sql = self.dialect.create_table_sql(table, schema, inline_fks);
        self.execute_ddl(&format!("{}.{}", schema, table.name), &sql)
            .await
    }

    /// TRUNCATE refuses referenced tables even with checks off, so rows are
    /// deleted child-first.
    async fn truncate_tables(&self, schema: &str, tables: &[String]) -> Result<()> {
        for t in tables {
            let sql = format!("DELETE FROM {}", self.dialect.qualify(schema, t));
            self.simple(&format!("{}.{}", schema, t), &sql).await?;
        }
        Ok(())
    }

    async fn set_constraint_enforcement(
        &self,
        schema: &str,
        table: &str,
        enabled: bool,
    ) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {} {} CONSTRAINT ALL",
            self.dialect.qualify(schema, table),
            if enabled { "WITH CHECK CHECK" } else { "NOCHECK" }
        );
        self.simple(&format!("{}.{}", schema, table), &sql).await
    }

    async fn sample_rows(&self, table: &Table, limit: usize) -> Result<Vec<Row>> {
        fetch_rows(&self.pool, table, self.dialect.sample_sql(table, limit)).await
    }

    async fn close(&self) {
        // bb8 closes idle connections when the last pool handle drops
    }
}

async fn fetch_rows(pool: &Pool<TiberiusManager>, table: &Table, sql: String) -> Result<Vec<Row>> {
    let name = table.full_name();
    let mut client = pool
        .get()
        .await
        .map_err(|e| MigrateError::read(&name, e.to_string(), true))?;
    let rows = client
        .simple_query(sql)
        .await
        .map_err(|e| read_error(&name, e))?
        .into_first_result()
        .await
        .map_err(|e| read_error(&name, e))?;

    rows.iter()
        .map(|row| {
            table
                .columns
                .iter()
                .enumerate()
                .map(|(i, col)| decode_value(row, i, col))
                .collect::<std::result::Result<Row, _>>()
                .map_err(|e| read_error(&name, e))
        })
        .collect()
}

fn decode_value(
    row: &tiberius::Row,
    idx: usize,
    col: &Column,
) -> std::result::Result<SqlValue, tiberius::error::Error> {
    fn opt<T>(v: Option<T>, f: impl FnOnce(T) -> SqlValue) -> SqlValue {
        v.map(f).unwrap_or(SqlValue::Null)
    }

    let dt = col.data_type.to_lowercase();
    Ok(match dt.as_str() {
        "bit" => opt(row.try_get::<bool, _>(idx)?, SqlValue::Bool),
        "tinyint" => opt(row.try_get::<u8, _>(idx)?, |v| SqlValue::I16(v as i16)),
        "smallint" => opt(row.try_get::<i16, _>(idx)?, SqlValue::I16),
        "int" => opt(row.try_get::<i32, _>(idx)?, SqlValue::I32),
        "bigint" => opt(row.try_get::<i64, _>(idx)?, SqlValue::I64),
        "real" => opt(row.try_get::<f32, _>(idx)?, SqlValue::F32),
        "float" => opt(row.try_get::<f64, _>(idx)?, SqlValue::F64),
        "decimal" | "numeric" => opt(row.try_get::<Decimal, _>(idx)?, SqlValue::Decimal),
        // money arrives as a float on the wire
        "money" | "smallmoney" => match row.try_get::<Decimal, _>(idx) {
            Ok(v) => opt(v, SqlValue::Decimal),
            Err(_) => opt(row.try_get::<f64, _>(idx)?, |f| {
                Decimal::try_from(f)
                    .map(|d| SqlValue::Decimal(d.round_dp(4)))
                    .unwrap_or(SqlValue::F64(f))
            }),
        },
        "uniqueidentifier" => opt(row.try_get::<Uuid, _>(idx)?, SqlValue::Uuid),
        "date" => opt(row.try_get::<NaiveDate, _>(idx)?, SqlValue::Date),
        "time" => opt(row.try_get::<NaiveTime, _>(idx)?, SqlValue::Time),
        "datetime" | "datetime2" | "smalldatetime" => {
            opt(row.try_get::<NaiveDateTime, _>(idx)?, SqlValue::DateTime)
        }
        "datetimeoffset" => opt(
            row.try_get::<DateTime<FixedOffset>, _>(idx)?,
            SqlValue::DateTimeOffset,
        ),
        "binary" | "varbinary" | "image" | "rowversion" | "timestamp" => {
            opt(row.try_get::<&[u8], _>(idx)?, |v| SqlValue::Bytes(v.to_vec()))
        }
        _ => opt(row.try_get::<&str, _>(idx)?, |s| SqlValue::Text(s.to_string())),
    })
}

/// Bind one value. NULLs take the column's family so SQL Server can convert
/// them implicitly (nvarchar NULL does not convert to varbinary).
fn bind_value(query: &mut Query<'_>, col: &Column, value: &SqlValue) {
    match value {
        SqlValue::Null => {
            if is_binary_type(&col.data_type) {
                query.bind(Option::<Vec<u8>>::None);
            } else {
                query.bind(Option::<String>::None);
            }
        }
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::I16(v) => query.bind(*v),
        SqlValue::I32(v) => query.bind(*v),
        SqlValue::I64(v) => query.bind(*v),
        SqlValue::F32(v) => query.bind(*v),
        SqlValue::F64(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.clone()),
        SqlValue::Bytes(v) => query.bind(v.clone()),
        SqlValue::Uuid(v) => query.bind(*v),
        SqlValue::Decimal(v) => query.bind(tiberius::numeric::Numeric::new_with_scale(v.mantissa(), v.scale() as u8)),
        SqlValue::DateTime(v) => query.bind(*v),
        SqlValue::DateTimeOffset(v) => query.bind(*v),
        SqlValue::Date(v) => query.bind(*v),
        SqlValue::Time(v) => query.bind(*v),
    }
}

fn is_binary_type(data_type: &str) -> bool {
    let lower = data_type.to_lowercase();
    lower.starts_with("varbinary") || lower.starts_with("binary") || lower == "image"
}

fn text(row: &tiberius::Row, idx: usize) -> String {
    row.try_get::<&str, _>(idx)
        .ok()
        .flatten()
        .unwrap_or_default()
        .to_string()
}

fn int(row: &tiberius::Row, idx: usize) -> i32 {
    row.try_get::<i32, _>(idx).ok().flatten().unwrap_or(0)
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn is_transient(e: &tiberius::error::Error) -> bool {
    match e {
        tiberius::error::Error::Io { .. } => true,
        tiberius::error::Error::Server(token) => TRANSIENT_ERRORS.contains(&token.code()),
        _ => false,
    }
}

fn read_error(table: &str, e: tiberius::error::Error) -> MigrateError {
    MigrateError::read(table, e.to_string(), is_transient(&e))
}

fn write_error(table: &str, e: tiberius::error::Error) -> MigrateError {
    MigrateError::write(table, e.to_string(), is_transient(&e))
}

fn catalog_error(e: tiberius::error::Error, context: &str) -> MigrateError {
    if is_transient(&e) {
        MigrateError::connection(e, context)
    } else {
        MigrateError::read("INFORMATION_SCHEMA", format!("{}: {}", context, e), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::CanonicalType;

    #[test]
    fn test_io_errors_are_transient() {
        let e = tiberius::error::Error::Io {
            kind: std::io::ErrorKind::ConnectionReset,
            message: "reset".into(),
        };
        assert!(is_transient(&e));
        assert!(!is_transient(&tiberius::error::Error::Protocol("bad token".into())));
    }

    #[test]
    fn test_binary_null_family() {
        assert!(is_binary_type("varbinary"));
        assert!(is_binary_type("VARBINARY(MAX)"));
        assert!(is_binary_type("image"));
        assert!(!is_binary_type("nvarchar"));
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("a,b"), vec!["a", "b"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_manager_rejects_bad_ssl_mode() {
        let mut ep = Endpoint::new(DbType::Sqlserver, "localhost");
        ep.ssl_mode = "sometimes".into();
        assert!(TiberiusManager::new(&ep).is_err());
        ep.ssl_mode = "disable".into();
        assert!(TiberiusManager::new(&ep).is_ok());
    }

    #[test]
    fn test_insert_sql_for_binding() {
        let dialect = DialectImpl::for_db_type(DbType::Sqlserver);
        let mut t = Table::new("dbo", "blobs");
        t.columns.push(Column::new("id", "int", CanonicalType::Integer));
        t.columns.push(Column::new("data", "varbinary", CanonicalType::Binary));
        assert_eq!(
            dialect.insert_sql(&t, 2),
            "INSERT INTO [dbo].[blobs] ([id], [data]) VALUES (@P1, @P2), (@P3, @P4)"
        );
    }
}
