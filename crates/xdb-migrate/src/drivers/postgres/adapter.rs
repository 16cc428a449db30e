//! PostgreSQL adapter.
//!
//! One deadpool-managed tokio-postgres connection per handle. Reads use the
//! extended protocol (binary results); writes stream binary COPY, encoding
//! each field for the destination column's actual type.

use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::SinkExt;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::CopyInSink;
use tokio_postgres::Config as PgConfig;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{DbType, Endpoint};
use crate::core::traits::{Dialect, DialectAdapter};
use crate::core::{Batch, Column, ForeignKey, Index, Row, SqlValue, Table};
use crate::dialect::ToCanonical;
use crate::drivers::common::{spawn_paged_reader, SslMode, TlsBuilder};
use crate::drivers::DialectImpl;
use crate::error::{MigrateError, Result};

/// Microseconds between 1970-01-01 and 2000-01-01, the PostgreSQL epoch.
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// `NaiveDate::num_days_from_ce` of 2000-01-01.
const PG_EPOCH_DAYS_FROM_CE: i32 = 730_120;

/// PostgreSQL connection handle.
pub struct PostgresAdapter {
    pool: Pool,
    dialect: DialectImpl,
    default_schema: String,
}

impl PostgresAdapter {
    /// Build the pool and open its single connection.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let ssl_mode = SslMode::parse(&endpoint.ssl_mode)?;

        let mut pg_config = PgConfig::new();
        pg_config.host(&endpoint.host);
        pg_config.port(endpoint.port());
        pg_config.dbname(&endpoint.database);
        pg_config.user(&endpoint.user);
        pg_config.password(&endpoint.password);
        pg_config.connect_timeout(Duration::from_secs(endpoint.connect_timeout_secs));
        pg_config.ssl_mode(ssl_mode.postgres_mode());

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = match TlsBuilder::new(ssl_mode).build()? {
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config)
            }
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
        };
        let pool = Pool::builder(mgr)
            .max_size(1)
            .build()
            .map_err(|e| MigrateError::connection(e, "creating PostgreSQL pool"))?;

        let adapter = Self {
            pool,
            dialect: DialectImpl::for_db_type(DbType::Postgresql),
            default_schema: endpoint.default_schema(),
        };
        adapter.client().await?;
        Ok(adapter)
    }

    async fn client(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::connection(e, "getting PostgreSQL connection"))
    }

    async fn catalog_query(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
        context: &str,
    ) -> Result<Vec<tokio_postgres::Row>> {
        let client = self.client().await?;
        client
            .query(sql, params)
            .await
            .map_err(|e| catalog_error(e, context))
    }

    async fn load_columns(&self, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT
                column_name::text,
                udt_name::text,
                COALESCE(character_maximum_length, 0)::int4,
                COALESCE(numeric_precision, 0)::int4,
                COALESCE(numeric_scale, 0)::int4,
                is_nullable = 'YES',
                (is_identity = 'YES' OR COALESCE(column_default, '') LIKE 'nextval(%'),
                column_default::text,
                ordinal_position::int4
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
        "#;

        let rows = self
            .catalog_query(query, &[&table.schema, &table.name], "loading PostgreSQL columns")
            .await?;

        for row in rows {
            let data_type: String = row.get(1);
            let max_length: i32 = row.get(2);
            let precision: i32 = row.get(3);
            let scale: i32 = row.get(4);
            let info = self
                .dialect
                .to_canonical(&data_type, max_length, precision, scale);
            table.columns.push(Column {
                name: row.get(0),
                data_type,
                canonical: info.canonical_type,
                canonical_warning: info.warning,
                max_length,
                precision,
                scale,
                is_nullable: row.get(5),
                is_primary_key: false,
                is_identity: row.get(6),
                default_expr: row.get(7),
                ordinal_pos: row.get(8),
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
            SELECT a.attname::text
            FROM pg_catalog.pg_constraint c
            JOIN pg_catalog.pg_class t ON t.oid = c.conrelid
            JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid
            WHERE n.nspname = $1
              AND t.relname = $2
              AND c.contype = 'p'
              AND a.attnum = ANY(c.conkey)
            ORDER BY array_position(c.conkey, a.attnum)
        "#;

        let rows = self
            .catalog_query(query, &[&table.schema, &table.name], "loading PostgreSQL primary key")
            .await?;
        table.primary_key = rows.iter().map(|r| r.get(0)).collect();
        table.sync_primary_key_flags();
        Ok(())
    }

    async fn load_indexes(&self, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT
                i.relname::text AS index_name,
                ix.indisunique,
                array_agg(a.attname::text ORDER BY array_position(ix.indkey, a.attnum)) AS columns
            FROM pg_catalog.pg_index ix
            JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid
            JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
            JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
            WHERE n.nspname = $1
              AND t.relname = $2
              AND NOT ix.indisprimary
            GROUP BY i.relname, ix.indisunique
            ORDER BY i.relname
        "#;

        let rows = self
            .catalog_query(query, &[&table.schema, &table.name], "loading PostgreSQL indexes")
            .await?;
        for row in rows {
            table.indexes.push(Index {
                name: row.get(0),
                is_unique: row.get(1),
                columns: row.get(2),
            });
        }
        Ok(())
    }

    async fn load_foreign_keys(&self, table: &mut Table) -> Result<()> {
        // unnest pairs each referencing column with its referenced column
        let query = r#"
            SELECT
                c.conname::text AS fk_name,
                array_agg(a.attname::text ORDER BY k.ord) AS columns,
                rn.nspname::text AS ref_schema,
                rt.relname::text AS ref_table,
                array_agg(ra.attname::text ORDER BY k.ord) AS ref_columns,
                CASE c.confdeltype
                    WHEN 'r' THEN 'RESTRICT'
                    WHEN 'c' THEN 'CASCADE'
                    WHEN 'n' THEN 'SET_NULL'
                    WHEN 'd' THEN 'SET_DEFAULT'
                    ELSE 'NO_ACTION'
                END AS on_delete,
                CASE c.confupdtype
                    WHEN 'r' THEN 'RESTRICT'
                    WHEN 'c' THEN 'CASCADE'
                    WHEN 'n' THEN 'SET_NULL'
                    WHEN 'd' THEN 'SET_DEFAULT'
                    ELSE 'NO_ACTION'
                END AS on_update
            FROM pg_catalog.pg_constraint c
            JOIN pg_catalog.pg_class t ON t.oid = c.conrelid
            JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_catalog.pg_class rt ON rt.oid = c.confrelid
            JOIN pg_catalog.pg_namespace rn ON rn.oid = rt.relnamespace
            CROSS JOIN LATERAL unnest(c.conkey, c.confkey) WITH ORDINALITY AS k(attnum, refnum, ord)
            JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
            JOIN pg_catalog.pg_attribute ra ON ra.attrelid = rt.oid AND ra.attnum = k.refnum
            WHERE n.nspname = $1
              AND t.relname = $2
              AND c.contype = 'f'
            GROUP BY c.conname, rn.nspname, rt.relname, c.confdeltype, c.confupdtype
            ORDER BY c.conname
        "#;

        let rows = self
            .catalog_query(query, &[&table.schema, &table.name], "loading PostgreSQL foreign keys")
            .await?;
        for row in rows {
            table.foreign_keys.push(ForeignKey {
                name: row.get(0),
                columns: row.get(1),
                ref_schema: row.get(2),
                ref_table: row.get(3),
                ref_columns: row.get(4),
                on_delete: row.get(5),
                on_update: row.get(6),
            });
        }
        Ok(())
    }

    async fn simple(&self, target: &str, sql: &str) -> Result<()> {
        let client = self.client().await?;
        client
            .batch_execute(sql)
            .await
            .map_err(|e| MigrateError::ddl(target, e.to_string()))
    }
}

#[async_trait]
impl DialectAdapter for PostgresAdapter {
    fn dialect(&self) -> &DialectImpl {
        &self.dialect
    }

    fn default_schema(&self) -> &str {
        &self.default_schema
    }

    async fn ping(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| MigrateError::connection(e, "testing PostgreSQL connection"))?;
        Ok(())
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let rows = self
            .catalog_query(
                "SELECT datname::text FROM pg_catalog.pg_database WHERE NOT datistemplate ORDER BY datname",
                &[],
                "listing PostgreSQL databases",
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn list_schemas(&self) -> Result<Vec<String>> {
        let rows = self
            .catalog_query(
                r#"
                SELECT schema_name::text
                FROM information_schema.schemata
                WHERE schema_name NOT IN ('pg_catalog', 'information_schema')
                  AND schema_name NOT LIKE 'pg_toast%'
                  AND schema_name NOT LIKE 'pg_temp%'
                ORDER BY schema_name
            "#,
                &[],
                "listing PostgreSQL schemas",
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        let rows = self
            .catalog_query(
                r#"
                SELECT table_name::text
                FROM information_schema.tables
                WHERE table_type = 'BASE TABLE' AND table_schema = $1
                ORDER BY table_name
            "#,
                &[&schema],
                "listing PostgreSQL tables",
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
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
                FROM information_schema.tables
                WHERE table_schema = $1 AND table_name = $2
            "#,
                &[&schema, &table],
                "checking PostgreSQL table",
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<i64> {
        let name = format!("{}.{}", schema, table);
        let client = self.client().await?;
        let row = client
            .query_one(&self.dialect.row_count_sql(schema, table), &[])
            .await
            .map_err(|e| read_error(&name, e))?;
        row.try_get::<_, i64>(0).map_err(|e| read_error(&name, e))
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
        let name = table.full_name();
        let data = encode_copy_data(&table.columns, &rows)
            .map_err(|msg| MigrateError::write(&name, msg, false))?;
        let copy_sql = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT BINARY)",
            self.dialect.qualify(&table.schema, &table.name),
            self.dialect.column_list(&table.column_names())
        );

        let mut client = self.client().await?;
        let written = if within_tx {
            let tx = client
                .transaction()
                .await
                .map_err(|e| write_error(&name, e))?;
            let sink = tx
                .copy_in(copy_sql.as_str())
                .await
                .map_err(|e| write_error(&name, e))?;
            let n = send_copy(sink, data)
                .await
                .map_err(|e| write_error(&name, e))?;
            tx.commit().await.map_err(|e| write_error(&name, e))?;
            n
        } else {
            let sink = client
                .copy_in(copy_sql.as_str())
                .await
                .map_err(|e| write_error(&name, e))?;
            send_copy(sink, data)
                .await
                .map_err(|e| write_error(&name, e))?
        };

        debug!("PostgreSQL: wrote {} rows to {}", written, name);
        Ok(written)
    }

    async fn execute_ddl(&self, target: &str, sql: &str) -> Result<()> {
        self.simple(target, sql).await
    }

    /// One statement, so foreign keys among the listed tables never block it.
    async fn truncate_tables(&self, schema: &str, tables: &[String]) -> Result<()> {
        if tables.is_empty() {
            return Ok(());
        }
        let list: Vec<String> = tables
            .iter()
            .map(|t| self.dialect.qualify(schema, t))
            .collect();
        self.simple(schema, &format!("TRUNCATE TABLE {}", list.join(", ")))
            .await
    }

    async fn set_constraint_enforcement(
        &self,
        schema: &str,
        table: &str,
        enabled: bool,
    ) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {} {} TRIGGER ALL",
            self.dialect.qualify(schema, table),
            if enabled { "ENABLE" } else { "DISABLE" }
        );
        self.simple(&format!("{}.{}", schema, table), &sql).await
    }

    async fn sample_rows(&self, table: &Table, limit: usize) -> Result<Vec<Row>> {
        fetch_rows(&self.pool, table, &self.dialect.sample_sql(table, limit)).await
    }

    async fn close(&self) {
        self.pool.close();
    }
}

async fn send_copy(sink: CopyInSink<Bytes>, data: Bytes) -> std::result::Result<u64, tokio_postgres::Error> {
    tokio::pin!(sink);
    sink.send(data).await?;
    sink.as_mut().finish().await
}

async fn fetch_rows(pool: &Pool, table: &Table, sql: &str) -> Result<Vec<Row>> {
    let name = table.full_name();
    let client = pool
        .get()
        .await
        .map_err(|e| MigrateError::read(&name, e.to_string(), true))?;
    let rows = client
        .query(sql, &[])
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
    row: &tokio_postgres::Row,
    i: usize,
    col: &Column,
) -> std::result::Result<SqlValue, tokio_postgres::Error> {
    fn opt<T>(v: Option<T>, f: impl FnOnce(T) -> SqlValue) -> SqlValue {
        v.map(f).unwrap_or(SqlValue::Null)
    }

    Ok(match col.data_type.as_str() {
        "bool" => opt(row.try_get::<_, Option<bool>>(i)?, SqlValue::Bool),
        "int2" => opt(row.try_get::<_, Option<i16>>(i)?, SqlValue::I16),
        "int4" => opt(row.try_get::<_, Option<i32>>(i)?, SqlValue::I32),
        "int8" => opt(row.try_get::<_, Option<i64>>(i)?, SqlValue::I64),
        "float4" => opt(row.try_get::<_, Option<f32>>(i)?, SqlValue::F32),
        "float8" => opt(row.try_get::<_, Option<f64>>(i)?, SqlValue::F64),
        "numeric" => opt(row.try_get::<_, Option<Decimal>>(i)?, SqlValue::Decimal),
        "money" => opt(row.try_get::<_, Option<Money>>(i)?, |m| SqlValue::Decimal(m.0)),
        "bytea" => opt(row.try_get::<_, Option<Vec<u8>>>(i)?, SqlValue::Bytes),
        "uuid" => opt(row.try_get::<_, Option<Uuid>>(i)?, SqlValue::Uuid),
        "date" => opt(row.try_get::<_, Option<NaiveDate>>(i)?, SqlValue::Date),
        "time" => opt(row.try_get::<_, Option<NaiveTime>>(i)?, SqlValue::Time),
        "timetz" => opt(row.try_get::<_, Option<TimeTz>>(i)?, |t| SqlValue::Time(t.0)),
        "timestamp" => opt(row.try_get::<_, Option<NaiveDateTime>>(i)?, SqlValue::DateTime),
        "timestamptz" => opt(
            row.try_get::<_, Option<DateTime<FixedOffset>>>(i)?,
            SqlValue::DateTimeOffset,
        ),
        _ => opt(row.try_get::<_, Option<LenientText>>(i)?, |t| SqlValue::Text(t.0)),
    })
}

/// Any value whose binary form is UTF-8 text (text, varchar, json, xml, ...).
struct LenientText(String);

impl<'a> FromSql<'a> for LenientText {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        // jsonb carries a one-byte format version in front of the text
        let text = if *ty == Type::JSONB && raw.first() == Some(&1) {
            &raw[1..]
        } else {
            raw
        };
        Ok(LenientText(std::str::from_utf8(text)?.to_string()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// `money`: int8 in hundredths.
struct Money(Decimal);

impl<'a> FromSql<'a> for Money {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        let cents = i64::from_be_bytes(raw.try_into()?);
        Ok(Money(Decimal::new(cents, 2)))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::MONEY
    }
}

/// `timetz`: int8 microseconds then int4 zone offset, which is dropped.
struct TimeTz(NaiveTime);

impl<'a> FromSql<'a> for TimeTz {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        let micros = i64::from_be_bytes(raw.get(..8).ok_or("short timetz value")?.try_into()?);
        let secs = (micros / 1_000_000) as u32;
        let nanos = ((micros % 1_000_000) * 1_000) as u32;
        let t = NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
            .ok_or("timetz out of range")?;
        Ok(TimeTz(t))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::TIMETZ
    }
}

/// Build a complete binary COPY payload: header, rows, trailer.
fn encode_copy_data(columns: &[Column], rows: &[Row]) -> std::result::Result<Bytes, String> {
    let mut buf = BytesMut::with_capacity(rows.len() * 64 + 32);
    buf.put_slice(b"PGCOPY\n\xff\r\n\0");
    buf.put_i32(0); // flags
    buf.put_i32(0); // header extension length

    for row in rows {
        buf.put_i16(columns.len() as i16);
        for (col, value) in columns.iter().zip(row) {
            encode_field(&mut buf, col, value)?;
        }
    }
    buf.put_i16(-1);
    Ok(buf.freeze())
}

/// Encode one field in the binary representation of the column's type.
fn encode_field(buf: &mut BytesMut, col: &Column, value: &SqlValue) -> std::result::Result<(), String> {
    if value.is_null() {
        buf.put_i32(-1);
        return Ok(());
    }
    let mismatch = || format!("cannot encode {:?} for column {} ({})", value, col.name, col.data_type);
    let int = || value.as_i64().ok_or_else(mismatch);

    match col.data_type.as_str() {
        "bool" => match value {
            SqlValue::Bool(b) => {
                buf.put_i32(1);
                buf.put_u8(*b as u8);
            }
            _ => return Err(mismatch()),
        },
        "int2" => {
            let v = i16::try_from(int()?).map_err(|_| mismatch())?;
            buf.put_i32(2);
            buf.put_i16(v);
        }
        "int4" => {
            let v = i32::try_from(int()?).map_err(|_| mismatch())?;
            buf.put_i32(4);
            buf.put_i32(v);
        }
        "int8" => {
            buf.put_i32(8);
            buf.put_i64(int()?);
        }
        "float4" | "float8" => {
            let v = match value {
                SqlValue::F32(f) => *f as f64,
                SqlValue::F64(f) => *f,
                other => other.as_i64().ok_or_else(mismatch)? as f64,
            };
            if col.data_type == "float4" {
                buf.put_i32(4);
                buf.put_f32(v as f32);
            } else {
                buf.put_i32(8);
                buf.put_f64(v);
            }
        }
        "numeric" => match value {
            SqlValue::Decimal(d) => encode_decimal_binary(buf, d),
            other => encode_decimal_binary(buf, &Decimal::from(other.as_i64().ok_or_else(mismatch)?)),
        },
        "money" => match value {
            SqlValue::Decimal(d) => {
                let cents = (d.round_dp(2) * Decimal::ONE_HUNDRED)
                    .trunc()
                    .mantissa();
                let cents = i64::try_from(cents).map_err(|_| mismatch())?;
                buf.put_i32(8);
                buf.put_i64(cents);
            }
            _ => return Err(mismatch()),
        },
        "bytea" => {
            let bytes: &[u8] = match value {
                SqlValue::Bytes(b) => b,
                SqlValue::Text(s) => s.as_bytes(),
                _ => return Err(mismatch()),
            };
            buf.put_i32(bytes.len() as i32);
            buf.put_slice(bytes);
        }
        "uuid" => {
            let u = match value {
                SqlValue::Uuid(u) => *u,
                SqlValue::Text(s) => Uuid::parse_str(s.trim()).map_err(|_| mismatch())?,
                _ => return Err(mismatch()),
            };
            buf.put_i32(16);
            buf.put_slice(u.as_bytes());
        }
        "date" => match value {
            SqlValue::Date(d) => {
                buf.put_i32(4);
                buf.put_i32(d.num_days_from_ce_pg());
            }
            _ => return Err(mismatch()),
        },
        "time" => match value {
            SqlValue::Time(t) => {
                buf.put_i32(8);
                buf.put_i64(time_micros(t));
            }
            _ => return Err(mismatch()),
        },
        "timestamp" | "timestamptz" => {
            let utc: NaiveDateTime = match value {
                SqlValue::DateTime(dt) => *dt,
                SqlValue::DateTimeOffset(dto) => dto.naive_utc(),
                _ => return Err(mismatch()),
            };
            buf.put_i32(8);
            buf.put_i64(utc.and_utc().timestamp_micros() - PG_EPOCH_OFFSET_MICROS);
        }
        "jsonb" => {
            let text = value.to_text().ok_or_else(mismatch)?;
            buf.put_i32(text.len() as i32 + 1);
            buf.put_u8(1);
            buf.put_slice(text.as_bytes());
        }
        "text" | "varchar" | "bpchar" | "name" | "citext" | "json" | "xml" => {
            let text = value.to_text().ok_or_else(mismatch)?;
            buf.put_i32(text.len() as i32);
            buf.put_slice(text.as_bytes());
        }
        _ => {
            return Err(format!(
                "column {} has unsupported type {} for binary COPY",
                col.name, col.data_type
            ))
        }
    }
    Ok(())
}

trait PgDays {
    fn num_days_from_ce_pg(&self) -> i32;
}

impl PgDays for NaiveDate {
    /// Days since 2000-01-01.
    fn num_days_from_ce_pg(&self) -> i32 {
        use chrono::Datelike;
        self.num_days_from_ce() - PG_EPOCH_DAYS_FROM_CE
    }
}

fn time_micros(t: &NaiveTime) -> i64 {
    use chrono::Timelike;
    t.num_seconds_from_midnight() as i64 * 1_000_000 + (t.nanosecond() / 1_000) as i64
}

/// Encode a Decimal in the binary NUMERIC format:
/// ndigits, weight, sign, dscale (all i16), then base-10000 digits.
fn encode_decimal_binary(buf: &mut BytesMut, d: &Decimal) {
    const NUMERIC_POS: i16 = 0x0000;
    const NUMERIC_NEG: i16 = 0x4000;

    let dscale = d.scale() as i16;
    if d.is_zero() {
        buf.put_i32(8);
        buf.put_i16(0);
        buf.put_i16(0);
        buf.put_i16(NUMERIC_POS);
        buf.put_i16(dscale);
        return;
    }

    let sign = if d.is_sign_negative() {
        NUMERIC_NEG
    } else {
        NUMERIC_POS
    };

    let abs_str = d.abs().to_string();
    let (int_part, frac_part) = match abs_str.find('.') {
        Some(dot) => (&abs_str[..dot], &abs_str[dot + 1..]),
        None => (abs_str.as_str(), ""),
    };

    // Integer digits group right-to-left from the point, fraction digits
    // group left-to-right.
    let group = |s: &str| -> i16 { s.bytes().fold(0i16, |acc, b| acc * 10 + (b - b'0') as i16) };

    let int_clean = int_part.trim_start_matches('0');
    let int_padded = format!("{:0>width$}", int_clean, width = int_clean.len().div_ceil(4) * 4);
    let int_digits: Vec<i16> = int_padded
        .as_bytes()
        .chunks(4)
        .map(|c| group(std::str::from_utf8(c).unwrap_or("0")))
        .collect();

    let frac_padded = format!("{:0<width$}", frac_part, width = frac_part.len().div_ceil(4) * 4);
    let frac_digits: Vec<i16> = frac_padded
        .as_bytes()
        .chunks(4)
        .map(|c| group(std::str::from_utf8(c).unwrap_or("0")))
        .collect();

    let weight = if !int_digits.is_empty() {
        int_digits.len() as i16 - 1
    } else {
        let leading_zero_groups = frac_digits.iter().take_while(|&&g| g == 0).count() as i16;
        -(leading_zero_groups + 1)
    };

    let mut digits: Vec<i16> = int_digits.into_iter().chain(frac_digits).collect();
    while digits.len() > 1 && digits.last() == Some(&0) {
        digits.pop();
    }
    let leading = digits.iter().take_while(|&&g| g == 0).count().min(digits.len() - 1);
    digits.drain(..leading);

    buf.put_i32(8 + digits.len() as i32 * 2);
    buf.put_i16(digits.len() as i16);
    buf.put_i16(weight);
    buf.put_i16(sign);
    buf.put_i16(dscale);
    for digit in digits {
        buf.put_i16(digit);
    }
}

fn is_transient(e: &tokio_postgres::Error) -> bool {
    if e.is_closed() {
        return true;
    }
    match e.code() {
        Some(code) => [
            SqlState::T_R_DEADLOCK_DETECTED,
            SqlState::T_R_SERIALIZATION_FAILURE,
            SqlState::LOCK_NOT_AVAILABLE,
            SqlState::ADMIN_SHUTDOWN,
            SqlState::CANNOT_CONNECT_NOW,
            SqlState::QUERY_CANCELED,
        ]
        .contains(code),
        None => e
            .source()
            .is_some_and(|s| s.is::<std::io::Error>()),
    }
}

fn read_error(table: &str, e: tokio_postgres::Error) -> MigrateError {
    MigrateError::read(table, e.to_string(), is_transient(&e))
}

fn write_error(table: &str, e: tokio_postgres::Error) -> MigrateError {
    MigrateError::write(table, e.to_string(), is_transient(&e))
}

fn catalog_error(e: tokio_postgres::Error, context: &str) -> MigrateError {
    if is_transient(&e) {
        MigrateError::connection(e, context)
    } else {
        MigrateError::read("pg_catalog", format!("{}: {}", context, e), false)
    }
}
