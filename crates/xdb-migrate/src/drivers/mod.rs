//! Database driver implementations.
//!
//! - [`mysql`]: MySQL/MariaDB (sqlx reads, mysql_async writes)
//! - [`postgres`]: PostgreSQL (tokio-postgres + deadpool)
//! - [`oracle`]: Oracle (ODPI-C, behind the `oracle` feature)
//! - [`mssql`]: Microsoft SQL Server (tiberius + bb8)
//! - [`memory`]: in-process adapter for tests and dry runs
//! - [`common`]: shared TLS and paging helpers
//!
//! # Static dispatch
//!
//! `DialectImpl` and `AdapterImpl` are plain enums selected by the
//! [`DbType`] tag. The compiler generates a match instead of vtable dispatch,
//! and adding a vendor means adding one variant to each enum.

pub mod common;
pub mod memory;
pub mod mssql;
pub mod mysql;
pub mod oracle;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

pub use common::{SslMode, TlsBuilder};
pub use memory::MemoryAdapter;
pub use mssql::{MssqlAdapter, MssqlDialect};
pub use mysql::{MysqlAdapter, MysqlDialect};
#[cfg(feature = "oracle")]
pub use oracle::OracleAdapter;
pub use oracle::OracleDialect;
pub use postgres::{PostgresAdapter, PostgresDialect};

use crate::config::{DbType, Endpoint};
use crate::core::traits::{Dialect, DialectAdapter};
use crate::core::{Batch, ForeignKey, Index, Row, Table};
use crate::dialect::{
    CanonicalType, CanonicalTypeInfo, ComposedMapper, FromCanonical, ToCanonical, TypeMapping,
};
use crate::error::{MigrateError, Result};

/// Enum-based static dispatch for dialects.
#[derive(Debug, Clone)]
pub enum DialectImpl {
    Mysql(MysqlDialect),
    Postgres(PostgresDialect),
    Oracle(OracleDialect),
    Mssql(MssqlDialect),
}

macro_rules! with_dialect {
    ($self:expr, $d:ident => $body:expr) => {
        match $self {
            DialectImpl::Mysql($d) => $body,
            DialectImpl::Postgres($d) => $body,
            DialectImpl::Oracle($d) => $body,
            DialectImpl::Mssql($d) => $body,
        }
    };
}

impl DialectImpl {
    /// Dialect for a vendor tag.
    pub fn for_db_type(db_type: DbType) -> Self {
        match db_type {
            DbType::Mysql => DialectImpl::Mysql(MysqlDialect::new()),
            DbType::Postgresql => DialectImpl::Postgres(PostgresDialect::new()),
            DbType::Oracle => DialectImpl::Oracle(OracleDialect::new()),
            DbType::Sqlserver => DialectImpl::Mssql(MssqlDialect::new()),
        }
    }

    /// Create a dialect implementation from a database type string.
    ///
    /// # Errors
    ///
    /// Returns an error if the database type is not recognized.
    pub fn from_db_type(db_type: &str) -> Result<Self> {
        db_type.parse::<DbType>().map(Self::for_db_type)
    }
}

impl ToCanonical for DialectImpl {
    fn to_canonical(
        &self,
        data_type: &str,
        max_length: i32,
        precision: i32,
        scale: i32,
    ) -> CanonicalTypeInfo {
        with_dialect!(self, d => d.to_canonical(data_type, max_length, precision, scale))
    }
}

impl FromCanonical for DialectImpl {
    fn from_canonical(&self, canonical: &CanonicalType) -> TypeMapping {
        with_dialect!(self, d => d.from_canonical(canonical))
    }
}

// Every method a vendor overrides is forwarded; the rest compose from these.
impl Dialect for DialectImpl {
    fn name(&self) -> &'static str {
        with_dialect!(self, d => d.name())
    }

    fn db_type(&self) -> DbType {
        with_dialect!(self, d => d.db_type())
    }

    fn quote_ident(&self, name: &str) -> String {
        with_dialect!(self, d => d.quote_ident(name))
    }

    fn param_placeholder(&self, index: usize) -> String {
        with_dialect!(self, d => d.param_placeholder(index))
    }

    fn max_params(&self) -> usize {
        with_dialect!(self, d => d.max_params())
    }

    fn supports_if_not_exists(&self) -> bool {
        with_dialect!(self, d => d.supports_if_not_exists())
    }

    fn table_options(&self) -> &'static str {
        with_dialect!(self, d => d.table_options())
    }

    fn limit_clause(&self, limit: usize, offset: u64) -> String {
        with_dialect!(self, d => d.limit_clause(limit, offset))
    }

    fn fallback_order(&self) -> Option<&'static str> {
        with_dialect!(self, d => d.fallback_order())
    }

    fn create_index_sql(&self, table: &Table, idx: &Index, schema: &str) -> String {
        with_dialect!(self, d => d.create_index_sql(table, idx, schema))
    }

    fn referential_action(&self, action: &str, on_update: bool) -> Option<String> {
        with_dialect!(self, d => d.referential_action(action, on_update))
    }

    fn sample_sql(&self, table: &Table, limit: usize) -> String {
        with_dialect!(self, d => d.sample_sql(table, limit))
    }

    fn insert_sql(&self, table: &Table, rows: usize) -> String {
        with_dialect!(self, d => d.insert_sql(table, rows))
    }
}

/// Source→target type mapper for a dialect pair.
pub fn mapper(source: &DialectImpl, target: &DialectImpl) -> ComposedMapper {
    ComposedMapper::new(Arc::new(source.clone()), Arc::new(target.clone()))
}

/// Enum-based static dispatch for live adapters.
///
/// Each value is one connection handle.
pub enum AdapterImpl {
    Mysql(MysqlAdapter),
    Postgres(PostgresAdapter),
    #[cfg(feature = "oracle")]
    Oracle(OracleAdapter),
    Mssql(MssqlAdapter),
    Memory(MemoryAdapter),
}

macro_rules! with_adapter {
    ($self:expr, $a:ident => $body:expr) => {
        match $self {
            AdapterImpl::Mysql($a) => $body,
            AdapterImpl::Postgres($a) => $body,
            #[cfg(feature = "oracle")]
            AdapterImpl::Oracle($a) => $body,
            AdapterImpl::Mssql($a) => $body,
            AdapterImpl::Memory($a) => $body,
        }
    };
}

impl AdapterImpl {
    /// Validate `endpoint`, open a handle and ping it.
    ///
    /// Missing vendor-mandatory fields fail with `Config` before any
    /// network call.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        endpoint.validate()?;

        let adapter = match endpoint.r#type {
            DbType::Mysql => AdapterImpl::Mysql(MysqlAdapter::connect(endpoint).await?),
            DbType::Postgresql => AdapterImpl::Postgres(PostgresAdapter::connect(endpoint).await?),
            #[cfg(feature = "oracle")]
            DbType::Oracle => AdapterImpl::Oracle(OracleAdapter::connect(endpoint).await?),
            #[cfg(not(feature = "oracle"))]
            DbType::Oracle => {
                return Err(MigrateError::Config(
                    "oracle support is not compiled in (build with the `oracle` feature)".into(),
                ))
            }
            DbType::Sqlserver => AdapterImpl::Mssql(MssqlAdapter::connect(endpoint).await?),
        };

        adapter.ping().await?;
        info!("Connected to {}", endpoint.describe());
        Ok(adapter)
    }

    /// Another handle on the same backing store, when that needs no new
    /// network connection.
    pub fn try_clone_handle(&self) -> Option<AdapterImpl> {
        match self {
            AdapterImpl::Memory(m) => Some(AdapterImpl::Memory(m.clone())),
            _ => None,
        }
    }
}

#[async_trait]
impl DialectAdapter for AdapterImpl {
    fn dialect(&self) -> &DialectImpl {
        with_adapter!(self, a => a.dialect())
    }

    fn default_schema(&self) -> &str {
        with_adapter!(self, a => a.default_schema())
    }

    async fn ping(&self) -> Result<()> {
        with_adapter!(self, a => a.ping().await)
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        with_adapter!(self, a => a.list_databases().await)
    }

    async fn list_schemas(&self) -> Result<Vec<String>> {
        with_adapter!(self, a => a.list_schemas().await)
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        with_adapter!(self, a => a.list_tables(schema).await)
    }

    async fn describe_table(&self, schema: &str, table: &str) -> Result<Table> {
        with_adapter!(self, a => a.describe_table(schema, table).await)
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        with_adapter!(self, a => a.table_exists(schema, table).await)
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<i64> {
        with_adapter!(self, a => a.row_count(schema, table).await)
    }

    fn stream_rows(&self, table: &Table, batch_size: usize) -> mpsc::Receiver<Result<Batch>> {
        with_adapter!(self, a => a.stream_rows(table, batch_size))
    }

    async fn write_batch(&self, table: &Table, rows: Vec<Row>, within_tx: bool) -> Result<u64> {
        with_adapter!(self, a => a.write_batch(table, rows, within_tx).await)
    }

    async fn execute_ddl(&self, target: &str, sql: &str) -> Result<()> {
        with_adapter!(self, a => a.execute_ddl(target, sql).await)
    }

    async fn truncate_tables(&self, schema: &str, tables: &[String]) -> Result<()> {
        with_adapter!(self, a => a.truncate_tables(schema, tables).await)
    }

    async fn set_constraint_enforcement(
        &self,
        schema: &str,
        table: &str,
        enabled: bool,
    ) -> Result<()> {
        with_adapter!(self, a => a.set_constraint_enforcement(schema, table, enabled).await)
    }

    async fn sample_rows(&self, table: &Table, limit: usize) -> Result<Vec<Row>> {
        with_adapter!(self, a => a.sample_rows(table, limit).await)
    }

    async fn close(&self) {
        with_adapter!(self, a => a.close().await)
    }

    fn supports_deferred_constraints(&self) -> bool {
        with_adapter!(self, a => a.supports_deferred_constraints())
    }

    async fn create_table(&self, table: &Table, schema: &str, inline_fks: bool) -> Result<()> {
        with_adapter!(self, a => a.create_table(table, schema, inline_fks).await)
    }

    async fn create_indexes(&self, table: &Table, schema: &str) -> Result<usize> {
        with_adapter!(self, a => a.create_indexes(table, schema).await)
    }

    async fn create_foreign_keys(
        &self,
        table: &Table,
        fks: &[ForeignKey],
        schema: &str,
    ) -> Vec<(String, MigrateError)> {
        with_adapter!(self, a => a.create_foreign_keys(table, fks, schema).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_impl_from_db_type() {
        let mssql = DialectImpl::from_db_type("mssql").unwrap();
        assert_eq!(mssql.name(), "mssql");

        let postgres = DialectImpl::from_db_type("postgres").unwrap();
        assert_eq!(postgres.name(), "postgres");

        assert_eq!(DialectImpl::from_db_type("mariadb").unwrap().name(), "mysql");
        assert_eq!(DialectImpl::from_db_type("oracle").unwrap().name(), "oracle");
        assert!(DialectImpl::from_db_type("sqlserver").is_ok());
        assert!(DialectImpl::from_db_type("pg").is_ok());

        let err = DialectImpl::from_db_type("unknown").unwrap_err();
        assert!(err.to_string().contains("Unknown database type"));
    }

    #[test]
    fn test_dialect_impl_dispatches_overrides() {
        let dialect = DialectImpl::for_db_type(DbType::Sqlserver);
        assert_eq!(dialect.quote_ident("table"), "[table]");
        assert_eq!(dialect.param_placeholder(1), "@P1");
        assert_eq!(dialect.fallback_order(), Some("(SELECT NULL)"));
        assert_eq!(dialect.referential_action("RESTRICT", false), None);

        let dialect = DialectImpl::for_db_type(DbType::Postgresql);
        assert_eq!(dialect.quote_ident("table"), "\"table\"");
        assert_eq!(dialect.param_placeholder(1), "$1");
    }

    #[test]
    fn test_mapper_pair() {
        let mapper = mapper(
            &DialectImpl::for_db_type(DbType::Mysql),
            &DialectImpl::for_db_type(DbType::Oracle),
        );
        let (canonical, mapping) = mapper.map_type("tinyint(1)", 0, 3, 0);
        assert_eq!(canonical, CanonicalType::Boolean);
        assert_eq!(mapping.target_type, "NUMBER(1)");

        let (_, mapping) = mapper.map_type("varchar", 50, 0, 0);
        assert_eq!(mapping.target_type, "VARCHAR2(50 CHAR)");
        assert!(!mapping.is_lossy);
    }
}
