//! Core traits for database-agnostic data migration.
//!
//! - [`Dialect`]: SQL syntax strategy for one database engine, including its
//!   native⇄canonical type tables.
//! - [`DialectAdapter`]: the capability interface every vendor implements
//!   (connect, introspect, DDL, stream-read, batch-write).

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::DbType;
use crate::dialect::{FromCanonical, ToCanonical};
use crate::drivers::DialectImpl;
use crate::error::{MigrateError, Result};

use super::schema::{Column, ForeignKey, Index, Table};
use super::value::{Batch, Row};

/// Position of one page in a table scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Page {
    /// `WHERE key > after ORDER BY key`. Used for a single integer primary key.
    Keyset { column: String, after: Option<i64> },

    /// `ORDER BY cols OFFSET n`. Used for everything else.
    Offset { order_by: Vec<String>, offset: u64 },
}

impl Page {
    /// First page of a scan over `table`.
    pub fn first(table: &Table) -> Self {
        match table.keyset_column() {
            Some(col) => Page::Keyset {
                column: col.name.clone(),
                after: None,
            },
            None => Page::Offset {
                order_by: table.order_columns(),
                offset: 0,
            },
        }
    }

    /// Whether this page uses keyset pagination.
    pub fn is_keyset(&self) -> bool {
        matches!(self, Page::Keyset { .. })
    }
}

/// SQL syntax strategy for different database engines.
///
/// Everything here is pure string generation. DDL is produced from canonical
/// column types, so the destination dialect never needs to know which vendor
/// the table was described on.
pub trait Dialect: ToCanonical + FromCanonical + Send + Sync {
    /// Dialect identifier (e.g. "mysql", "postgres").
    fn name(&self) -> &'static str;

    /// Vendor tag.
    fn db_type(&self) -> DbType;

    /// Quote an identifier (table name, column name, etc.).
    fn quote_ident(&self, name: &str) -> String;

    /// Schema-qualified, quoted table name.
    fn qualify(&self, schema: &str, table: &str) -> String {
        format!("{}.{}", self.quote_ident(schema), self.quote_ident(table))
    }

    /// Parameter placeholder for the given 1-based index.
    fn param_placeholder(&self, index: usize) -> String;

    /// Maximum bind parameters in one statement.
    fn max_params(&self) -> usize;

    /// Whether `CREATE TABLE IF NOT EXISTS` is available.
    fn supports_if_not_exists(&self) -> bool {
        false
    }

    /// Trailing table options appended to CREATE TABLE.
    fn table_options(&self) -> &'static str {
        ""
    }

    /// `LIMIT`/`OFFSET` clause for a paged SELECT.
    fn limit_clause(&self, limit: usize, offset: u64) -> String;

    /// ORDER BY used when OFFSET paging has no usable column.
    fn fallback_order(&self) -> Option<&'static str> {
        None
    }

    /// Native type for a canonical column type.
    fn column_type(&self, col: &Column) -> String {
        self.from_canonical(&col.canonical).target_type
    }

    /// Column definition for CREATE TABLE.
    fn column_definition(&self, col: &Column) -> String {
        let mut def = format!("{} {}", self.quote_ident(&col.name), self.column_type(col));
        if let Some(default) = col.portable_default() {
            def.push_str(" DEFAULT ");
            def.push_str(default);
        }
        if !col.is_nullable {
            def.push_str(" NOT NULL");
        }
        def
    }

    /// Generate CREATE TABLE for `table` inside `schema`.
    ///
    /// With `inline_fks`, foreign keys are part of the statement and their
    /// referenced tables are assumed to live in the same `schema`.
    fn create_table_sql(&self, table: &Table, schema: &str, inline_fks: bool) -> String {
        let mut parts: Vec<String> = table
            .columns
            .iter()
            .map(|c| format!("    {}", self.column_definition(c)))
            .collect();

        if table.has_pk() {
            parts.push(format!(
                "    PRIMARY KEY ({})",
                self.column_list(&table.primary_key)
            ));
        }

        if inline_fks {
            for fk in &table.foreign_keys {
                parts.push(format!("    {}", self.foreign_key_clause(fk, schema)));
            }
        }

        let if_not_exists = if self.supports_if_not_exists() {
            "IF NOT EXISTS "
        } else {
            ""
        };

        let mut sql = format!(
            "CREATE TABLE {}{} (\n{}\n)",
            if_not_exists,
            self.qualify(schema, &table.name),
            parts.join(",\n")
        );
        let options = self.table_options();
        if !options.is_empty() {
            sql.push(' ');
            sql.push_str(options);
        }
        sql
    }

    /// Generate CREATE INDEX for one index of `table` inside `schema`.
    fn create_index_sql(&self, table: &Table, idx: &Index, schema: &str) -> String {
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if idx.is_unique { "UNIQUE " } else { "" },
            self.quote_ident(&idx.name),
            self.qualify(schema, &table.name),
            self.column_list(&idx.columns)
        )
    }

    /// `CONSTRAINT ... FOREIGN KEY ... REFERENCES ...` fragment.
    fn foreign_key_clause(&self, fk: &ForeignKey, schema: &str) -> String {
        let mut clause = format!(
            "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
            self.quote_ident(&fk.name),
            self.column_list(&fk.columns),
            self.qualify(schema, &fk.ref_table),
            self.column_list(&fk.ref_columns)
        );
        if let Some(action) = self.referential_action(&fk.on_delete, false) {
            clause.push_str(" ON DELETE ");
            clause.push_str(&action);
        }
        if let Some(action) = self.referential_action(&fk.on_update, true) {
            clause.push_str(" ON UPDATE ");
            clause.push_str(&action);
        }
        clause
    }

    /// Referential action to emit, or `None` when it is the default or
    /// unsupported by the dialect.
    fn referential_action(&self, action: &str, _on_update: bool) -> Option<String> {
        match normalize_action(action).as_str() {
            "CASCADE" => Some("CASCADE".to_string()),
            "SET NULL" => Some("SET NULL".to_string()),
            "SET DEFAULT" => Some("SET DEFAULT".to_string()),
            "RESTRICT" => Some("RESTRICT".to_string()),
            _ => None,
        }
    }

    /// Generate ALTER TABLE ... ADD CONSTRAINT for a deferred foreign key.
    fn add_foreign_key_sql(&self, table: &Table, fk: &ForeignKey, schema: &str) -> String {
        format!(
            "ALTER TABLE {} ADD {}",
            self.qualify(schema, &table.name),
            self.foreign_key_clause(fk, schema)
        )
    }

    /// Comma-separated quoted column names.
    fn column_list(&self, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| self.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// SELECT for one page of `table` in its own schema.
    fn page_query(&self, table: &Table, page: &Page, limit: usize) -> String {
        let mut sql = format!(
            "SELECT {} FROM {}",
            self.column_list(&table.column_names()),
            self.qualify(&table.schema, &table.name)
        );
        match page {
            Page::Keyset { column, after } => {
                if let Some(after) = after {
                    sql.push_str(&format!(" WHERE {} > {}", self.quote_ident(column), after));
                }
                sql.push_str(&format!(" ORDER BY {}", self.quote_ident(column)));
                sql.push(' ');
                sql.push_str(&self.limit_clause(limit, 0));
            }
            Page::Offset { order_by, offset } => {
                if !order_by.is_empty() {
                    sql.push_str(&format!(" ORDER BY {}", self.column_list(order_by)));
                } else if let Some(fallback) = self.fallback_order() {
                    sql.push_str(" ORDER BY ");
                    sql.push_str(fallback);
                }
                sql.push(' ');
                sql.push_str(&self.limit_clause(limit, *offset));
            }
        }
        sql
    }

    /// SELECT returning at most `limit` rows, in no particular order.
    fn sample_sql(&self, table: &Table, limit: usize) -> String {
        format!(
            "SELECT {} FROM {} LIMIT {}",
            self.column_list(&table.column_names()),
            self.qualify(&table.schema, &table.name),
            limit
        )
    }

    /// Exact row count query.
    fn row_count_sql(&self, schema: &str, table: &str) -> String {
        format!("SELECT COUNT(*) FROM {}", self.qualify(schema, table))
    }

    /// Multi-row INSERT with placeholders for `rows` rows.
    fn insert_sql(&self, table: &Table, rows: usize) -> String {
        let ncols = table.columns.len();
        let mut groups = Vec::with_capacity(rows);
        let mut idx = 1;
        for _ in 0..rows {
            let placeholders: Vec<String> = (0..ncols)
                .map(|_| {
                    let p = self.param_placeholder(idx);
                    idx += 1;
                    p
                })
                .collect();
            groups.push(format!("({})", placeholders.join(", ")));
        }
        format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.qualify(&table.schema, &table.name),
            self.column_list(&table.column_names()),
            groups.join(", ")
        )
    }

    /// Rows per INSERT statement under the parameter limit.
    fn rows_per_insert(&self, ncols: usize) -> usize {
        if ncols == 0 {
            return 1;
        }
        (self.max_params() / ncols).clamp(1, 1000)
    }
}

/// Upper-case a catalog action name and turn `SET_NULL` into `SET NULL`.
pub fn normalize_action(action: &str) -> String {
    action.trim().to_uppercase().replace('_', " ")
}

/// Capability interface every vendor adapter implements.
///
/// One adapter value is one connection handle. The registry hands each
/// handle to at most one operation at a time, so implementations need not
/// guard against concurrent use of the same handle.
#[async_trait]
pub trait DialectAdapter: Send + Sync {
    /// SQL dialect of this connection.
    fn dialect(&self) -> &DialectImpl;

    /// Vendor tag.
    fn db_type(&self) -> DbType {
        self.dialect().db_type()
    }

    /// Default schema used when a table name is not qualified.
    fn default_schema(&self) -> &str;

    /// Round-trip check (`SELECT 1` or vendor equivalent).
    async fn ping(&self) -> Result<()>;

    /// Databases visible on the server.
    async fn list_databases(&self) -> Result<Vec<String>>;

    /// Schemas in the connected database.
    async fn list_schemas(&self) -> Result<Vec<String>>;

    /// Base tables in `schema`, sorted by name.
    async fn list_tables(&self, schema: &str) -> Result<Vec<String>>;

    /// Describe one table. Fails with `NotFound` when it does not exist.
    async fn describe_table(&self, schema: &str, table: &str) -> Result<Table>;

    /// Whether `schema.table` exists.
    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool>;

    /// Exact row count.
    async fn row_count(&self, schema: &str, table: &str) -> Result<i64>;

    /// Stream all rows of `table` in batches of `batch_size`.
    ///
    /// The stream is finite and always starts at row 0. The last batch
    /// carries `is_last`. Errors are delivered in-band and end the stream.
    fn stream_rows(&self, table: &Table, batch_size: usize) -> mpsc::Receiver<Result<Batch>>;

    /// Insert `rows` into `table`. Row values are in `table.columns` order
    /// and already coerced to the column types.
    ///
    /// With `within_tx` the whole call commits or rolls back as one unit.
    async fn write_batch(&self, table: &Table, rows: Vec<Row>, within_tx: bool) -> Result<u64>;

    /// Execute one DDL statement. `target` names the object for errors.
    async fn execute_ddl(&self, target: &str, sql: &str) -> Result<()>;

    /// Clear every row of `tables`, given in reverse dependency order.
    async fn truncate_tables(&self, schema: &str, tables: &[String]) -> Result<()>;

    /// Turn foreign-key enforcement on or off for `schema.table`.
    async fn set_constraint_enforcement(
        &self,
        schema: &str,
        table: &str,
        enabled: bool,
    ) -> Result<()>;

    /// Up to `limit` rows from `table`.
    async fn sample_rows(&self, table: &Table, limit: usize) -> Result<Vec<Row>>;

    /// Release the underlying connections.
    async fn close(&self);

    /// Whether foreign keys can be added after tables are loaded.
    fn supports_deferred_constraints(&self) -> bool {
        true
    }

    /// Create `table` in `schema`, honoring `IF NOT EXISTS` where available.
    async fn create_table(&self, table: &Table, schema: &str, inline_fks: bool) -> Result<()> {
        let sql = self.dialect().create_table_sql(table, schema, inline_fks);
        self.execute_ddl(&format!("{}.{}", schema, table.name), &sql)
            .await
    }

    /// Create every secondary index of `table`. Returns how many were created.
    async fn create_indexes(&self, table: &Table, schema: &str) -> Result<usize> {
        let target = format!("{}.{}", schema, table.name);
        for idx in &table.indexes {
            let sql = self.dialect().create_index_sql(table, idx, schema);
            self.execute_ddl(&target, &sql).await?;
        }
        Ok(table.indexes.len())
    }

    /// Add foreign keys after load. Failures are collected, not raised, so
    /// one bad constraint does not hide the rest.
    async fn create_foreign_keys(
        &self,
        table: &Table,
        fks: &[ForeignKey],
        schema: &str,
    ) -> Vec<(String, MigrateError)> {
        let target = format!("{}.{}", schema, table.name);
        let mut failures = Vec::new();
        for fk in fks {
            let sql = self.dialect().add_foreign_key_sql(table, fk, schema);
            if let Err(e) = self.execute_ddl(&target, &sql).await {
                failures.push((fk.name.clone(), e));
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::CanonicalType;
    use crate::drivers::{MssqlDialect, MysqlDialect, PostgresDialect};

    fn orders() -> Table {
        let mut t = Table::new("shop", "orders");
        t.columns
            .push(Column::new("id", "int", CanonicalType::Integer).not_null());
        t.columns.push(Column::new(
            "customer_id",
            "int",
            CanonicalType::Integer,
        ));
        t.primary_key = vec!["id".into()];
        t.foreign_keys.push(ForeignKey {
            name: "fk_orders_customer".into(),
            columns: vec!["customer_id".into()],
            ref_schema: "shop".into(),
            ref_table: "customers".into(),
            ref_columns: vec!["id".into()],
            on_delete: "CASCADE".into(),
            on_update: "NO_ACTION".into(),
        });
        t
    }

    #[test]
    fn test_page_first() {
        let t = orders();
        assert_eq!(
            Page::first(&t),
            Page::Keyset {
                column: "id".into(),
                after: None
            }
        );
        let mut t = t;
        t.primary_key.clear();
        assert!(!Page::first(&t).is_keyset());
    }

    #[test]
    fn test_keyset_page_query() {
        let d = PostgresDialect::new();
        let page = Page::Keyset {
            column: "id".into(),
            after: Some(500),
        };
        assert_eq!(
            d.page_query(&orders(), &page, 500),
            r#"SELECT "id", "customer_id" FROM "shop"."orders" WHERE "id" > 500 ORDER BY "id" LIMIT 500"#
        );
    }

    #[test]
    fn test_offset_page_without_order_columns() {
        let mut t = Table::new("dbo", "blobs");
        t.columns.push(Column::new("data", "varbinary", CanonicalType::Binary));
        let page = Page::first(&t);
        let sql = MssqlDialect::new().page_query(&t, &page, 100);
        assert!(sql.contains("ORDER BY (SELECT NULL)"));
        assert!(sql.ends_with("OFFSET 0 ROWS FETCH NEXT 100 ROWS ONLY"));
    }

    #[test]
    fn test_create_table_inline_fk() {
        let d = MysqlDialect::new();
        let sql = d.create_table_sql(&orders(), "shop", true);
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS `shop`.`orders`"));
        assert!(sql.contains("`id` INT NOT NULL"));
        assert!(sql.contains("PRIMARY KEY (`id`)"));
        assert!(sql.contains(
            "CONSTRAINT `fk_orders_customer` FOREIGN KEY (`customer_id`) REFERENCES `shop`.`customers` (`id`) ON DELETE CASCADE"
        ));
        assert!(!sql.contains("ON UPDATE"));
        assert!(sql.ends_with("ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"));

        let sql = d.create_table_sql(&orders(), "shop", false);
        assert!(!sql.contains("FOREIGN KEY"));
    }

    #[test]
    fn test_insert_sql_placeholders() {
        let d = MssqlDialect::new();
        let sql = d.insert_sql(&orders(), 2);
        assert_eq!(
            sql,
            "INSERT INTO [shop].[orders] ([id], [customer_id]) VALUES (@P1, @P2), (@P3, @P4)"
        );
        assert_eq!(d.rows_per_insert(3), 700);
        assert_eq!(d.rows_per_insert(1), 1000);
    }

    #[test]
    fn test_normalize_action() {
        assert_eq!(normalize_action("set_null"), "SET NULL");
        assert_eq!(normalize_action("NO ACTION"), "NO ACTION");
    }
}
