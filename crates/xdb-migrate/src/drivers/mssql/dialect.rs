//! Microsoft SQL Server dialect (Strategy pattern).

use crate::config::DbType;
use crate::core::traits::Dialect;

/// SQL Server dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct MssqlDialect;

impl MssqlDialect {
    /// Create a new SQL Server dialect instance.
    pub fn new() -> Self {
        Self
    }

    /// Statements sent before a batch's INSERTs.
    ///
    /// Always starts by rolling back whatever a previous, abandoned write
    /// left open on the pooled connection, so a retried batch never nests
    /// inside a stale transaction.
    pub fn write_prelude(&self, qualified: &str, within_tx: bool, identity: bool) -> String {
        let mut sql = String::from("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION; ");
        if within_tx {
            sql.push_str("SET XACT_ABORT ON; BEGIN TRANSACTION; ");
        }
        if identity {
            sql.push_str(&format!("SET IDENTITY_INSERT {} ON; ", qualified));
        }
        sql
    }
}

impl Dialect for MssqlDialect {
    fn name(&self) -> &'static str {
        "mssql"
    }

    fn db_type(&self) -> DbType {
        DbType::Sqlserver
    }

    fn quote_ident(&self, name: &str) -> String {
        format!("[{}]", name.replace(']', "]]"))
    }

    fn param_placeholder(&self, index: usize) -> String {
        format!("@P{}", index)
    }

    fn max_params(&self) -> usize {
        // TDS RPC parameter limit
        2_100
    }

    fn limit_clause(&self, limit: usize, offset: u64) -> String {
        format!("OFFSET {} ROWS FETCH NEXT {} ROWS ONLY", offset, limit)
    }

    fn fallback_order(&self) -> Option<&'static str> {
        Some("(SELECT NULL)")
    }

    fn sample_sql(&self, table: &crate::core::Table, limit: usize) -> String {
        format!(
            "SELECT TOP ({}) {} FROM {}",
            limit,
            self.column_list(&table.column_names()),
            self.qualify(&table.schema, &table.name)
        )
    }

    fn referential_action(&self, action: &str, _on_update: bool) -> Option<String> {
        // RESTRICT is spelled NO ACTION, which is the default
        match crate::core::normalize_action(action).as_str() {
            "CASCADE" => Some("CASCADE".to_string()),
            "SET NULL" => Some("SET NULL".to_string()),
            "SET DEFAULT" => Some("SET DEFAULT".to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, Table};
    use crate::dialect::CanonicalType;

    #[test]
    fn test_quote_ident() {
        let dialect = MssqlDialect::new();
        assert_eq!(dialect.quote_ident("users"), "[users]");
        assert_eq!(dialect.quote_ident("user]name"), "[user]]name]");
    }

    #[test]
    fn test_limit_clause() {
        let dialect = MssqlDialect::new();
        assert_eq!(
            dialect.limit_clause(500, 1000),
            "OFFSET 1000 ROWS FETCH NEXT 500 ROWS ONLY"
        );
    }

    #[test]
    fn test_sample_uses_top() {
        let mut t = Table::new("dbo", "users");
        t.columns.push(Column::new("id", "int", CanonicalType::Integer));
        assert_eq!(
            MssqlDialect::new().sample_sql(&t, 10),
            "SELECT TOP (10) [id] FROM [dbo].[users]"
        );
    }

    #[test]
    fn test_restrict_dropped() {
        let dialect = MssqlDialect::new();
        assert_eq!(dialect.referential_action("RESTRICT", false), None);
        assert_eq!(
            dialect.referential_action("CASCADE", true).as_deref(),
            Some("CASCADE")
        );
    }

    #[test]
    fn test_write_prelude_clears_stale_transaction() {
        let dialect = MssqlDialect::new();
        let plain = dialect.write_prelude("[dbo].[users]", false, false);
        assert_eq!(plain, "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION; ");

        let tx = dialect.write_prelude("[dbo].[users]", true, true);
        assert!(tx.starts_with("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION; "));
        let rollback = tx.find("ROLLBACK").unwrap();
        let begin = tx.find("BEGIN TRANSACTION").unwrap();
        assert!(rollback < begin);
        assert!(tx.ends_with("SET IDENTITY_INSERT [dbo].[users] ON; "));
    }
}
