//! Oracle SQL dialect (Strategy pattern).
//!
//! Targets Oracle 12c and later (OFFSET/FETCH paging).

use crate::config::DbType;
use crate::core::traits::Dialect;
use crate::core::Table;

/// Oracle dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct OracleDialect;

impl OracleDialect {
    /// Create a new Oracle dialect instance.
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for OracleDialect {
    fn name(&self) -> &'static str {
        "oracle"
    }

    fn db_type(&self) -> DbType {
        DbType::Oracle
    }

    fn quote_ident(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn param_placeholder(&self, index: usize) -> String {
        format!(":{}", index)
    }

    fn max_params(&self) -> usize {
        65_535
    }

    fn limit_clause(&self, limit: usize, offset: u64) -> String {
        format!("OFFSET {} ROWS FETCH NEXT {} ROWS ONLY", offset, limit)
    }

    fn sample_sql(&self, table: &Table, limit: usize) -> String {
        format!(
            "SELECT {} FROM {} FETCH FIRST {} ROWS ONLY",
            self.column_list(&table.column_names()),
            self.qualify(&table.schema, &table.name),
            limit
        )
    }

    fn referential_action(&self, action: &str, on_update: bool) -> Option<String> {
        // No ON UPDATE clause and no SET DEFAULT
        if on_update {
            return None;
        }
        match crate::core::normalize_action(action).as_str() {
            "CASCADE" => Some("CASCADE".to_string()),
            "SET NULL" => Some("SET NULL".to_string()),
            _ => None,
        }
    }

    /// Oracle has no multi-row VALUES list; rows are bound one statement
    /// execution at a time through an array bind.
    fn insert_sql(&self, table: &Table, _rows: usize) -> String {
        let placeholders: Vec<String> = (1..=table.columns.len())
            .map(|i| self.param_placeholder(i))
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.qualify(&table.schema, &table.name),
            self.column_list(&table.column_names()),
            placeholders.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, ForeignKey};
    use crate::dialect::CanonicalType;

    fn items() -> Table {
        let mut t = Table::new("SHOP", "ITEMS");
        t.columns
            .push(Column::new("ID", "NUMBER", CanonicalType::Integer).not_null());
        t.columns
            .push(Column::new("ORDER_ID", "NUMBER", CanonicalType::Integer));
        t.primary_key = vec!["ID".into()];
        t
    }

    #[test]
    fn test_no_if_not_exists() {
        let sql = OracleDialect::new().create_table_sql(&items(), "SHOP", false);
        assert!(sql.starts_with("CREATE TABLE \"SHOP\".\"ITEMS\""));
        assert!(sql.contains("\"ID\" NUMBER(10) NOT NULL"));
    }

    #[test]
    fn test_fk_drops_on_update() {
        let fk = ForeignKey {
            name: "FK_ITEMS_ORDER".into(),
            columns: vec!["ORDER_ID".into()],
            ref_schema: "SHOP".into(),
            ref_table: "ORDERS".into(),
            ref_columns: vec!["ID".into()],
            on_delete: "SET NULL".into(),
            on_update: "CASCADE".into(),
        };
        let clause = OracleDialect::new().foreign_key_clause(&fk, "SHOP");
        assert!(clause.ends_with("ON DELETE SET NULL"));
    }

    #[test]
    fn test_single_row_insert() {
        assert_eq!(
            OracleDialect::new().insert_sql(&items(), 50),
            "INSERT INTO \"SHOP\".\"ITEMS\" (\"ID\", \"ORDER_ID\") VALUES (:1, :2)"
        );
    }

    #[test]
    fn test_sample_sql() {
        assert_eq!(
            OracleDialect::new().sample_sql(&items(), 10),
            "SELECT \"ID\", \"ORDER_ID\" FROM \"SHOP\".\"ITEMS\" FETCH FIRST 10 ROWS ONLY"
        );
    }
}
