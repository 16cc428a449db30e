//! MySQL/MariaDB SQL dialect (Strategy pattern).
//!
//! Provides MySQL-specific identifier quoting, paging, and DDL options.

use crate::config::DbType;
use crate::core::traits::Dialect;

/// MySQL/MariaDB dialect implementation.
///
/// Compatible with MySQL 5.7+, 8.0+, and MariaDB 10.2+.
#[derive(Debug, Clone, Default)]
pub struct MysqlDialect;

impl MysqlDialect {
    /// Create a new MySQL dialect instance.
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for MysqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn db_type(&self) -> DbType {
        DbType::Mysql
    }

    fn quote_ident(&self, name: &str) -> String {
        // Backticks inside a name are doubled
        format!("`{}`", name.replace('`', "``"))
    }

    fn param_placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn max_params(&self) -> usize {
        65_535
    }

    fn supports_if_not_exists(&self) -> bool {
        true
    }

    fn table_options(&self) -> &'static str {
        "ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"
    }

    fn limit_clause(&self, limit: usize, offset: u64) -> String {
        if offset == 0 {
            format!("LIMIT {}", limit)
        } else {
            format!("LIMIT {} OFFSET {}", limit, offset)
        }
    }

    fn referential_action(&self, action: &str, _on_update: bool) -> Option<String> {
        // InnoDB parses SET DEFAULT but rejects it at table creation
        match crate::core::normalize_action(action).as_str() {
            "CASCADE" => Some("CASCADE".to_string()),
            "SET NULL" => Some("SET NULL".to_string()),
            "RESTRICT" => Some("RESTRICT".to_string()),
            _ => None,
        }
    }

    fn create_index_sql(
        &self,
        table: &crate::core::Table,
        idx: &crate::core::Index,
        schema: &str,
    ) -> String {
        // Prefix length keeps TEXT/BLOB columns indexable
        let cols = idx
            .columns
            .iter()
            .map(|c| {
                let quoted = self.quote_ident(c);
                match table.column(c).map(|col| &col.canonical) {
                    Some(crate::dialect::CanonicalType::Text)
                    | Some(crate::dialect::CanonicalType::Binary) => format!("{}(255)", quoted),
                    _ => quoted,
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if idx.is_unique { "UNIQUE " } else { "" },
            self.quote_ident(&idx.name),
            self.qualify(schema, &table.name),
            cols
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, Index, Table};
    use crate::dialect::CanonicalType;

    #[test]
    fn test_quote_ident() {
        let dialect = MysqlDialect::new();
        assert_eq!(dialect.quote_ident("users"), "`users`");
        assert_eq!(dialect.quote_ident("user`name"), "`user``name`");
        assert_eq!(dialect.qualify("shop", "orders"), "`shop`.`orders`");
    }

    #[test]
    fn test_limit_clause() {
        let dialect = MysqlDialect::new();
        assert_eq!(dialect.limit_clause(100, 0), "LIMIT 100");
        assert_eq!(dialect.limit_clause(100, 200), "LIMIT 100 OFFSET 200");
    }

    #[test]
    fn test_set_default_dropped() {
        let dialect = MysqlDialect::new();
        assert_eq!(dialect.referential_action("SET_DEFAULT", false), None);
        assert_eq!(
            dialect.referential_action("set null", false).as_deref(),
            Some("SET NULL")
        );
    }

    #[test]
    fn test_text_index_gets_prefix() {
        let mut t = Table::new("shop", "notes");
        t.columns.push(Column::new("body", "text", CanonicalType::Text));
        let idx = Index {
            name: "ix_notes_body".into(),
            columns: vec!["body".into()],
            is_unique: false,
        };
        let sql = MysqlDialect::new().create_index_sql(&t, &idx, "shop");
        assert_eq!(
            sql,
            "CREATE INDEX `ix_notes_body` ON `shop`.`notes` (`body`(255))"
        );
    }
}
