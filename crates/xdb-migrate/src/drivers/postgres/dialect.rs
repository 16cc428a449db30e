//! PostgreSQL SQL dialect (Strategy pattern).

use crate::config::DbType;
use crate::core::traits::Dialect;

/// PostgreSQL dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    /// Create a new PostgreSQL dialect instance.
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn db_type(&self) -> DbType {
        DbType::Postgresql
    }

    fn quote_ident(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn param_placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn max_params(&self) -> usize {
        65_535
    }

    fn supports_if_not_exists(&self) -> bool {
        true
    }

    fn limit_clause(&self, limit: usize, offset: u64) -> String {
        if offset == 0 {
            format!("LIMIT {}", limit)
        } else {
            format!("LIMIT {} OFFSET {}", limit, offset)
        }
    }

    fn create_index_sql(
        &self,
        table: &crate::core::Table,
        idx: &crate::core::Index,
        schema: &str,
    ) -> String {
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if idx.is_unique { "UNIQUE " } else { "" },
            self.quote_ident(&idx.name),
            self.qualify(schema, &table.name),
            self.column_list(&idx.columns)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        let dialect = PostgresDialect::new();
        assert_eq!(dialect.quote_ident("users"), "\"users\"");
        assert_eq!(dialect.quote_ident("user\"name"), "\"user\"\"name\"");
    }

    #[test]
    fn test_param_placeholder() {
        let dialect = PostgresDialect::new();
        assert_eq!(dialect.param_placeholder(1), "$1");
        assert_eq!(dialect.param_placeholder(10), "$10");
    }

    #[test]
    fn test_referential_actions() {
        let dialect = PostgresDialect::new();
        assert_eq!(
            dialect.referential_action("SET_DEFAULT", true).as_deref(),
            Some("SET DEFAULT")
        );
        assert_eq!(dialect.referential_action("NO_ACTION", false), None);
    }
}
