//! Schema and metadata types for database tables, columns, indexes, and constraints.
//!
//! These types provide a database-agnostic representation of schema metadata
//! used throughout inspection and migration.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dialect::{CanonicalType, CanonicalTypeInfo};

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,

    /// Native data type as reported by the catalog.
    pub data_type: String,

    /// Canonical type derived from the native type.
    pub canonical: CanonicalType,

    /// Set when the native type could not be represented exactly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_warning: Option<String>,

    /// Maximum character length (-1 for MAX/unbounded, 0 if not applicable).
    pub max_length: i32,

    /// Numeric precision.
    pub precision: i32,

    /// Numeric scale.
    pub scale: i32,

    /// Whether the column allows NULL.
    pub is_nullable: bool,

    /// Whether the column is part of the primary key.
    pub is_primary_key: bool,

    /// Whether the column is an identity/auto-increment column.
    pub is_identity: bool,

    /// Default expression as reported by the catalog.
    pub default_expr: Option<String>,

    /// Ordinal position (1-based).
    pub ordinal_pos: i32,
}

impl Column {
    /// Create a nullable, non-key column.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, canonical: CanonicalType) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            canonical,
            canonical_warning: None,
            max_length: 0,
            precision: 0,
            scale: 0,
            is_nullable: true,
            is_primary_key: false,
            is_identity: false,
            default_expr: None,
            ordinal_pos: 0,
        }
    }

    /// Create a column from a catalog mapping, keeping any loss it reported.
    pub fn mapped(name: impl Into<String>, data_type: impl Into<String>, info: CanonicalTypeInfo) -> Self {
        let mut col = Self::new(name, data_type, info.canonical_type);
        col.canonical_warning = info.warning;
        col
    }

    /// Mark the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.is_nullable = false;
        self
    }

    /// Default expression if it is a plain literal that every dialect accepts.
    ///
    /// Function calls and sequence defaults are vendor-specific and dropped.
    pub fn portable_default(&self) -> Option<&str> {
        let expr = self.default_expr.as_deref()?.trim();
        let unwrapped = expr.trim_start_matches('(').trim_end_matches(')');
        let is_number = !unwrapped.is_empty()
            && unwrapped
                .trim_start_matches('-')
                .chars()
                .all(|c| c.is_ascii_digit() || c == '.');
        let is_string = unwrapped.len() >= 2
            && unwrapped.starts_with('\'')
            && unwrapped.ends_with('\'')
            && !unwrapped.contains("::");
        if is_number || is_string {
            Some(unwrapped)
        } else {
            None
        }
    }
}

/// Table metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    /// Schema name.
    pub schema: String,

    /// Table name.
    pub name: String,

    /// Column definitions, in ordinal order.
    pub columns: Vec<Column>,

    /// Primary key column names, in key order.
    pub primary_key: Vec<String>,

    /// Non-primary key indexes.
    #[serde(default)]
    pub indexes: Vec<Index>,

    /// Foreign key constraints.
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

impl Table {
    /// Create an empty table descriptor.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Get the fully qualified table name.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Check if the table has a primary key.
    pub fn has_pk(&self) -> bool {
        !self.primary_key.is_empty()
    }

    /// Look up a column by name (case-insensitive).
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Column names in ordinal order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// The single integer primary key column, if keyset pagination applies.
    pub fn keyset_column(&self) -> Option<&Column> {
        if self.primary_key.len() != 1 {
            return None;
        }
        self.column(&self.primary_key[0])
            .filter(|c| c.canonical.is_integer())
    }

    /// Columns to order by for stable OFFSET paging: the primary key, or
    /// every column when there is none.
    pub fn order_columns(&self) -> Vec<String> {
        if self.has_pk() {
            self.primary_key.clone()
        } else {
            self.columns
                .iter()
                .filter(|c| !matches!(c.canonical, CanonicalType::Binary | CanonicalType::Text))
                .map(|c| c.name.clone())
                .take(8)
                .collect()
        }
    }

    /// Mark `is_primary_key` on columns listed in `primary_key`.
    pub fn sync_primary_key_flags(&mut self) {
        let pk = self.primary_key.clone();
        for col in &mut self.columns {
            col.is_primary_key = pk.iter().any(|k| k.eq_ignore_ascii_case(&col.name));
        }
    }
}

/// Index metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    /// Index name.
    pub name: String,

    /// Indexed column names, in key order.
    pub columns: Vec<String>,

    /// Whether the index is unique.
    pub is_unique: bool,
}

/// Foreign key metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Constraint name.
    pub name: String,

    /// Referencing columns.
    pub columns: Vec<String>,

    /// Referenced schema.
    pub ref_schema: String,

    /// Referenced table.
    pub ref_table: String,

    /// Referenced columns.
    pub ref_columns: Vec<String>,

    /// ON DELETE action.
    pub on_delete: String,

    /// ON UPDATE action.
    pub on_update: String,
}

impl ForeignKey {
    /// Fully qualified referenced table name.
    pub fn ref_full_name(&self) -> String {
        format!("{}.{}", self.ref_schema, self.ref_table)
    }
}

/// Immutable capture of a connection's schema at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// Registry id of the inspected connection.
    pub connection_id: String,

    /// When the snapshot was taken.
    pub captured_at: DateTime<Utc>,

    /// Tables keyed by `schema.table`.
    pub tables: BTreeMap<String, Table>,
}

impl SchemaSnapshot {
    /// Build a snapshot from described tables.
    pub fn new(connection_id: impl Into<String>, tables: Vec<Table>) -> Self {
        Self {
            connection_id: connection_id.into(),
            captured_at: Utc::now(),
            tables: tables.into_iter().map(|t| (t.full_name(), t)).collect(),
        }
    }

    /// Find a table by qualified name, or by bare name when that is unambiguous.
    /// Matching is case-insensitive.
    pub fn find(&self, name: &str) -> Option<&Table> {
        if let Some(t) = self.tables.get(name) {
            return Some(t);
        }
        let mut matches = self.tables.values().filter(|t| {
            t.full_name().eq_ignore_ascii_case(name) || t.name.eq_ignore_ascii_case(name)
        });
        let first = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some(first)
    }

    /// Number of tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether the snapshot has no tables.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> Table {
        let mut t = Table::new("shop", "orders");
        t.columns.push(Column::new("id", "int", CanonicalType::Integer).not_null());
        t.columns.push(Column::new(
            "total",
            "decimal",
            CanonicalType::Decimal {
                precision: 10,
                scale: 2,
            },
        ));
        t.primary_key = vec!["id".to_string()];
        t.sync_primary_key_flags();
        t
    }

    #[test]
    fn test_table_full_name_and_keyset() {
        let t = orders();
        assert_eq!(t.full_name(), "shop.orders");
        assert!(t.has_pk());
        assert!(t.columns[0].is_primary_key);
        assert_eq!(t.keyset_column().map(|c| c.name.as_str()), Some("id"));
        assert_eq!(t.order_columns(), vec!["id"]);
    }

    #[test]
    fn test_keyset_requires_integer_pk() {
        let mut t = orders();
        t.columns[0].canonical = CanonicalType::VariableString(36);
        assert!(t.keyset_column().is_none());
    }

    #[test]
    fn test_portable_default() {
        let mut col = Column::new("status", "varchar", CanonicalType::VariableString(10));
        col.default_expr = Some("'new'".to_string());
        assert_eq!(col.portable_default(), Some("'new'"));
        col.default_expr = Some("((0))".to_string());
        assert_eq!(col.portable_default(), Some("0"));
        col.default_expr = Some("nextval('orders_id_seq'::regclass)".to_string());
        assert_eq!(col.portable_default(), None);
        col.default_expr = Some("'x'::character varying".to_string());
        assert_eq!(col.portable_default(), None);
    }

    #[test]
    fn test_snapshot_find() {
        let mut other = orders();
        other.schema = "archive".to_string();
        let snapshot = SchemaSnapshot::new("conn-1", vec![orders(), other]);
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.find("shop.orders").is_some());
        // Bare name is ambiguous across two schemas.
        assert!(snapshot.find("orders").is_none());

        let snapshot = SchemaSnapshot::new("conn-1", vec![orders()]);
        assert_eq!(snapshot.find("ORDERS").map(|t| t.name.as_str()), Some("orders"));
    }
}
