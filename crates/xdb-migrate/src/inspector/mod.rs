//! Schema introspection and source/destination compatibility checks.
//!
//! Introspection fans out over tables with bounded concurrency; every
//! `describe_table` runs on its own registry lease, so the fan-out width is
//! also capped by the connection's pool size.

mod report;

pub use report::{compare, CompatibilityIssue, CompatibilityReport, IssueKind, Severity};

use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info};

use crate::core::traits::DialectAdapter;
use crate::core::{SchemaSnapshot, Table};
use crate::drivers::{mapper, DialectImpl};
use crate::error::{MigrateError, Result};
use crate::registry::ConnectionRegistry;

/// Captures schema snapshots through the registry.
pub struct SchemaInspector {
    registry: Arc<ConnectionRegistry>,
    concurrency: usize,
}

impl SchemaInspector {
    pub fn new(registry: Arc<ConnectionRegistry>, concurrency: usize) -> Self {
        Self {
            registry,
            concurrency: concurrency.max(1),
        }
    }

    /// Snapshot every table in every user schema of `connection_id`.
    pub async fn inspect(&self, connection_id: &str) -> Result<SchemaSnapshot> {
        let schemas = self.registry.lease(connection_id).await?.list_schemas().await?;
        let mut tables = Vec::new();
        for schema in &schemas {
            tables.extend(self.describe_all(connection_id, schema).await?);
        }
        info!(
            "Inspected {}: {} tables in {} schemas",
            connection_id,
            tables.len(),
            schemas.len()
        );
        Ok(SchemaSnapshot::new(connection_id, tables))
    }

    /// Snapshot every table in one schema. `None` means the connection's
    /// default schema.
    pub async fn inspect_schema(
        &self,
        connection_id: &str,
        schema: Option<&str>,
    ) -> Result<SchemaSnapshot> {
        let schema = match schema {
            Some(s) => s.to_string(),
            None => self.default_schema(connection_id).await?,
        };
        let tables = self.describe_all(connection_id, &schema).await?;
        Ok(SchemaSnapshot::new(connection_id, tables))
    }

    /// Snapshot the named tables of `schema`.
    ///
    /// With `skip_missing`, absent tables are left out of the snapshot
    /// instead of failing with `NotFound`.
    pub async fn inspect_tables(
        &self,
        connection_id: &str,
        schema: &str,
        names: &[String],
        skip_missing: bool,
    ) -> Result<SchemaSnapshot> {
        let described: Vec<Option<Table>> = stream::iter(names.iter().cloned())
            .map(|name| async move {
                let lease = self.registry.lease(connection_id).await?;
                match lease.describe_table(schema, &name).await {
                    Ok(t) => Ok(Some(t)),
                    Err(MigrateError::NotFound(_)) if skip_missing => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        let tables: Vec<Table> = described.into_iter().flatten().collect();
        debug!(
            "{}: described {}/{} tables in {}",
            connection_id,
            tables.len(),
            names.len(),
            schema
        );
        Ok(SchemaSnapshot::new(connection_id, tables))
    }

    /// Fresh snapshots of both sides plus their compatibility report.
    ///
    /// An empty `tables` selects every table in the source default schema.
    pub async fn compatibility(
        &self,
        source_id: &str,
        dest_id: &str,
        tables: &[String],
    ) -> Result<(SchemaSnapshot, SchemaSnapshot, CompatibilityReport)> {
        let (source_dialect, source_schema) = self.connection_shape(source_id).await?;
        let (dest_dialect, dest_schema) = self.connection_shape(dest_id).await?;

        let names = if tables.is_empty() {
            self.registry
                .lease(source_id)
                .await?
                .list_tables(&source_schema)
                .await?
        } else {
            tables.to_vec()
        };

        let source = self
            .inspect_tables(source_id, &source_schema, &names, false)
            .await?;
        let dest = self
            .inspect_tables(dest_id, &dest_schema, &names, true)
            .await?;

        let mapper = mapper(&source_dialect, &dest_dialect);
        let report = compare(&source, &dest, &names, &mapper)?;
        info!(
            "Compatibility {} -> {}: {} tables, {} errors, {} warnings",
            source_id,
            dest_id,
            report.tables.len(),
            report.errors().count(),
            report.warnings().count()
        );
        Ok((source, dest, report))
    }

    async fn describe_all(&self, connection_id: &str, schema: &str) -> Result<Vec<Table>> {
        let names = self
            .registry
            .lease(connection_id)
            .await?
            .list_tables(schema)
            .await?;
        let snapshot = self
            .inspect_tables(connection_id, schema, &names, true)
            .await?;
        Ok(snapshot.tables.into_values().collect())
    }

    async fn default_schema(&self, connection_id: &str) -> Result<String> {
        Ok(self
            .registry
            .lease(connection_id)
            .await?
            .default_schema()
            .to_string())
    }

    async fn connection_shape(&self, connection_id: &str) -> Result<(DialectImpl, String)> {
        let lease = self.registry.lease(connection_id).await?;
        Ok((lease.dialect().clone(), lease.default_schema().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbType;
    use crate::core::Column;
    use crate::dialect::CanonicalType;
    use crate::drivers::{AdapterImpl, MemoryAdapter};

    fn table(schema: &str, name: &str) -> Table {
        let mut t = Table::new(schema, name);
        t.columns
            .push(Column::new("id", "int", CanonicalType::Integer).not_null());
        t.columns
            .push(Column::new("label", "varchar", CanonicalType::VariableString(40)));
        t.primary_key = vec!["id".into()];
        t
    }

    async fn setup() -> (Arc<ConnectionRegistry>, MemoryAdapter, MemoryAdapter) {
        let registry = Arc::new(ConnectionRegistry::new());
        let src = MemoryAdapter::new(DbType::Mysql, "shop");
        let dst = MemoryAdapter::new(DbType::Postgresql, "public");
        for name in ["a", "b", "c"] {
            src.insert_table(table("shop", name), Vec::new());
        }
        src.insert_table(table("audit", "log"), Vec::new());
        dst.insert_table(table("public", "a"), Vec::new());
        registry
            .register("src", AdapterImpl::Memory(src.clone()), 2)
            .await
            .unwrap();
        registry
            .register("dst", AdapterImpl::Memory(dst.clone()), 2)
            .await
            .unwrap();
        (registry, src, dst)
    }

    #[tokio::test]
    async fn test_inspect_all_schemas() {
        let (registry, _, _) = setup().await;
        let inspector = SchemaInspector::new(registry, 4);
        let snapshot = inspector.inspect("src").await.unwrap();
        assert_eq!(snapshot.len(), 4);
        assert!(snapshot.find("audit.log").is_some());
        assert_eq!(snapshot.connection_id, "src");
    }

    #[tokio::test]
    async fn test_inspect_schema_defaults() {
        let (registry, _, _) = setup().await;
        let inspector = SchemaInspector::new(registry, 2);
        let snapshot = inspector.inspect_schema("src", None).await.unwrap();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.find("log").is_none());
    }

    #[tokio::test]
    async fn test_inspect_tables_missing() {
        let (registry, _, _) = setup().await;
        let inspector = SchemaInspector::new(registry, 2);
        let names = vec!["a".to_string(), "ghost".to_string()];
        let err = inspector
            .inspect_tables("src", "shop", &names, false)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::NotFound(_)));

        let snapshot = inspector
            .inspect_tables("src", "shop", &names, true)
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn test_compatibility_reports_missing_tables() {
        let (registry, _, _) = setup().await;
        let inspector = SchemaInspector::new(registry, 2);
        let (source, dest, report) = inspector.compatibility("src", "dst", &[]).await.unwrap();
        assert_eq!(source.len(), 3);
        assert_eq!(dest.len(), 1);
        assert_eq!(report.missing_tables, vec!["b", "c"]);
        assert!(!report.has_errors());
    }

    #[tokio::test]
    async fn test_unknown_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let inspector = SchemaInspector::new(registry, 2);
        assert!(matches!(
            inspector.inspect("nope").await,
            Err(MigrateError::NotFound(_))
        ));
    }
}
