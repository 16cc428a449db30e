//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;
pub use validation::{validate_endpoint, validate_migration};

use crate::error::Result;
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Apply resource-aware defaults to unset tuning values.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }
}

impl Endpoint {
    /// Validate vendor-mandatory fields.
    pub fn validate(&self) -> Result<()> {
        validate_endpoint(self, self.r#type.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
source:
  type: mariadb
  host: db1
  database: shop
  user: app
  password: secret
target:
  type: mssql
  host: db2
  database: shop
  user: sa
  password: secret
  trust_server_cert: true
migration:
  tables: [customers, orders]
  batch_size: 500
  workers: 2
"#;

    #[test]
    fn test_from_yaml_defaults() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.source.r#type, DbType::Mysql);
        assert_eq!(config.target.r#type, DbType::Sqlserver);
        assert_eq!(config.source.port(), 3306);
        assert_eq!(config.target.port(), 1433);
        assert_eq!(config.target.default_schema(), "dbo");
        assert_eq!(config.source.default_schema(), "shop");
        assert_eq!(config.migration.batch_size, 500);
        assert!(config.migration.create_tables);
        assert!(config.migration.use_transactions);
        assert!(!config.migration.truncate_tables);
        assert_eq!(config.migration.get_workers(), 2);
        assert_eq!(config.migration.get_pool_size(), 2);
        assert_eq!(config.migration.get_max_retries(), 3);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.migration.tables, vec!["customers", "orders"]);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let yaml = SAMPLE.replace("type: mariadb", "type: sqlite");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_db_type_from_str() {
        assert_eq!("pg".parse::<DbType>().unwrap(), DbType::Postgresql);
        assert_eq!("SQLServer".parse::<DbType>().unwrap(), DbType::Sqlserver);
        assert!("db2".parse::<DbType>().is_err());
    }

    #[test]
    fn test_auto_tuning_keeps_explicit_values() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let resources = SystemResources {
            total_memory_gb: 16.0,
            cpu_cores: 16,
        };
        let tuned = config.migration.with_auto_tuning(&resources);
        assert_eq!(tuned.get_workers(), 2);

        let tuned = MigrationConfig::default().with_auto_tuning(&resources);
        assert_eq!(tuned.get_workers(), 4);
        assert_eq!(tuned.get_pool_size(), 4);
    }
}
