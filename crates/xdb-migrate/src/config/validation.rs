//! Configuration validation.
//!
//! Everything here runs before any network call.

use super::{Config, DbType, Endpoint, MigrationConfig};
use crate::error::{MigrateError, Result};

const SSL_MODES: &[&str] = &["disable", "prefer", "require", "verify-ca", "verify-full"];

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_endpoint(&config.source, "source")?;
    validate_endpoint(&config.target, "target")?;

    // Cannot migrate to the same database
    if config.source.r#type == config.target.r#type
        && config.source.host == config.target.host
        && config.source.port() == config.target.port()
        && config.source.database == config.target.database
        && config.source.service_name == config.target.service_name
        && config.source.default_schema() == config.target.default_schema()
    {
        return Err(MigrateError::Config(
            "source and target cannot be the same database".into(),
        ));
    }

    validate_migration(&config.migration)
}

/// Validate one endpoint. `label` prefixes field names in messages.
pub fn validate_endpoint(endpoint: &Endpoint, label: &str) -> Result<()> {
    if endpoint.host.trim().is_empty() {
        return Err(MigrateError::Config(format!("{}.host is required", label)));
    }
    if endpoint.user.trim().is_empty() {
        return Err(MigrateError::Config(format!("{}.user is required", label)));
    }
    if endpoint.port == Some(0) {
        return Err(MigrateError::Config(format!(
            "{}.port must be between 1 and 65535",
            label
        )));
    }

    match endpoint.r#type {
        DbType::Oracle => {
            let missing = endpoint
                .service_name
                .as_deref()
                .map(|s| s.trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(MigrateError::Config(format!(
                    "{}.service_name is required for oracle",
                    label
                )));
            }
        }
        DbType::Mysql | DbType::Postgresql | DbType::Sqlserver => {
            if endpoint.database.trim().is_empty() {
                return Err(MigrateError::Config(format!(
                    "{}.database is required",
                    label
                )));
            }
        }
    }

    if !SSL_MODES.contains(&endpoint.ssl_mode.to_lowercase().as_str()) {
        return Err(MigrateError::Config(format!(
            "{}.ssl_mode '{}' is invalid. Valid options: {}",
            label,
            endpoint.ssl_mode,
            SSL_MODES.join(", ")
        )));
    }

    Ok(())
}

/// Validate migration options.
pub fn validate_migration(migration: &MigrationConfig) -> Result<()> {
    if migration.batch_size == 0 {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.workers {
        return Err(MigrateError::Config(
            "migration.workers must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.pool_size {
        return Err(MigrateError::Config(
            "migration.pool_size must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.batch_timeout_secs {
        return Err(MigrateError::Config(
            "migration.batch_timeout_secs must be at least 1".into(),
        ));
    }
    if migration.tables.iter().any(|t| t.trim().is_empty()) {
        return Err(MigrateError::Config(
            "migration.tables must not contain empty names".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut source = Endpoint::new(DbType::Mysql, "localhost");
        source.database = "shop".to_string();
        source.user = "root".to_string();
        source.password = "password".to_string();

        let mut target = Endpoint::new(DbType::Postgresql, "localhost");
        target.database = "shop".to_string();
        target.user = "postgres".to_string();
        target.password = "password".to_string();

        Config {
            source,
            target,
            migration: MigrationConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_source_host() {
        let mut config = valid_config();
        config.source.host = "".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("source.host is required"));
    }

    #[test]
    fn test_oracle_requires_service_name() {
        let mut config = valid_config();
        config.target = Endpoint::new(DbType::Oracle, "ora.internal");
        config.target.user = "system".to_string();
        let err = validate(&config).unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
        assert!(err.to_string().contains("service_name"));

        config.target.service_name = Some("ORCLPDB1".to_string());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_same_database_rejected() {
        let mut config = valid_config();
        config.target = config.source.clone();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = valid_config();
        config.migration.batch_size = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_invalid_ssl_mode() {
        let mut config = valid_config();
        config.source.ssl_mode = "sometimes".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_endpoint_debug_redacts_password() {
        let mut config = valid_config();
        config.source.password = "super_secret_password_123".to_string();
        let debug_output = format!("{:?}", config.source);
        assert!(
            debug_output.contains("[REDACTED]"),
            "Debug output should contain [REDACTED]"
        );
        assert!(
            !debug_output.contains("super_secret_password_123"),
            "Debug output should not contain actual password value"
        );
    }

    #[test]
    fn test_password_never_serialized() {
        let mut config = valid_config();
        config.target.password = "hunter2".to_string();
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(!yaml.contains("hunter2"));
    }
}
