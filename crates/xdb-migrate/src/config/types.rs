//! Configuration type definitions with resource-aware defaults.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

use crate::error::MigrateError;

/// System resource information for default worker sizing.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        Self {
            total_memory_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            cpu_cores: sys.cpus().len().max(1),
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Supported database vendors.
///
/// This is the explicit tag used to select a dialect implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    #[serde(alias = "mariadb")]
    Mysql,
    #[serde(alias = "postgres", alias = "pg")]
    Postgresql,
    Oracle,
    #[serde(alias = "mssql", alias = "sql_server")]
    Sqlserver,
}

impl DbType {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DbType::Mysql => "mysql",
            DbType::Postgresql => "postgresql",
            DbType::Oracle => "oracle",
            DbType::Sqlserver => "sqlserver",
        }
    }

    /// Vendor default listener port.
    pub fn default_port(&self) -> u16 {
        match self {
            DbType::Mysql => 3306,
            DbType::Postgresql => 5432,
            DbType::Oracle => 1521,
            DbType::Sqlserver => 1433,
        }
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbType {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(DbType::Mysql),
            "postgresql" | "postgres" | "pg" => Ok(DbType::Postgresql),
            "oracle" => Ok(DbType::Oracle),
            "sqlserver" | "mssql" | "sql_server" => Ok(DbType::Sqlserver),
            other => Err(MigrateError::Config(format!(
                "Unknown database type: '{}'. Supported types: mysql, postgresql, oracle, sqlserver",
                other
            ))),
        }
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database endpoint.
    pub source: Endpoint,

    /// Destination database endpoint.
    pub target: Endpoint,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

/// Connection parameters for one database.
///
/// Credentials only live in memory: the password is skipped on
/// serialization and redacted in `Debug` output.
#[derive(Clone, Serialize, Deserialize)]
pub struct Endpoint {
    /// Database vendor.
    pub r#type: DbType,

    /// Database host.
    pub host: String,

    /// Port. Defaults to the vendor port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Database name (not used by Oracle).
    #[serde(default)]
    pub database: String,

    /// Username.
    #[serde(default)]
    pub user: String,

    /// Password.
    #[serde(default, skip_serializing)]
    pub password: String,

    /// Oracle service name. Mandatory for Oracle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    /// Schema to inspect/migrate. Defaults per vendor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// TLS mode: disable, prefer, require, verify-full (default: prefer).
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,

    /// Accept the server certificate without verification (SQL Server).
    #[serde(default)]
    pub trust_server_cert: bool,

    /// Connect timeout in seconds (default: 30).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port())
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("service_name", &self.service_name)
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

impl Endpoint {
    /// Create an endpoint with vendor defaults for everything but the host.
    pub fn new(db_type: DbType, host: impl Into<String>) -> Self {
        Self {
            r#type: db_type,
            host: host.into(),
            port: None,
            database: String::new(),
            user: String::new(),
            password: String::new(),
            service_name: None,
            schema: None,
            ssl_mode: default_ssl_mode(),
            trust_server_cert: false,
            connect_timeout_secs: default_connect_timeout(),
        }
    }

    /// Effective port.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.r#type.default_port())
    }

    /// Effective schema: explicit value or the vendor's default namespace.
    pub fn default_schema(&self) -> String {
        if let Some(schema) = &self.schema {
            return schema.clone();
        }
        match self.r#type {
            DbType::Mysql => self.database.clone(),
            DbType::Postgresql => "public".to_string(),
            DbType::Oracle => self.user.to_uppercase(),
            DbType::Sqlserver => "dbo".to_string(),
        }
    }

    /// Short description for logs (never includes credentials).
    pub fn describe(&self) -> String {
        match self.r#type {
            DbType::Oracle => format!(
                "oracle://{}:{}/{}",
                self.host,
                self.port(),
                self.service_name.as_deref().unwrap_or_default()
            ),
            other => format!("{}://{}:{}/{}", other, self.host, self.port(), self.database),
        }
    }
}

/// Migration behavior configuration.
///
/// Tuning fields use `Option<T>` to distinguish "not set" (use the
/// resource-aware default) from "explicitly set".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Tables to migrate. Empty means every table in the source schema.
    #[serde(default)]
    pub tables: Vec<String>,

    /// Create missing destination tables (default: true).
    #[serde(default = "default_true")]
    pub create_tables: bool,

    /// Clear existing destination tables before loading (default: false).
    #[serde(default)]
    pub truncate_tables: bool,

    /// Create indexes after each table is loaded (default: true).
    #[serde(default = "default_true")]
    pub include_indexes: bool,

    /// Commit each batch in its own transaction (default: true).
    #[serde(default = "default_true")]
    pub use_transactions: bool,

    /// Rows per batch (default: 1000).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Proceed despite warning-level compatibility issues.
    #[serde(default)]
    pub acknowledge_warnings: bool,

    /// Proceed despite error-level compatibility issues.
    #[serde(default)]
    pub override_errors: bool,

    /// Concurrent table workers. Defaults to min(cpu cores, 4).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Handles per connection in the registry. Defaults to workers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<usize>,

    /// Retries for a transient batch failure (default: 3).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// First retry delay in milliseconds (default: 500).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_base_delay_ms: Option<u64>,

    /// Backoff ceiling in milliseconds (default: 30000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_max_delay_ms: Option<u64>,

    /// Timeout for a single batch read or write in seconds (default: 300).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_timeout_secs: Option<u64>,

    /// Concurrent table descriptions during inspection (default: 4).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inspect_concurrency: Option<usize>,

    /// Append terminal job records to this JSON-lines file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_file: Option<PathBuf>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            tables: Vec::new(),
            create_tables: true,
            truncate_tables: false,
            include_indexes: true,
            use_transactions: true,
            batch_size: default_batch_size(),
            acknowledge_warnings: false,
            override_errors: false,
            workers: None,
            pool_size: None,
            max_retries: None,
            retry_base_delay_ms: None,
            retry_max_delay_ms: None,
            batch_timeout_secs: None,
            inspect_concurrency: None,
            history_file: None,
        }
    }
}

impl MigrationConfig {
    /// Fill unset tuning values from detected resources.
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        if self.workers.is_none() {
            self.workers = Some(resources.cpu_cores.clamp(1, 4));
        }
        if self.pool_size.is_none() {
            self.pool_size = self.workers;
        }

        info!(
            "Auto-tuned config: workers={}, pool_size={}, batch_size={}",
            self.get_workers(),
            self.get_pool_size(),
            self.batch_size
        );

        self
    }

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(2)
    }

    pub fn get_pool_size(&self) -> usize {
        self.pool_size.unwrap_or_else(|| self.get_workers())
    }

    pub fn get_max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(3)
    }

    pub fn get_retry_base_delay_ms(&self) -> u64 {
        self.retry_base_delay_ms.unwrap_or(500)
    }

    pub fn get_retry_max_delay_ms(&self) -> u64 {
        self.retry_max_delay_ms.unwrap_or(30_000)
    }

    pub fn get_batch_timeout_secs(&self) -> u64 {
        self.batch_timeout_secs.unwrap_or(300)
    }

    pub fn get_inspect_concurrency(&self) -> usize {
        self.inspect_concurrency.unwrap_or(4)
    }
}

// Default value functions for serde
fn default_ssl_mode() -> String {
    "prefer".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_batch_size() -> usize {
    1000
}

fn default_true() -> bool {
    true
}
