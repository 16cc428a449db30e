//! Error types for the migration library.

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Malformed or incomplete endpoint/options. Always raised before any I/O.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network or authentication failure talking to a database.
    #[error("Connection error: {message}\n  Context: {context}")]
    Connection { message: String, context: String },

    /// Referenced connection, schema, table or job does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Blocking compatibility issues that the caller did not override.
    #[error("Incompatible schema: {0}")]
    IncompatibleSchema(String),

    /// Vendor-reported failure while reading rows.
    #[error("Read failed for table {table}: {message}")]
    Read {
        table: String,
        message: String,
        transient: bool,
    },

    /// Vendor-reported failure while writing rows.
    #[error("Write failed for table {table}: {message}")]
    Write {
        table: String,
        message: String,
        transient: bool,
    },

    /// CREATE TABLE / CREATE INDEX / TRUNCATE failed.
    #[error("DDL failed for table {table}: {message}")]
    Ddl { table: String, message: String },

    /// Post-load row count mismatch.
    #[error("Verification failed for table {table}: expected {expected} rows, migrated {actual}")]
    Verification {
        table: String,
        expected: i64,
        actual: i64,
    },

    /// A table this one references failed, so it was never attempted.
    #[error("Table {table} skipped: dependency {dependency} did not load")]
    DependencyFailed { table: String, dependency: String },

    /// A single batch operation exceeded its timeout.
    #[error("Timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, API request, etc.)
    #[error("Migration cancelled")]
    Cancelled,

    /// A background task died without reporting a result.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MigrateError {
    /// Create a Connection error with context about where it occurred
    pub fn connection(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        MigrateError::Connection {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Read error
    pub fn read(table: impl Into<String>, message: impl Into<String>, transient: bool) -> Self {
        MigrateError::Read {
            table: table.into(),
            message: message.into(),
            transient,
        }
    }

    /// Create a Write error
    pub fn write(table: impl Into<String>, message: impl Into<String>, transient: bool) -> Self {
        MigrateError::Write {
            table: table.into(),
            message: message.into(),
            transient,
        }
    }

    /// Create a DDL error
    pub fn ddl(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Ddl {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Whether the retry policy may try the failed operation again.
    pub fn is_transient(&self) -> bool {
        match self {
            MigrateError::Connection { .. } | MigrateError::Timeout { .. } => true,
            MigrateError::Read { transient, .. } | MigrateError::Write { transient, .. } => {
                *transient
            }
            _ => false,
        }
    }

    /// Short machine-friendly kind, used in history records and JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            MigrateError::Config(_) => "config",
            MigrateError::Connection { .. } => "connection",
            MigrateError::NotFound(_) => "not_found",
            MigrateError::IncompatibleSchema(_) => "incompatible_schema",
            MigrateError::Read { .. } => "read",
            MigrateError::Write { .. } => "write",
            MigrateError::Ddl { .. } => "ddl",
            MigrateError::Verification { .. } => "verification",
            MigrateError::DependencyFailed { .. } => "dependency_failed",
            MigrateError::Timeout { .. } => "timeout",
            MigrateError::Io(_) => "io",
            MigrateError::Yaml(_) => "yaml",
            MigrateError::Json(_) => "json",
            MigrateError::Cancelled => "cancelled",
            MigrateError::Internal(_) => "internal",
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => 2,
            MigrateError::IncompatibleSchema(_) => 3,
            MigrateError::Cancelled => 4,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MigrateError::connection("reset by peer", "ping").is_transient());
        assert!(MigrateError::Timeout {
            operation: "write batch".into(),
            seconds: 30
        }
        .is_transient());
        assert!(MigrateError::write("orders", "deadlock", true).is_transient());
        assert!(!MigrateError::write("orders", "duplicate key", false).is_transient());
        assert!(!MigrateError::Config("batch_size".into()).is_transient());
        assert!(!MigrateError::ddl("orders", "syntax").is_transient());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::Config("x".into()).exit_code(), 2);
        assert_eq!(MigrateError::IncompatibleSchema("x".into()).exit_code(), 3);
        assert_eq!(MigrateError::Cancelled.exit_code(), 4);
        assert_eq!(MigrateError::NotFound("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_format_detailed_includes_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.yaml");
        let err = MigrateError::from(io);
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: IO error"));
        assert_eq!(err.kind(), "io");
    }
}
