//! # xdb-migrate
//!
//! Cross-vendor relational migration engine.
//!
//! Moves schema and data between MySQL, PostgreSQL, Oracle and SQL Server
//! with:
//!
//! - **Connection registry** with per-connection handle leases
//! - **Schema inspection** and a compatibility report before any data moves
//! - **Canonical type mapping** between every pair of vendors
//! - **Dependency-ordered loads** with deferred foreign keys
//! - **Bounded parallelism** with per-batch transactions, retry and backoff
//! - **Progress events** on a broadcast bus and a persistent job history
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use xdb_migrate::{ConnectionRegistry, ConnectionRequest, Config, JobRequest, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> xdb_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let registry = Arc::new(ConnectionRegistry::new());
//!     let pool = config.migration.get_pool_size();
//!     for (id, endpoint) in [("source", &config.source), ("target", &config.target)] {
//!         registry
//!             .open(ConnectionRequest::new(endpoint.clone()).with_id(id).with_pool_size(pool))
//!             .await?;
//!     }
//!     let orchestrator = Orchestrator::from_config(registry, &config.migration);
//!     let record = orchestrator
//!         .run(JobRequest::new("source", "target"))
//!         .await?;
//!     println!("Migrated {} rows", record.rows_migrated);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod dialect;
pub mod drivers;
pub mod error;
pub mod history;
pub mod inspector;
pub mod orchestrator;
pub mod progress;
pub mod registry;

// Re-exports for convenient access
pub use config::{Config, DbType, Endpoint, MigrationConfig};
pub use core::{Column, ForeignKey, Index, Row, SchemaSnapshot, SqlValue, Table};
pub use dialect::CanonicalType;
pub use drivers::{AdapterImpl, MemoryAdapter};
pub use error::{MigrateError, Result};
pub use history::{HistorySink, JsonFileHistory, MemoryHistory, NoopHistory};
pub use inspector::{CompatibilityReport, SchemaInspector};
pub use orchestrator::{
    JobOptions, JobRecord, JobRequest, JobStatus, JobTicket, MigrationPlan, Orchestrator,
    RetryPolicy, TaskStatus, ValidatedJob,
};
pub use progress::{BusMessage, ProgressBus, ProgressEvent};
pub use registry::{ConnectionInfo, ConnectionRegistry, ConnectionRequest, Lease};
