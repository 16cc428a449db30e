//! PostgreSQL driver.
//!
//! - [`PostgresDialect`]: SQL syntax and type tables
//! - [`PostgresAdapter`]: connection handle (tokio-postgres + deadpool,
//!   binary COPY writes)

mod adapter;
mod dialect;
mod types;

pub use adapter::PostgresAdapter;
pub use dialect::PostgresDialect;
