//! Microsoft SQL Server driver.
//!
//! - [`MssqlDialect`]: SQL syntax and type tables
//! - [`MssqlAdapter`]: connection handle (Tiberius + bb8)

mod adapter;
mod dialect;
mod types;

pub use adapter::MssqlAdapter;
pub use dialect::MssqlDialect;
