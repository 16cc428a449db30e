//! MySQL/MariaDB driver.
//!
//! - [`MysqlDialect`]: SQL syntax and type tables
//! - [`MysqlAdapter`]: connection handle (SQLx reads, mysql_async writes)
//!
//! # Supported Versions
//!
//! - MySQL 5.7+, 8.0+
//! - MariaDB 10.2+

mod adapter;
mod dialect;
mod types;

pub use adapter::MysqlAdapter;
pub use dialect::MysqlDialect;
