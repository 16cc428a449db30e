//! Oracle driver.
//!
//! - [`OracleDialect`]: SQL syntax and type tables (always available)
//! - [`OracleAdapter`]: connection handle, behind the `oracle` feature
//!   because it loads the Oracle client libraries at runtime

#[cfg(feature = "oracle")]
mod adapter;
mod dialect;
mod types;

#[cfg(feature = "oracle")]
pub use adapter::OracleAdapter;
pub use dialect::OracleDialect;
