//! Core abstractions for database-agnostic migration.
//!
//! - [`schema`]: table, column, index and constraint metadata
//! - [`value`]: runtime SQL values and row batches
//! - [`traits`]: the [`Dialect`] syntax strategy and the [`DialectAdapter`]
//!   capability interface implemented by every driver

pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{Column, ForeignKey, Index, SchemaSnapshot, Table};
pub use traits::{normalize_action, Dialect, DialectAdapter, Page};
pub use value::{Batch, Row, SqlValue};
