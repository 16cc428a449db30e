//! Helpers shared by the vendor drivers.
//!
//! - [`paging`]: bounded, page-at-a-time table scans
//! - [`tls`]: `ssl_mode` parsing and the PostgreSQL rustls connector

pub mod paging;
pub mod tls;

pub use paging::spawn_paged_reader;
pub use tls::{SslMode, TlsBuilder};
