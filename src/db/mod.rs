//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Driver connections behind the [`Connector`] seam
//! - Bounded connection pooling
//! - Statement execution and batch streaming
//! - Type mappings
//! - Database dispatch macros for reducing code duplication

#[macro_use]
pub mod macros;
pub mod connection;
pub mod executor;
pub mod pool;
pub mod types;

pub use connection::{Connector, DbConnection, SqlxConnector};
pub use executor::{QueryExecutor, RowBatchStream};
pub use pool::{Backoff, ConnectionMeta, ConnectionPool, PoolSettings, PoolStats, PooledConnection};
