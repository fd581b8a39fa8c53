//! Query gateway library.
//!
//! Mediates SQL access to one database (SQLite, PostgreSQL or MySQL): statements
//! are validated before they reach a pooled connection, reads are bounded or
//! streamed in batches, and upstream records are reconciled idempotently.

pub mod auth;
pub mod config;
#[macro_use]
pub mod db;
pub mod error;
pub mod models;
pub mod secrets;
pub mod sync;
pub mod tools;
pub mod transport;
pub mod workflow;

pub use config::Config;
pub use error::{DbError, DbResult};
