//! Record synchronization.
//!
//! - `hash`: canonical content hashing
//! - `store`: SQL for the tracking and target tables
//! - `reconciler`: per-record idempotent apply and resumable batches

pub mod hash;
pub mod reconciler;
pub mod store;

pub use hash::content_hash;
pub use reconciler::{BatchReport, DEFAULT_CHUNK_SIZE, Decision, Reconciler, decide};
pub use store::SyncStatements;
