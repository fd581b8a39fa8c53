//! Data models for the query gateway.
//!
//! This module re-exports all model types used throughout the application.

pub mod connection;
pub mod health;
pub mod query;
pub mod sync;
pub mod vector;

pub use connection::{ConnectionConfig, ConnectionConfigError, DatabaseType};
pub use health::{DependencyCheck, HealthSnapshot, HealthStatus};
pub use query::{
    ColumnMetadata, ExecutionDefaults, QueryOutput, QueryParam, QueryResult, RowBatch,
    StatementRequest,
};
pub use sync::{
    IncomingRecord, OutcomeStatus, SyncOutcome, SyncRecord, SyncRequest, SyncResponse, SyncStatus,
};
pub use vector::{VectorMatch, VectorSearchRequest, VectorSearchResponse};
