//! Request handlers behind the HTTP routes.
//!
//! - `query`: validated statement execution and streaming reads
//! - `sql_validator`: statement screening before any connection is used
//! - `vector_search`: similarity search over stored embeddings
//! - `health`: bounded database health probes

pub mod health;
pub mod query;
pub mod sql_validator;
pub mod vector_search;

pub use health::HealthReporter;
pub use query::{BatchReceiver, QueryHandler, RetryPolicy};
pub use sql_validator::{RejectionRule, StatementValidator, Verdict};
pub use vector_search::{SearchResult, VectorSearch};
