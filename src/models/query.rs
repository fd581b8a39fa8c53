//! Query-related data models.
//!
//! This module defines types for SQL statement requests and results.

use crate::config::{
    DEFAULT_QUERY_TIMEOUT_SECS, DEFAULT_ROW_LIMIT, MAX_QUERY_TIMEOUT_SECS, MAX_ROW_LIMIT,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    Null,
    Bool(bool),
    /// Stored as i64 for maximum range
    Int(i64),
    Float(f64),
    String(String),
}

impl QueryParam {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
        }
    }
}

fn default_read_only() -> bool {
    true
}

/// A statement submitted for validation and execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementRequest {
    #[serde(alias = "sql")]
    pub query: String,
    #[serde(default)]
    pub params: Vec<QueryParam>,
    /// Default: 100, max: 10000
    #[serde(default)]
    pub max_rows: Option<u32>,
    /// Declared intent. Default: true
    #[serde(default = "default_read_only")]
    pub read_only: bool,
    /// Permits destructive statements. Default: false
    #[serde(default)]
    pub elevated: bool,
    /// Default: 30s, max: 300s
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Originating caller, filled in by the transport
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
}

impl StatementRequest {
    /// Create a read-only request with default options.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            params: Vec::new(),
            max_rows: None,
            read_only: true,
            elevated: false,
            timeout_ms: None,
            caller: None,
        }
    }

    pub fn with_param(mut self, param: QueryParam) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_max_rows(mut self, max_rows: u32) -> Self {
        self.max_rows = Some(max_rows);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Declare write intent.
    pub fn writable(mut self) -> Self {
        self.read_only = false;
        self
    }

    pub fn elevated(mut self) -> Self {
        self.elevated = true;
        self
    }

    /// Get the effective row limit (with bounds checking).
    pub fn effective_limit(&self, default: u32) -> u32 {
        self.max_rows
            .map(|l| l.clamp(1, MAX_ROW_LIMIT))
            .unwrap_or(default.min(MAX_ROW_LIMIT))
    }

    /// Get the effective timeout (with bounds checking).
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        let max = Duration::from_secs(MAX_QUERY_TIMEOUT_SECS);
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default)
            .min(max)
    }
}

impl Default for StatementRequest {
    fn default() -> Self {
        Self::new("")
    }
}

/// Defaults applied when a request leaves limits unset.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionDefaults {
    pub row_limit: u32,
    pub timeout: Duration,
    pub batch_size: usize,
}

impl Default for ExecutionDefaults {
    fn default() -> Self {
        Self {
            row_limit: DEFAULT_ROW_LIMIT,
            timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            batch_size: crate::config::DEFAULT_STREAM_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMetadata {
    pub name: String,
    /// Database-specific type (e.g., "int8", "varchar", "TEXT")
    pub type_name: String,
}

impl ColumnMetadata {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Bounded result of a single statement. Rows keep driver order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub columns: Vec<ColumnMetadata>,
    pub rows: Vec<Vec<JsonValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    pub truncated: bool,
    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Create a result for write statements.
    pub fn write_result(rows_affected: u64, execution_time_ms: u64) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected: Some(rows_affected),
            truncated: false,
            execution_time_ms,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.rows_affected.is_none()
    }
}

/// One slice of a streamed result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowBatch {
    /// Zero-based position of this batch in the stream
    pub batch: usize,
    /// Present on the first batch only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<ColumnMetadata>>,
    pub rows: Vec<Vec<JsonValue>>,
}

/// Response body of the query endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutput {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<ColumnMetadata>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Vec<JsonValue>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl From<QueryResult> for QueryOutput {
    fn from(result: QueryResult) -> Self {
        let row_count = result.row_count();
        let is_write = result.rows_affected.is_some();
        Self {
            success: true,
            columns: (!is_write).then_some(result.columns),
            rows: (!is_write).then_some(result.rows),
            row_count: Some(row_count),
            rows_affected: result.rows_affected,
            truncated: Some(result.truncated),
            execution_time_ms: Some(result.execution_time_ms),
            error: None,
            code: None,
        }
    }
}

impl From<&crate::error::DbError> for QueryOutput {
    fn from(err: &crate::error::DbError) -> Self {
        Self {
            success: false,
            error: Some(err.client_message()),
            code: Some(err.code().to_string()),
            ..Self::default()
        }
    }
}
