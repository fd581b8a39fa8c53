//! Error types for the query gateway.
//!
//! Every failure a caller can observe maps to one variant of [`DbError`]. Each
//! variant carries an actionable message and, at the HTTP boundary, a stable
//! error code so clients can branch on the category instead of parsing text.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Validation rejected: {reason}")]
    ValidationRejected { rule: String, reason: String },

    #[error("Connectivity error: {message}")]
    Connectivity { message: String, suggestion: String },

    #[error("Pool exhausted: no connection available in pool '{pool}' after {waited_ms}ms")]
    PoolExhausted { pool: String, waited_ms: u64 },

    #[error("Execution timeout: {operation} exceeded {elapsed_ms}ms")]
    ExecutionTimeout { operation: String, elapsed_ms: u64 },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// Driver error code, e.g. "42P01" for undefined table
        code: Option<String>,
        suggestion: String,
    },

    #[error("Sync conflict for record '{record_id}': {reason}")]
    SyncConflict { record_id: String, reason: String },

    #[error("Permission denied: {operation} - {reason}")]
    Permission { operation: String, reason: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Secret not found: {name}")]
    SecretNotFound { name: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a validation rejection for the named rule.
    pub fn validation(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidationRejected {
            rule: rule.into(),
            reason: reason.into(),
        }
    }

    /// Create a connectivity error with a helpful suggestion.
    pub fn connectivity(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connectivity {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn pool_exhausted(pool: impl Into<String>, waited_ms: u64) -> Self {
        Self::PoolExhausted {
            pool: pool.into(),
            waited_ms,
        }
    }

    /// Create an execution timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::ExecutionTimeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    /// Create a database error with optional driver code.
    pub fn database(
        message: impl Into<String>,
        code: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            code,
            suggestion: suggestion.into(),
        }
    }

    pub fn sync_conflict(record_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SyncConflict {
            record_id: record_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a permission error.
    pub fn permission(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permission {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn secret_not_found(name: impl Into<String>) -> Self {
        Self::SecretNotFound { name: name.into() }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connectivity { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::PoolExhausted { .. } => {
                Some("Retry later or raise max_connections for this database")
            }
            Self::ExecutionTimeout { .. } => {
                Some("Consider increasing the timeout or narrowing the query")
            }
            _ => None,
        }
    }

    /// Transient errors the caller may retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity { .. } | Self::PoolExhausted { .. })
    }

    /// True for errors that leave the underlying connection in an unknown state.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            Self::Connectivity { .. } | Self::ExecutionTimeout { .. } | Self::Internal { .. }
        )
    }

    /// Stable machine-readable code used at the HTTP boundary.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ValidationRejected { .. } => "VALIDATION_REJECTED",
            Self::Connectivity { .. } => "CONNECTIVITY_ERROR",
            Self::PoolExhausted { .. } => "POOL_EXHAUSTED",
            Self::ExecutionTimeout { .. } => "EXECUTION_TIMEOUT",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::SyncConflict { .. } => "SYNC_CONFLICT",
            Self::Permission { .. } => "PERMISSION_DENIED",
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::SecretNotFound { .. } => "SECRET_NOT_FOUND",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ValidationRejected { .. } | Self::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            Self::Connectivity { .. } | Self::PoolExhausted { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::ExecutionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Database { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::SyncConflict { .. } => StatusCode::CONFLICT,
            Self::Permission { .. } => StatusCode::FORBIDDEN,
            Self::Configuration { .. } | Self::SecretNotFound { .. } | Self::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message shown to HTTP clients. Database errors carry their driver code.
    pub fn client_message(&self) -> String {
        match self {
            Self::Database {
                message,
                code: Some(code),
                ..
            } => format!("Database error: {} (code: {})", message, code),
            _ => self.to_string(),
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connectivity(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::pool_exhausted("driver", 0),
            sqlx::Error::PoolClosed => {
                DbError::connectivity("Connection pool is closed", "Restart the service")
            }
            sqlx::Error::Io(io_err) => DbError::connectivity(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connectivity(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connectivity(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => DbError::database(
                format!("Type not found: {}", type_name),
                None,
                "Check the column types referenced by the statement",
            ),
            sqlx::Error::ColumnNotFound(col) => DbError::database(
                format!("Column not found: {}", col),
                None,
                "Check the column names referenced by the statement",
            ),
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => {
                DbError::connectivity("Database worker crashed", "Retry the request")
            }
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for gateway operations.
pub type DbResult<T> = Result<T, DbError>;

/// Error body returned by every JSON endpoint: `{success: false, error, code, suggestion?}`.
impl IntoResponse for DbError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "success": false,
            "error": self.client_message(),
            "code": self.code(),
        });
        if let Some(suggestion) = self.suggestion() {
            body["suggestion"] = serde_json::Value::String(suggestion.to_string());
        }
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connectivity("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connectivity error"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::database(
            "Syntax error",
            Some("42601".to_string()),
            "Check SQL syntax",
        );
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::connectivity("err", "sugg").is_retryable());
        assert!(DbError::pool_exhausted("main", 100).is_retryable());
        assert!(!DbError::timeout("query", 30).is_retryable());
        assert!(!DbError::validation("destructive", "no").is_retryable());
        assert!(!DbError::database("boom", None, "fix").is_retryable());
    }

    #[test]
    fn test_timeout_poisons_connection() {
        assert!(DbError::timeout("query", 10).poisons_connection());
        assert!(!DbError::database("constraint", None, "").poisons_connection());
    }

    #[test]
    fn test_codes_and_status() {
        let cases = [
            (DbError::validation("r", "x"), "VALIDATION_REJECTED", 400),
            (DbError::connectivity("x", "y"), "CONNECTIVITY_ERROR", 503),
            (DbError::pool_exhausted("p", 1), "POOL_EXHAUSTED", 503),
            (DbError::timeout("q", 1), "EXECUTION_TIMEOUT", 504),
            (DbError::database("x", None, "y"), "DATABASE_ERROR", 422),
            (DbError::sync_conflict("id", "x"), "SYNC_CONFLICT", 409),
            (DbError::permission("write", "ro"), "PERMISSION_DENIED", 403),
            (DbError::secret_not_found("k"), "SECRET_NOT_FOUND", 500),
        ];
        for (err, code, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.status_code().as_u16(), status);
        }
    }

    #[test]
    fn test_database_error_includes_code_in_client_message() {
        let err = DbError::database("syntax error", Some("42601".to_string()), "check syntax");
        assert!(err.client_message().contains("42601"));
    }

    #[test]
    fn test_sqlx_io_error_maps_to_connectivity() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: DbError = sqlx::Error::Io(io).into();
        assert_eq!(err.code(), "CONNECTIVITY_ERROR");
    }

    #[test]
    fn test_into_response_status() {
        let response = DbError::validation("destructive", "nope").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
