//! Database dispatch macros for reducing code duplication.
//!
//! sqlx types differ per backend, so code that runs against a
//! [`DbConnection`](crate::db::DbConnection) is written once and expanded for
//! each variant. The body is type-checked separately against MySQL, PostgreSQL
//! and SQLite connections.

/// Run `$body` with `$c` bound to the backend-specific `&mut` connection.
///
/// # Example
///
/// ```ignore
/// with_connection!(conn, c => {
///     sqlx::query("SELECT 1").execute(&mut *c).await?;
/// });
/// ```
#[macro_export]
macro_rules! with_connection {
    ($conn:expr, $c:ident => $body:expr) => {
        match $conn {
            $crate::db::DbConnection::MySql($c) => $body,
            $crate::db::DbConnection::Postgres($c) => $body,
            $crate::db::DbConnection::SQLite($c) => $body,
        }
    };
}

/// Bind positional [`QueryParam`](crate::models::QueryParam)s to a sqlx query.
#[macro_export]
macro_rules! bind_params {
    ($query:expr, $params:expr) => {{
        let mut query = $query;
        for param in $params {
            query = match param {
                $crate::models::QueryParam::Null => query.bind(None::<String>),
                $crate::models::QueryParam::Bool(v) => query.bind(*v),
                $crate::models::QueryParam::Int(v) => query.bind(*v),
                $crate::models::QueryParam::Float(v) => query.bind(*v),
                $crate::models::QueryParam::String(v) => query.bind(v.as_str()),
            };
        }
        query
    }};
}

pub use bind_params;
pub use with_connection;
