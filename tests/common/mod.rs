//! Shared fixtures: a seeded SQLite database behind a pool, and the HTTP app.

#![allow(dead_code)]

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, header};
use query_gateway::auth::AuthConfig;
use query_gateway::config::PoolOptions;
use query_gateway::db::{ConnectionPool, PoolSettings, QueryExecutor, SqlxConnector};
use query_gateway::models::{ConnectionConfig, DatabaseType, ExecutionDefaults, StatementRequest};
use query_gateway::sync::Reconciler;
use query_gateway::tools::{HealthReporter, QueryHandler, StatementValidator, VectorSearch};
use query_gateway::transport::{AppState, router};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const SEED: &str = "
    CREATE TABLE dual (dummy TEXT);
    INSERT INTO dual VALUES ('X');
    CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
    INSERT INTO items (id, name) VALUES (1, 'a'), (2, 'b'), (3, 'c'), (4, 'd'), (5, 'e');
    CREATE TABLE embeddings (id TEXT PRIMARY KEY, embedding TEXT);
    INSERT INTO embeddings VALUES ('north', '[0, 1]'), ('east', '[1, 0]'), ('bad', 'nope');
";

pub fn executor() -> QueryExecutor {
    QueryExecutor::new(ExecutionDefaults {
        batch_size: 2,
        ..ExecutionDefaults::default()
    })
}

/// Pool over a fresh SQLite file, seeded with [`SEED`].
pub async fn sqlite_pool(dir: &TempDir, settings: PoolSettings) -> ConnectionPool {
    let url = format!("sqlite:{}", dir.path().join("gateway.db").display());
    let config = ConnectionConfig::new("main", &url, true, None, PoolOptions::default()).unwrap();
    let pool = ConnectionPool::new("main", SqlxConnector::from_config(&config).unwrap(), settings);

    let mut conn = pool.acquire().await.unwrap();
    executor()
        .execute(&StatementRequest::new(SEED).writable(), &mut conn)
        .await
        .unwrap();
    conn.release().await;
    pool
}

pub fn reconciler(pool: &ConnectionPool) -> Reconciler {
    Reconciler::new(
        pool.clone(),
        DatabaseType::SQLite,
        "sync_tracking",
        "sync_documents",
        "workflow_progress",
    )
    .unwrap()
}

/// The full router over a seeded database.
pub async fn app(dir: &TempDir, writable: bool, tokens: &[&str]) -> (Router, ConnectionPool) {
    let pool = sqlite_pool(dir, PoolSettings::default()).await;
    let executor = executor();
    let state = Arc::new(AppState {
        query: QueryHandler::new(pool.clone(), StatementValidator::default(), executor)
            .with_writable(writable),
        vectors: VectorSearch::new(pool.clone(), executor, "embeddings").unwrap(),
        reconciler: writable.then(|| reconciler(&pool)),
        health: HealthReporter::new(pool.clone(), Duration::from_secs(2)),
    });
    let auth = AuthConfig::from_tokens(tokens.iter().map(|t| t.to_string()).collect()).unwrap();
    (router(state, Arc::new(auth)), pool)
}

pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}
