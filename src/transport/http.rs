//! HTTP API.
//!
//! | Route                     | Body                    | Response              |
//! |---------------------------|-------------------------|-----------------------|
//! | `GET /api/health`         |                         | [`HealthSnapshot`]    |
//! | `POST /api/query`         | [`StatementRequest`]    | [`QueryOutput`]       |
//! | `POST /api/query/stream`  | [`StatementRequest`]    | NDJSON row batches    |
//! | `POST /api/vector-search` | [`VectorSearchRequest`] | [`VectorSearchResponse`] |
//! | `POST /api/sync`          | [`SyncRequest`]         | [`SyncResponse`]      |
//!
//! Every route except health sits behind bearer authentication when tokens
//! are configured. Errors use the [`DbError`] JSON body.

use crate::auth::{AuthConfig, Caller, require_bearer};
use crate::db::{Connector, DbConnection, SqlxConnector};
use crate::error::{DbError, DbResult};
use crate::models::{
    HealthSnapshot, HealthStatus, OutcomeStatus, QueryOutput, StatementRequest, SyncRequest,
    SyncResponse, VectorSearchRequest, VectorSearchResponse,
};
use crate::sync::{DEFAULT_CHUNK_SIZE, Reconciler};
use crate::tools::{BatchReceiver, HealthReporter, QueryHandler, VectorSearch};
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use futures_util::stream;
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{Instrument, error, info, info_span, warn};

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
const REQUEST_ID_HEADER: &str = "x-request-id";

/// Handlers shared by every route.
pub struct AppState<C: Connector = SqlxConnector> {
    pub query: QueryHandler<C>,
    pub vectors: VectorSearch<C>,
    /// Absent when the database is read-only
    pub reconciler: Option<Reconciler<C>>,
    pub health: HealthReporter<C>,
}

/// Build the API router.
pub fn router<C>(state: Arc<AppState<C>>, auth: Arc<AuthConfig>) -> Router
where
    C: Connector<Connection = DbConnection>,
{
    let protected = Router::new()
        .route("/api/query", post(query::<C>))
        .route("/api/query/stream", post(query_stream::<C>))
        .route("/api/vector-search", post(vector_search::<C>))
        .route("/api/sync", post(sync::<C>))
        .route_layer(middleware::from_fn_with_state(auth, require_bearer));

    Router::new()
        .route("/api/health", get(health::<C>))
        .merge(protected)
        .layer(middleware::from_fn(request_context))
        .with_state(state)
}

/// Tag each request with an id, in a span and in the response header.
async fn request_context(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let span = info_span!(
        "request",
        id = %request_id,
        method = %request.method(),
        path = %request.uri().path()
    );

    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Map body rejections onto the gateway's own error body.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> DbResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| DbError::invalid_input(e.body_text()))
}

fn attribute(mut request: StatementRequest, caller: Option<Extension<Caller>>) -> StatementRequest {
    request.caller = caller.map(|Extension(c)| c.0);
    request
}

async fn health<C>(State(state): State<Arc<AppState<C>>>) -> (StatusCode, Json<HealthSnapshot>)
where
    C: Connector<Connection = DbConnection>,
{
    let snapshot = state.health.check().await;
    let status = match snapshot.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };
    (status, Json(snapshot))
}

async fn query<C>(
    State(state): State<Arc<AppState<C>>>,
    caller: Option<Extension<Caller>>,
    payload: Result<Json<StatementRequest>, JsonRejection>,
) -> Result<Json<QueryOutput>, DbError>
where
    C: Connector<Connection = DbConnection>,
{
    let request = attribute(body(payload)?, caller);
    let result = state.query.query(request).await?;
    Ok(Json(QueryOutput::from(result)))
}

async fn query_stream<C>(
    State(state): State<Arc<AppState<C>>>,
    caller: Option<Extension<Caller>>,
    payload: Result<Json<StatementRequest>, JsonRejection>,
) -> Result<Response, DbError>
where
    C: Connector<Connection = DbConnection>,
{
    let request = attribute(body(payload)?, caller);
    let batches = state.query.stream(request).await?;

    Ok((
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)],
        Body::from_stream(ndjson_lines(batches)),
    )
        .into_response())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamEnd {
    done: bool,
    row_count: usize,
}

#[derive(Serialize)]
struct StreamError {
    error: String,
    code: &'static str,
}

/// One JSON document per line: each batch, then a terminator or an error.
fn ndjson_lines(
    batches: BatchReceiver,
) -> impl futures_util::Stream<Item = Result<String, Infallible>> + Send + 'static {
    stream::unfold(Some((batches, 0usize)), |state| async move {
        let (mut batches, rows) = state?;
        let (line, next) = match batches.next_batch().await {
            Some(Ok(batch)) => {
                let rows = rows + batch.rows.len();
                (serde_json::to_string(&batch), Some((batches, rows)))
            }
            Some(Err(e)) => {
                warn!(error = %e, rows, "Row stream failed");
                let line = StreamError {
                    error: e.client_message(),
                    code: e.code(),
                };
                (serde_json::to_string(&line), None)
            }
            None => {
                let line = StreamEnd {
                    done: true,
                    row_count: rows,
                };
                (serde_json::to_string(&line), None)
            }
        };
        let mut line = line.unwrap_or_else(|e| {
            error!(error = %e, "Failed to encode stream line");
            r#"{"error":"failed to encode batch","code":"INTERNAL_ERROR"}"#.to_string()
        });
        line.push('\n');
        Some((Ok(line), next))
    })
}

async fn vector_search<C>(
    State(state): State<Arc<AppState<C>>>,
    payload: Result<Json<VectorSearchRequest>, JsonRejection>,
) -> Result<Json<VectorSearchResponse>, DbError>
where
    C: Connector<Connection = DbConnection>,
{
    let request = body(payload)?;
    let timeout = request.timeout_ms.map(Duration::from_millis);
    let result = state
        .vectors
        .search(&request.vector, request.top_k, timeout)
        .await?;
    Ok(Json(VectorSearchResponse {
        success: true,
        matches: result.matches,
        skipped: result.skipped,
    }))
}

async fn sync<C>(
    State(state): State<Arc<AppState<C>>>,
    payload: Result<Json<SyncRequest>, JsonRejection>,
) -> Result<Json<SyncResponse>, DbError>
where
    C: Connector<Connection = DbConnection>,
{
    let request = body(payload)?;
    let reconciler = state.reconciler.as_ref().ok_or_else(|| {
        DbError::permission("sync", "the database is configured read-only")
    })?;
    let (outcomes, resumed_from) = match request.batch_id.as_deref() {
        Some(batch_id) => {
            let chunk_size = request.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
            let report = reconciler
                .reconcile_resumable(batch_id, &request.records, chunk_size)
                .await?;
            (report.outcomes, report.resumed_from)
        }
        None => (reconciler.reconcile(&request.records).await, None),
    };

    let success = outcomes.iter().all(|o| o.status != OutcomeStatus::Failed);
    Ok(Json(SyncResponse {
        success,
        outcomes,
        resumed_from,
    }))
}

/// Serve `app` until `shutdown` resolves, then drain in-flight requests.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> DbResult<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| DbError::internal(format!("HTTP server error: {e}")))
}

/// Bind `addr` and serve until SIGINT or SIGTERM.
///
/// Streaming responses can hold the server open, so after the first signal
/// in-flight requests get `grace` to finish; a second signal exits at once.
pub async fn run(addr: &str, app: Router, grace: Duration) -> DbResult<()> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        DbError::connectivity(
            format!("Failed to bind to {addr}: {e}"),
            "Check that the port is available",
        )
    })?;
    info!(addr, "HTTP API listening");

    let shutdown_started = Arc::new(tokio::sync::Notify::new());
    let notify = Arc::clone(&shutdown_started);
    let shutdown = async move {
        wait_for_signal().await;
        notify.notify_one();
    };

    tokio::select! {
        result = serve(listener, app, shutdown) => {
            match &result {
                Ok(()) => info!("HTTP server stopped"),
                Err(e) => error!(error = %e, "HTTP server error"),
            }
            result
        }
        _ = async {
            shutdown_started.notified().await;
            info!(
                timeout_secs = grace.as_secs(),
                "Waiting for in-flight requests (send signal again to force exit)"
            );
            tokio::select! {
                _ = tokio::time::sleep(grace) => warn!("Graceful shutdown timeout, forcing exit"),
                _ = wait_for_signal() => warn!("Received second signal, forcing immediate exit"),
            }
        } => Ok(()),
    }
}

/// Wait for SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
