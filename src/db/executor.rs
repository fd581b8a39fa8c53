//! Statement execution engine.
//!
//! This module provides:
//! - Bounded execution (fetches `max_rows + 1` rows to detect truncation)
//! - Lazy batch streaming over a borrowed connection
//! - Deadlines on both, with poisoned connections discarded on release
//!
//! Rows are decoded into positional JSON arrays in driver order.

use crate::db::DbConnection;
use crate::db::connection::Connector;
use crate::db::pool::PooledConnection;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnMetadata, ExecutionDefaults, QueryParam, QueryResult, RowBatch, StatementRequest,
};
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use serde_json::Value as JsonValue;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

/// A decoded row. Column metadata rides along with the first row only.
type DecodedRow = (Option<Vec<ColumnMetadata>>, Vec<JsonValue>);

type DecodedRows<'c> = BoxStream<'c, DbResult<DecodedRow>>;

/// Executes validated statements on pooled connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryExecutor {
    defaults: ExecutionDefaults,
}

impl QueryExecutor {
    pub fn new(defaults: ExecutionDefaults) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &ExecutionDefaults {
        &self.defaults
    }

    /// Deadline for a request that starts now.
    pub fn deadline_for(&self, request: &StatementRequest) -> Instant {
        Instant::now() + request.effective_timeout(self.defaults.timeout)
    }

    /// Execute a statement using the request's own timeout.
    pub async fn execute<C>(
        &self,
        request: &StatementRequest,
        conn: &mut PooledConnection<C>,
    ) -> DbResult<QueryResult>
    where
        C: Connector<Connection = DbConnection>,
    {
        let deadline = self.deadline_for(request);
        self.execute_until(request, conn, deadline).await
    }

    /// Execute a statement that must finish before `deadline`.
    ///
    /// Read-only requests return rows; write requests return the affected row
    /// count. On timeout the connection is marked unusable, since the driver
    /// cannot cancel the statement server-side.
    pub async fn execute_until<C>(
        &self,
        request: &StatementRequest,
        conn: &mut PooledConnection<C>,
        deadline: Instant,
    ) -> DbResult<QueryResult>
    where
        C: Connector<Connection = DbConnection>,
    {
        let start = Instant::now();
        let row_limit = request.effective_limit(self.defaults.row_limit);

        debug!(
            sql = %request.query,
            params = request.params.len(),
            limit = row_limit,
            read_only = request.read_only,
            connection = conn.meta().id,
            "Executing statement"
        );

        let outcome = if request.read_only {
            let rows = decoded_rows(&mut **conn, &request.query, &request.params)
                .take(row_limit as usize + 1)
                .try_collect::<Vec<_>>();
            timeout_at(deadline, rows)
                .await
                .map(|rows| rows.map(|rows| process_rows(rows, row_limit, start)))
        } else {
            let write = execute_write(&mut **conn, &request.query, &request.params);
            timeout_at(deadline, write).await.map(|affected| {
                affected.map(|n| QueryResult::write_result(n, elapsed_ms(start)))
            })
        };

        match outcome {
            Ok(result) => result,
            Err(_) => {
                let elapsed = elapsed_ms(start);
                warn!(
                    sql = %request.query,
                    elapsed_ms = elapsed,
                    connection = conn.meta().id,
                    "Statement exceeded its deadline; discarding connection"
                );
                conn.mark_unusable();
                Err(DbError::timeout("query execution", elapsed))
            }
        }
    }

    /// Open a lazy batch stream over the statement's results.
    ///
    /// The stream borrows the connection until it is dropped. If it reports
    /// [`RowBatchStream::timed_out`], the caller must mark the connection
    /// unusable before releasing it.
    pub fn stream<'c, C>(
        &self,
        request: &'c StatementRequest,
        conn: &'c mut PooledConnection<C>,
        deadline: Instant,
    ) -> RowBatchStream<'c>
    where
        C: Connector<Connection = DbConnection>,
    {
        debug!(
            sql = %request.query,
            params = request.params.len(),
            batch_size = self.defaults.batch_size,
            connection = conn.meta().id,
            "Opening row stream"
        );

        let rows = decoded_rows(&mut **conn, &request.query, &request.params);
        let rows = match request.max_rows {
            Some(cap) => rows.take(cap.max(1) as usize).boxed(),
            None => rows,
        };
        RowBatchStream::new(rows, self.defaults.batch_size, deadline)
    }
}

/// Finite, lazy, non-restartable sequence of [`RowBatch`]es.
///
/// Only the batch being filled is buffered. After the last batch or the first
/// error, every call to [`next_batch`](Self::next_batch) returns `None`.
pub struct RowBatchStream<'c> {
    rows: DecodedRows<'c>,
    batch_size: usize,
    deadline: Instant,
    next_index: usize,
    rows_seen: usize,
    started: Instant,
    finished: bool,
    timed_out: bool,
}

impl<'c> RowBatchStream<'c> {
    fn new(rows: DecodedRows<'c>, batch_size: usize, deadline: Instant) -> Self {
        Self {
            rows,
            batch_size: batch_size.max(1),
            deadline,
            next_index: 0,
            rows_seen: 0,
            started: Instant::now(),
            finished: false,
            timed_out: false,
        }
    }

    /// Fill and return the next batch, or `None` once the stream is exhausted.
    pub async fn next_batch(&mut self) -> Option<DbResult<RowBatch>> {
        if self.finished {
            return None;
        }

        let mut columns = None;
        let mut rows = Vec::with_capacity(self.batch_size);

        while rows.len() < self.batch_size {
            match timeout_at(self.deadline, self.rows.next()).await {
                Ok(Some(Ok((cols, values)))) => {
                    if cols.is_some() {
                        columns = cols;
                    }
                    rows.push(values);
                }
                Ok(Some(Err(e))) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                Ok(None) => {
                    self.finished = true;
                    break;
                }
                Err(_) => {
                    self.finished = true;
                    self.timed_out = true;
                    return Some(Err(DbError::timeout(
                        "row streaming",
                        elapsed_ms(self.started),
                    )));
                }
            }
        }

        if rows.is_empty() {
            return None;
        }

        self.rows_seen += rows.len();
        let batch = RowBatch {
            batch: self.next_index,
            columns,
            rows,
        };
        self.next_index += 1;
        Some(Ok(batch))
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether the stream ended because its deadline passed.
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Total rows handed out so far.
    pub fn rows_seen(&self) -> usize {
        self.rows_seen
    }
}

impl std::fmt::Debug for RowBatchStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowBatchStream")
            .field("batch_size", &self.batch_size)
            .field("next_index", &self.next_index)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// Stream a statement's rows as positional JSON.
///
/// Statements without parameters go through the driver's simple path, which
/// also accepts statements that cannot be prepared.
fn decoded_rows<'c>(
    conn: &'c mut DbConnection,
    sql: &'c str,
    params: &'c [QueryParam],
) -> DecodedRows<'c> {
    with_connection!(conn, c => {
        let rows = if params.is_empty() {
            sqlx::Executor::fetch(c, sql)
        } else {
            bind_params!(sqlx::query(sql), params).fetch(c)
        };
        decode_rows(rows)
    })
}

fn decode_rows<'c, R>(rows: BoxStream<'c, Result<R, sqlx::Error>>) -> DecodedRows<'c>
where
    R: RowToJson + Send + 'c,
{
    let mut first = true;
    rows.map(move |row| {
        let row = row.map_err(DbError::from)?;
        let columns = std::mem::take(&mut first).then(|| row.column_metadata());
        Ok((columns, row.to_json_values()))
    })
    .boxed()
}

async fn execute_write(
    conn: &mut DbConnection,
    sql: &str,
    params: &[QueryParam],
) -> DbResult<u64> {
    let affected = with_connection!(conn, c => {
        if params.is_empty() {
            sqlx::Executor::execute(c, sql).await?.rows_affected()
        } else {
            bind_params!(sqlx::query(sql), params).execute(c).await?.rows_affected()
        }
    });
    Ok(affected)
}

fn process_rows(rows: Vec<DecodedRow>, row_limit: u32, start: Instant) -> QueryResult {
    let truncated = rows.len() > row_limit as usize;
    let mut columns = Vec::new();
    let rows = rows
        .into_iter()
        .take(row_limit as usize)
        .map(|(cols, values)| {
            if let Some(cols) = cols {
                columns = cols;
            }
            values
        })
        .collect();

    QueryResult {
        columns,
        rows,
        rows_affected: None,
        truncated,
        execution_time_ms: elapsed_ms(start),
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
