//! Query handling.
//!
//! Ties the pieces of a request together: validate, acquire, execute,
//! release. Read-only requests that fail with a transient error are retried
//! with bounded backoff while their deadline allows.

use crate::db::{
    Backoff, ConnectionPool, Connector, DbConnection, QueryExecutor, SqlxConnector,
};
use crate::error::{DbError, DbResult};
use crate::models::{QueryResult, RowBatch, StatementRequest};
use crate::tools::sql_validator::StatementValidator;
use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Retry policy for transient failures of read-only statements.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: crate::config::DEFAULT_RETRY_ATTEMPTS,
            backoff: Backoff::default(),
        }
    }
}

/// Handler for statement requests against one pool.
pub struct QueryHandler<C: Connector = SqlxConnector> {
    pool: ConnectionPool<C>,
    validator: StatementValidator,
    executor: QueryExecutor,
    writable: bool,
    allow_elevated: bool,
    retry: RetryPolicy,
}

impl<C: Connector> Clone for QueryHandler<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            validator: self.validator,
            executor: self.executor,
            writable: self.writable,
            allow_elevated: self.allow_elevated,
            retry: self.retry,
        }
    }
}

impl<C> QueryHandler<C>
where
    C: Connector<Connection = DbConnection>,
{
    pub fn new(pool: ConnectionPool<C>, validator: StatementValidator, executor: QueryExecutor) -> Self {
        Self {
            pool,
            validator,
            executor,
            writable: false,
            allow_elevated: false,
            retry: RetryPolicy::default(),
        }
    }

    /// Allow requests that declare write intent.
    pub fn with_writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    /// Honour the `elevated` flag on requests.
    pub fn with_allow_elevated(mut self, allow: bool) -> Self {
        self.allow_elevated = allow;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    /// Validate and execute one statement.
    pub async fn query(&self, request: StatementRequest) -> DbResult<QueryResult> {
        let request = self.admit(request)?;
        let deadline = self.executor.deadline_for(&request);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_execute(&request, deadline).await {
                Ok(result) => {
                    info!(
                        pool = %self.pool.id(),
                        caller = ?request.caller,
                        row_count = result.row_count(),
                        rows_affected = ?result.rows_affected,
                        truncated = result.truncated,
                        execution_time_ms = result.execution_time_ms,
                        attempt,
                        "Statement executed"
                    );
                    return Ok(result);
                }
                Err(e) if self.should_retry(&request, &e, attempt, deadline) => {
                    let delay = self.retry.backoff.delay(attempt);
                    warn!(
                        pool = %self.pool.id(),
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient failure, retrying statement"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Validate a statement and stream its rows in batches.
    ///
    /// The connection is acquired before this returns, so pool and
    /// connectivity failures surface here rather than mid-stream. A worker
    /// task owns the connection and releases it when the stream ends or the
    /// consumer goes away.
    pub async fn stream(&self, request: StatementRequest) -> DbResult<BatchReceiver> {
        let request = self.admit(request)?;
        if !request.read_only {
            return Err(DbError::invalid_input(
                "streaming is only available for read-only statements",
            ));
        }

        let deadline = self.executor.deadline_for(&request);
        let mut conn = self.pool.acquire_until(deadline).await?;
        let executor = self.executor;
        let pool_id = self.pool.id().to_string();
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let mut batches = executor.stream(&request, &mut conn, deadline);
            let mut abandoned = false;
            while let Some(batch) = batches.next_batch().await {
                if tx.send(batch).await.is_err() {
                    abandoned = true;
                    break;
                }
            }
            let rows = batches.rows_seen();
            // A stream cut short leaves the connection mid-result
            let poisoned = batches.timed_out() || !batches.is_finished();
            drop(batches);

            if poisoned {
                conn.mark_unusable();
            }
            debug!(pool = %pool_id, rows, abandoned, "Row stream finished");
            conn.release().await;
        });

        Ok(BatchReceiver { rx })
    }

    fn admit(&self, mut request: StatementRequest) -> DbResult<StatementRequest> {
        if request.elevated && !self.allow_elevated {
            warn!(caller = ?request.caller, "Ignoring elevated flag; elevated statements are disabled");
            request.elevated = false;
        }
        if !request.read_only && !self.writable {
            return Err(DbError::permission(
                "write",
                format!("database '{}' is configured read-only", self.pool.id()),
            ));
        }
        self.validator.validate(&request).into_result()?;
        Ok(request)
    }

    async fn try_execute(&self, request: &StatementRequest, deadline: Instant) -> DbResult<QueryResult> {
        let mut conn = self.pool.acquire_until(deadline).await?;
        let result = self.executor.execute_until(request, &mut conn, deadline).await;
        conn.release().await;
        result
    }

    fn should_retry(&self, request: &StatementRequest, err: &DbError, attempt: u32, deadline: Instant) -> bool {
        request.read_only
            && err.is_retryable()
            && attempt < self.retry.attempts
            && Instant::now() + self.retry.backoff.delay(attempt) < deadline
    }
}

/// Receiving end of a streamed result.
#[derive(Debug)]
pub struct BatchReceiver {
    rx: mpsc::Receiver<DbResult<RowBatch>>,
}

impl BatchReceiver {
    /// Wrap a channel fed by some other producer.
    pub fn from_channel(rx: mpsc::Receiver<DbResult<RowBatch>>) -> Self {
        Self { rx }
    }

    pub async fn next_batch(&mut self) -> Option<DbResult<RowBatch>> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = DbResult<RowBatch>> + Send + 'static {
        futures_util::stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|batch| (batch, rx))
        })
    }
}
