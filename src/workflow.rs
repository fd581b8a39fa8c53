//! Resumable step sequences.
//!
//! A workflow is an ordered list of steps identified by index. After each
//! step the runner persists how many steps are done, so re-running the same
//! workflow id skips what already finished. A failing step leaves the marker
//! at the last completed step.

use crate::config::validate_identifier;
use crate::db::{ConnectionPool, Connector, DbConnection, SqlxConnector};
use crate::error::{DbError, DbResult};
use crate::sync::store::{format_timestamp, parse_timestamp};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;
use std::future::Future;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Persisted progress of one workflow.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowProgress {
    pub workflow_id: String,
    /// Number of leading steps that completed
    pub completed_steps: usize,
    pub total_steps: usize,
    pub completed: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl WorkflowProgress {
    /// Index of the last completed step.
    pub fn last_completed_step(&self) -> Option<usize> {
        self.completed_steps.checked_sub(1)
    }

    /// Index of the next step to run, if any remain.
    pub fn next_step(&self) -> Option<usize> {
        (self.completed_steps < self.total_steps).then_some(self.completed_steps)
    }
}

/// Summary of one `run` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowReport {
    pub workflow_id: String,
    pub total_steps: usize,
    /// First step executed by this call, when earlier steps were already done
    pub resumed_from: Option<usize>,
    /// Steps executed by this call
    pub executed: usize,
    pub completed: bool,
}

#[derive(Debug)]
struct Statements {
    create: String,
    select: String,
    upsert: String,
}

/// Runs workflows and persists their progress in a table.
pub struct WorkflowRunner<C: Connector = SqlxConnector> {
    pool: ConnectionPool<C>,
    table: String,
    sql: Statements,
    schema_ready: OnceCell<()>,
}

impl<C> WorkflowRunner<C>
where
    C: Connector<Connection = DbConnection>,
{
    pub fn new(pool: ConnectionPool<C>, table: impl Into<String>, db_type: crate::models::DatabaseType) -> DbResult<Self> {
        let table = table.into();
        validate_identifier(&table)
            .map_err(|e| DbError::configuration(format!("invalid workflow table name: {e}")))?;

        let columns = ["workflow_id", "completed_steps", "total_steps", "completed", "updated_at"];
        let sql = Statements {
            create: format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 workflow_id VARCHAR(255) PRIMARY KEY, \
                 completed_steps BIGINT NOT NULL, \
                 total_steps BIGINT NOT NULL, \
                 completed BIGINT NOT NULL, \
                 updated_at VARCHAR(40) NOT NULL)"
            ),
            select: format!(
                "SELECT completed_steps, total_steps, completed, updated_at FROM {table} WHERE workflow_id = {}",
                db_type.placeholder(1)
            ),
            upsert: format!(
                "INSERT INTO {table} ({}) VALUES ({}) {}",
                columns.join(", "),
                db_type.placeholders(columns.len()),
                db_type.upsert_suffix(columns[0], &columns[1..])
            ),
        };

        Ok(Self {
            pool,
            table,
            sql,
            schema_ready: OnceCell::new(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the progress table if it does not exist. Runs once per runner.
    pub async fn ensure_schema(&self) -> DbResult<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                let mut conn = self.pool.acquire().await?;
                let result = with_connection!(&mut *conn, c => {
                    sqlx::query(&self.sql.create).execute(&mut *c).await.map(|_| ())
                });
                conn.release().await;
                result?;
                debug!(table = %self.table, "Workflow progress table ready");
                Ok::<_, DbError>(())
            })
            .await
            .map(|_| ())
    }

    /// Load progress for `workflow_id`, or a fresh record if it never ran.
    pub async fn load(&self, workflow_id: &str, total_steps: usize) -> DbResult<WorkflowProgress> {
        self.ensure_schema().await?;
        let mut conn = self.pool.acquire().await?;
        let row = with_connection!(&mut *conn, c => {
            match sqlx::query(&self.sql.select).bind(workflow_id).fetch_optional(&mut *c).await {
                Ok(Some(row)) => (|| {
                    Ok::<_, sqlx::Error>(Some((
                        row.try_get::<i64, _>(0)?,
                        row.try_get::<i64, _>(1)?,
                        row.try_get::<i64, _>(2)?,
                        row.try_get::<String, _>(3)?,
                    )))
                })(),
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            }
        });
        conn.release().await;

        let Some((done, total, completed, updated_at)) = row? else {
            return Ok(WorkflowProgress {
                workflow_id: workflow_id.to_string(),
                completed_steps: 0,
                total_steps,
                completed: total_steps == 0,
                updated_at: None,
            });
        };

        if total as usize != total_steps {
            return Err(DbError::invalid_input(format!(
                "workflow '{workflow_id}' was started with {total} steps, not {total_steps}"
            )));
        }
        Ok(WorkflowProgress {
            workflow_id: workflow_id.to_string(),
            completed_steps: done.max(0) as usize,
            total_steps,
            completed: completed != 0,
            updated_at: parse_timestamp(Some(&updated_at)),
        })
    }

    /// Record that `step` finished. Steps must complete in order.
    pub async fn complete_step(&self, progress: &mut WorkflowProgress, step: usize) -> DbResult<()> {
        if progress.next_step() != Some(step) {
            return Err(DbError::internal(format!(
                "workflow '{}' expected step {:?}, got {step}",
                progress.workflow_id,
                progress.next_step()
            )));
        }
        let mut updated = progress.clone();
        updated.completed_steps = step + 1;
        updated.completed = updated.completed_steps == updated.total_steps;
        updated.updated_at = Some(Utc::now());
        self.save(&updated).await?;
        *progress = updated;
        Ok(())
    }

    /// Run the remaining steps of a workflow in order.
    pub async fn run<F, Fut>(&self, workflow_id: &str, total_steps: usize, mut step_fn: F) -> DbResult<WorkflowReport>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = DbResult<()>>,
    {
        let mut progress = self.load(workflow_id, total_steps).await?;
        let resumed_from = (progress.completed_steps > 0 && !progress.completed)
            .then_some(progress.completed_steps);
        let mut executed = 0;

        if progress.completed {
            debug!(workflow_id, "Workflow already complete");
        }
        while let Some(step) = progress.next_step() {
            if let Err(e) = step_fn(step).await {
                warn!(workflow_id, step, error = %e, "Workflow step failed");
                return Err(e);
            }
            self.complete_step(&mut progress, step).await?;
            executed += 1;
        }
        if !progress.completed {
            // Zero-step workflows finish without running anything
            progress.completed = true;
            progress.updated_at = Some(Utc::now());
            self.save(&progress).await?;
        }

        info!(workflow_id, total_steps, executed, resumed_from = ?resumed_from, "Workflow finished");
        Ok(WorkflowReport {
            workflow_id: workflow_id.to_string(),
            total_steps,
            resumed_from,
            executed,
            completed: progress.completed,
        })
    }

    async fn save(&self, progress: &WorkflowProgress) -> DbResult<()> {
        self.ensure_schema().await?;
        let updated_at = format_timestamp(progress.updated_at.unwrap_or_else(Utc::now));
        let mut conn = self.pool.acquire().await?;
        let result = with_connection!(&mut *conn, c => {
            sqlx::query(&self.sql.upsert)
                .bind(progress.workflow_id.as_str())
                .bind(progress.completed_steps as i64)
                .bind(progress.total_steps as i64)
                .bind(i64::from(progress.completed))
                .bind(updated_at.as_str())
                .execute(&mut *c)
                .await
                .map(|_| ())
        });
        conn.release().await;
        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolOptions;
    use crate::db::PoolSettings;
    use crate::models::{ConnectionConfig, DatabaseType};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runner(dir: &tempfile::TempDir) -> WorkflowRunner {
        let url = format!("sqlite:{}", dir.path().join("workflow.db").display());
        let config = ConnectionConfig::new("wf", &url, true, None, PoolOptions::default()).unwrap();
        let pool = ConnectionPool::new(
            "wf",
            SqlxConnector::from_config(&config).unwrap(),
            PoolSettings::default(),
        );
        WorkflowRunner::new(pool, "workflow_progress", DatabaseType::SQLite).unwrap()
    }

    #[tokio::test]
    async fn test_run_all_steps() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(&dir);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let report = runner
            .run("wf-1", 3, |step| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(step);
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(report.executed, 3);
        assert!(report.completed);
        assert_eq!(report.resumed_from, None);

        let progress = runner.load("wf-1", 3).await.unwrap();
        assert!(progress.completed);
        assert_eq!(progress.last_completed_step(), Some(2));
    }

    #[tokio::test]
    async fn test_failure_resumes_after_last_completed_step() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(&dir);
        let calls = Arc::new(AtomicUsize::new(0));

        let err = runner
            .run("wf-2", 4, |step| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if step == 2 {
                        Err(DbError::internal("boom"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert_eq!(runner.load("wf-2", 4).await.unwrap().last_completed_step(), Some(1));

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let report = runner
            .run("wf-2", 4, |step| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(step);
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![2, 3]);
        assert_eq!(report.resumed_from, Some(2));
        assert_eq!(report.executed, 2);
    }

    #[tokio::test]
    async fn test_completed_workflow_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(&dir);
        runner.run("wf-3", 2, |_| async { Ok(()) }).await.unwrap();

        let report = runner
            .run("wf-3", 2, |_| async { Err(DbError::internal("must not run")) })
            .await
            .unwrap();
        assert_eq!(report.executed, 0);
        assert!(report.completed);
    }

    #[tokio::test]
    async fn test_step_count_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(&dir);
        runner.run("wf-4", 2, |_| async { Ok(()) }).await.unwrap();

        let err = runner.load("wf-4", 5).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }
}
