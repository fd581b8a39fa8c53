//! Idempotent record reconciliation.
//!
//! Each incoming record is hashed and compared with its tracking row inside a
//! transaction. Unchanged content is skipped, older content is skipped as
//! stale, and everything else is written to the target table together with
//! the new tracking state. Records with the same id are serialized through a
//! per-id lock so concurrent batches cannot interleave on one record. On
//! SQLite every apply transaction also goes through one reconciler-wide gate.

use super::hash::content_hash;
use super::store::{SyncStatements, TrackedState, format_timestamp, record_from_columns};
use crate::db::{ConnectionPool, Connector, DbConnection, SqlxConnector};
use crate::error::{DbError, DbResult};
use crate::models::{
    DatabaseType, IncomingRecord, OutcomeStatus, SyncOutcome, SyncRecord, SyncStatus,
};
use crate::workflow::WorkflowRunner;
use chrono::Utc;
use futures_util::StreamExt;
use serde::Serialize;
use sqlx::{Connection, Row};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{OnceCell, OwnedMutexGuard};
use tracing::{debug, info, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// What to do with an incoming record given its tracking state.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Apply { retried: bool },
    SkipDuplicate,
    SkipStale,
    Conflict(String),
}

/// Pure reconciliation rule.
///
/// Only a successfully applied row can make an incoming record a duplicate
/// or stale. Failed and pending rows are always re-applied. Missing
/// timestamps on either side mean the incoming record wins.
pub fn decide(existing: Option<&TrackedState>, record: &IncomingRecord, hash: &str) -> Decision {
    let Some(existing) = existing else {
        return Decision::Apply { retried: false };
    };

    match existing.status {
        SyncStatus::Failed => Decision::Apply {
            retried: existing.content_hash == hash,
        },
        SyncStatus::Pending => Decision::Apply { retried: false },
        SyncStatus::Success if existing.content_hash == hash => Decision::SkipDuplicate,
        SyncStatus::Success => match (record.updated_at, existing.source_updated_at) {
            (Some(incoming), Some(stored)) if incoming < stored => Decision::SkipStale,
            (Some(incoming), Some(stored)) if incoming == stored => Decision::Conflict(format!(
                "content differs from the applied version with the same timestamp {}",
                format_timestamp(stored)
            )),
            _ => Decision::Apply { retried: false },
        },
    }
}

/// Per-key async locks. Entries disappear once nobody holds them.
#[derive(Default)]
struct KeyedLocks {
    inner: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.retain(|_, weak| weak.strong_count() > 0);
            match map.get(key).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(tokio::sync::Mutex::new(()));
                    map.insert(key.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.values().filter(|weak| weak.strong_count() > 0).count()
    }
}

/// Result of a resumable batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    /// Outcomes of the chunks run by this call
    pub outcomes: Vec<SyncOutcome>,
    pub resumed_from: Option<usize>,
    pub chunks_total: usize,
    pub chunks_run: usize,
}

pub struct Reconciler<C: Connector = SqlxConnector> {
    pool: ConnectionPool<C>,
    sql: SyncStatements,
    locks: KeyedLocks,
    schema_ready: OnceCell<()>,
    workflow: WorkflowRunner<C>,
    concurrency: usize,
    /// SQLite only: one apply transaction at a time across all batches
    write_gate: Option<tokio::sync::Mutex<()>>,
}

impl<C> Reconciler<C>
where
    C: Connector<Connection = DbConnection>,
{
    pub fn new(
        pool: ConnectionPool<C>,
        db_type: DatabaseType,
        tracking_table: &str,
        target_table: &str,
        workflow_table: &str,
    ) -> DbResult<Self> {
        let sql = SyncStatements::new(db_type, tracking_table, target_table)?;
        if workflow_table == tracking_table || workflow_table == target_table {
            return Err(DbError::configuration(
                "workflow table must differ from the sync tables",
            ));
        }
        let workflow = WorkflowRunner::new(pool.clone(), workflow_table, db_type)?;
        // SQLite upgrades read transactions to writes; concurrent upgrades fail with SQLITE_BUSY
        // without waiting on busy_timeout
        let (concurrency, write_gate) = match db_type {
            DatabaseType::SQLite => (1, Some(tokio::sync::Mutex::new(()))),
            _ => (pool.settings().max_connections.max(1) as usize, None),
        };

        Ok(Self {
            pool,
            sql,
            locks: KeyedLocks::default(),
            schema_ready: OnceCell::new(),
            workflow,
            concurrency,
            write_gate,
        })
    }

    pub fn workflow(&self) -> &WorkflowRunner<C> {
        &self.workflow
    }

    pub fn statements(&self) -> &SyncStatements {
        &self.sql
    }

    /// Create the tracking and target tables if they do not exist.
    pub async fn ensure_schema(&self) -> DbResult<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                let mut conn = self.pool.acquire().await?;
                let result = with_connection!(&mut *conn, c => {
                    async {
                        sqlx::query(&self.sql.create_tracking).execute(&mut *c).await?;
                        sqlx::query(&self.sql.create_target).execute(&mut *c).await?;
                        Ok::<_, sqlx::Error>(())
                    }
                    .await
                });
                conn.release().await;
                result?;
                debug!(
                    tracking = %self.sql.tracking_table,
                    target = %self.sql.target_table,
                    "Sync tables ready"
                );
                Ok::<_, DbError>(())
            })
            .await
            .map(|_| ())
    }

    /// Tracking row for `record_id`, if one exists.
    pub async fn lookup(&self, record_id: &str) -> DbResult<Option<SyncRecord>> {
        self.ensure_schema().await?;
        let mut conn = self.pool.acquire().await?;
        let row = with_connection!(&mut *conn, c => {
            async {
                let Some(row) = sqlx::query(&self.sql.select_record)
                    .bind(record_id)
                    .fetch_optional(&mut *c)
                    .await?
                else {
                    return Ok::<_, sqlx::Error>(None);
                };
                Ok(Some((
                    row.try_get::<String, _>(0)?,
                    row.try_get::<String, _>(1)?,
                    row.try_get::<String, _>(2)?,
                    row.try_get::<String, _>(3)?,
                    row.try_get::<String, _>(4)?,
                    row.try_get::<Option<String>, _>(5)?,
                )))
            }
            .await
        });
        conn.release().await;

        match row? {
            Some((id, source_table, hash, status, synced_at, updated_at)) => Ok(Some(
                record_from_columns(id, source_table, hash, &status, &synced_at, updated_at)?,
            )),
            None => Ok(None),
        }
    }

    /// Reconcile a batch. Returns one outcome per record, in input order.
    pub async fn reconcile(&self, records: &[IncomingRecord]) -> Vec<SyncOutcome> {
        self.reconcile_chunk(records)
            .await
            .into_iter()
            .map(|(outcome, _)| outcome)
            .collect()
    }

    /// Reconcile a batch in chunks, persisting progress after each chunk.
    ///
    /// Re-submitting the same `batch_id` skips chunks that already completed.
    /// A chunk in which any record hit an infrastructure error (pool or
    /// connectivity) is not marked complete, and the call fails so the caller
    /// can resubmit.
    pub async fn reconcile_resumable(
        &self,
        batch_id: &str,
        records: &[IncomingRecord],
        chunk_size: usize,
    ) -> DbResult<BatchReport> {
        if batch_id.trim().is_empty() {
            return Err(DbError::invalid_input("batchId must not be empty"));
        }
        let chunk_size = chunk_size.max(1);
        let chunks: Vec<&[IncomingRecord]> = records.chunks(chunk_size).collect();
        let workflow_id = format!("sync:{batch_id}");

        let mut progress = self.workflow.load(&workflow_id, chunks.len()).await?;
        let resumed_from = (progress.completed_steps > 0).then_some(progress.completed_steps);
        let mut outcomes = Vec::new();
        let mut chunks_run = 0;

        while let Some(step) = progress.next_step() {
            let results = self.reconcile_chunk(chunks[step]).await;
            if let Some((_, Some(err))) = results.iter().find(|(_, err)| err.is_some()) {
                warn!(batch_id, chunk = step, error = %err, "Sync chunk interrupted");
                return Err(DbError::internal(format!(
                    "batch '{batch_id}' stopped at chunk {step}: {err}"
                )));
            }
            outcomes.extend(results.into_iter().map(|(outcome, _)| outcome));
            self.workflow.complete_step(&mut progress, step).await?;
            chunks_run += 1;
        }

        info!(
            batch_id,
            chunks = chunks.len(),
            chunks_run,
            resumed_from = ?resumed_from,
            "Sync batch complete"
        );
        Ok(BatchReport {
            outcomes,
            resumed_from,
            chunks_total: chunks.len(),
            chunks_run,
        })
    }

    /// Outcomes paired with the infrastructure error behind a failure, if any.
    async fn reconcile_chunk(&self, records: &[IncomingRecord]) -> Vec<(SyncOutcome, Option<String>)> {
        futures_util::stream::iter(0..records.len())
            .map(move |i| {
                let record = &records[i];
                async move {
                    match self.reconcile_one(record).await {
                        Ok(outcome) => (outcome, None),
                        Err(e) => {
                            let hash = content_hash(record);
                            let outcome = SyncOutcome::new(&record.id, OutcomeStatus::Failed, hash)
                                .with_reason(e.to_string());
                            (outcome, Some(e.to_string()))
                        }
                    }
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await
    }

    /// Record-level failures come back as `Ok(Failed)`. `Err` means the
    /// record was never looked at.
    async fn reconcile_one(&self, record: &IncomingRecord) -> DbResult<SyncOutcome> {
        let hash = content_hash(record);
        if record.id.trim().is_empty() || record.source_table.trim().is_empty() {
            return Ok(SyncOutcome::new(&record.id, OutcomeStatus::Failed, hash)
                .with_reason("record id and sourceTable must not be empty"));
        }
        self.ensure_schema().await?;

        let _guard = self.locks.lock(&record.id).await;
        let _write = match &self.write_gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };
        let mut conn = self.pool.acquire().await?;
        let now = format_timestamp(Utc::now());
        let source_updated_at = record.updated_at.map(format_timestamp);
        let payload = serde_json::Value::Object(record.payload.clone()).to_string();

        let applied: DbResult<Decision> = with_connection!(&mut *conn, c => {
            async {
                let mut tx = c.begin().await?;
                let existing = match sqlx::query(&self.sql.select_state)
                    .bind(record.id.as_str())
                    .fetch_optional(&mut *tx)
                    .await?
                {
                    Some(row) => Some(TrackedState::from_columns(
                        row.try_get::<String, _>(0)?,
                        &row.try_get::<String, _>(1)?,
                        row.try_get::<Option<String>, _>(2)?,
                    )?),
                    None => None,
                };

                let decision = decide(existing.as_ref(), record, &hash);
                if !matches!(decision, Decision::Apply { .. }) {
                    tx.rollback().await?;
                    return Ok(decision);
                }

                sqlx::query(&self.sql.upsert_target)
                    .bind(record.id.as_str())
                    .bind(record.source_table.as_str())
                    .bind(payload.as_str())
                    .bind(source_updated_at.as_deref())
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(&self.sql.upsert_tracking)
                    .bind(record.id.as_str())
                    .bind(record.source_table.as_str())
                    .bind(hash.as_str())
                    .bind(SyncStatus::Success.as_str())
                    .bind(now.as_str())
                    .bind(source_updated_at.as_deref())
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok::<_, DbError>(decision)
            }
            .await
        });

        let outcome = match applied {
            Ok(Decision::Apply { retried }) => {
                info!(record_id = %record.id, hash = %hash, retried, "Record applied");
                let mut outcome = SyncOutcome::new(&record.id, OutcomeStatus::Applied, &hash);
                outcome.retried = retried;
                outcome
            }
            Ok(Decision::SkipDuplicate) => {
                debug!(record_id = %record.id, "Record unchanged, skipped");
                SyncOutcome::new(&record.id, OutcomeStatus::SkippedDuplicate, &hash)
            }
            Ok(Decision::SkipStale) => {
                debug!(record_id = %record.id, "Record older than applied version, skipped");
                SyncOutcome::new(&record.id, OutcomeStatus::SkippedStale, &hash)
            }
            Ok(Decision::Conflict(reason)) => {
                let err = DbError::sync_conflict(&record.id, reason);
                warn!(record_id = %record.id, error = %err, "Sync conflict");
                SyncOutcome::new(&record.id, OutcomeStatus::Failed, &hash).with_reason(err.to_string())
            }
            Err(e) if e.poisons_connection() || e.is_retryable() => {
                conn.mark_unusable();
                conn.release().await;
                return Err(e);
            }
            Err(e) => {
                warn!(record_id = %record.id, error = %e, "Record apply failed");
                if let Err(mark_err) = self
                    .mark_failed(&mut conn, record, &hash, &now, source_updated_at.as_deref())
                    .await
                {
                    warn!(record_id = %record.id, error = %mark_err, "Could not record sync failure");
                }
                SyncOutcome::new(&record.id, OutcomeStatus::Failed, &hash).with_reason(e.client_message())
            }
        };

        conn.release().await;
        Ok(outcome)
    }

    /// The apply transaction rolled back; record the attempt on its own.
    async fn mark_failed(
        &self,
        conn: &mut DbConnection,
        record: &IncomingRecord,
        hash: &str,
        now: &str,
        source_updated_at: Option<&str>,
    ) -> DbResult<()> {
        with_connection!(conn, c => {
            sqlx::query(&self.sql.upsert_tracking)
                .bind(record.id.as_str())
                .bind(record.source_table.as_str())
                .bind(hash)
                .bind(SyncStatus::Failed.as_str())
                .bind(now)
                .bind(source_updated_at)
                .execute(&mut *c)
                .await
                .map(|_| ())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use serde_json::json;

    fn record(id: &str, payload: serde_json::Value) -> IncomingRecord {
        let serde_json::Value::Object(map) = payload else {
            panic!("payload must be an object");
        };
        IncomingRecord::new(id, "customers", map)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn tracked(hash: &str, status: SyncStatus, updated: Option<i64>) -> TrackedState {
        TrackedState {
            content_hash: hash.to_string(),
            status,
            source_updated_at: updated.map(at),
        }
    }

    #[test]
    fn test_decide_new_record_applies() {
        let r = record("1", json!({"a": 1}));
        assert_eq!(decide(None, &r, "h"), Decision::Apply { retried: false });
    }

    #[test]
    fn test_decide_same_hash() {
        let r = record("1", json!({"a": 1}));
        let ok = tracked("h", SyncStatus::Success, None);
        assert_eq!(decide(Some(&ok), &r, "h"), Decision::SkipDuplicate);

        let failed = tracked("h", SyncStatus::Failed, None);
        assert_eq!(decide(Some(&failed), &r, "h"), Decision::Apply { retried: true });
    }

    #[test]
    fn test_decide_timestamps() {
        let stored = tracked("old", SyncStatus::Success, Some(10));

        let older = record("1", json!({"a": 2})).updated_at(at(5));
        assert_eq!(decide(Some(&stored), &older, "new"), Decision::SkipStale);

        let same = record("1", json!({"a": 2})).updated_at(at(10));
        assert!(matches!(decide(Some(&stored), &same, "new"), Decision::Conflict(_)));

        let newer = record("1", json!({"a": 2})).updated_at(at(11));
        assert_eq!(decide(Some(&stored), &newer, "new"), Decision::Apply { retried: false });

        let untimed = record("1", json!({"a": 2}));
        assert_eq!(decide(Some(&stored), &untimed, "new"), Decision::Apply { retried: false });
    }

    #[test]
    fn test_decide_failed_with_new_content_is_not_stale() {
        let stored = tracked("old", SyncStatus::Failed, Some(10));
        let older = record("1", json!({"a": 2})).updated_at(at(5));
        assert_eq!(decide(Some(&stored), &older, "new"), Decision::Apply { retried: false });
    }

    #[tokio::test]
    async fn test_keyed_locks_serialize_and_clean_up() {
        let locks = Arc::new(KeyedLocks::default());
        let guard = locks.lock("a").await;
        assert_eq!(locks.len(), 1);

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.lock("a").await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        // Other keys are independent
        drop(locks.lock("b").await);

        drop(guard);
        contender.await.unwrap();
        assert_eq!(locks.len(), 0);
    }
}
