//! Reconciliation against a real SQLite database.

mod common;

use chrono::{DateTime, Utc};
use common::{reconciler, sqlite_pool};
use query_gateway::db::{ConnectionPool, PoolSettings};
use query_gateway::models::{IncomingRecord, OutcomeStatus, SyncStatus};
use serde_json::json;
use std::sync::Arc;

fn record(id: &str, payload: serde_json::Value, updated_at: &str) -> IncomingRecord {
    let serde_json::Value::Object(payload) = payload else {
        panic!("payload must be an object");
    };
    IncomingRecord::new(id, "customers", payload).updated_at(ts(updated_at))
}

fn ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value).unwrap().with_timezone(&Utc)
}

async fn exec(pool: &ConnectionPool, sql: &str) {
    let mut conn = pool.acquire().await.unwrap();
    query_gateway::with_connection!(&mut *conn, c => {
        sqlx::query(sql).execute(&mut *c).await.unwrap();
    });
    conn.release().await;
}

async fn target_payload(pool: &ConnectionPool, id: &str) -> Option<String> {
    let mut conn = pool.acquire().await.unwrap();
    let payload = query_gateway::with_connection!(&mut *conn, c => {
        sqlx::query_scalar::<_, String>("SELECT payload FROM sync_documents WHERE record_id = ?")
            .bind(id)
            .fetch_optional(&mut *c)
            .await
            .unwrap()
    });
    conn.release().await;
    payload
}

#[tokio::test]
async fn test_same_payload_twice_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir, PoolSettings::default()).await;
    let sync = reconciler(&pool);
    let r = record("c1", json!({"name": "Ada", "tier": "gold"}), "2024-05-01T10:00:00Z");

    let first = sync.reconcile(std::slice::from_ref(&r)).await;
    let after_first = sync.lookup("c1").await.unwrap().unwrap();
    let second = sync.reconcile(&[r]).await;
    let after_second = sync.lookup("c1").await.unwrap().unwrap();

    assert_eq!(first[0].status, OutcomeStatus::Applied);
    assert_eq!(second[0].status, OutcomeStatus::SkippedDuplicate);
    assert_eq!(first[0].content_hash, second[0].content_hash);
    assert_eq!(after_first.content_hash, after_second.content_hash);
    assert_eq!(after_second.status, SyncStatus::Success);
    assert_eq!(after_first.last_synced_at, after_second.last_synced_at);
}

#[tokio::test]
async fn test_key_order_does_not_change_hash() {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir, PoolSettings::default()).await;
    let sync = reconciler(&pool);

    let a = record("c2", json!({"a": 1, "b": {"x": 1, "y": 2}}), "2024-05-01T10:00:00Z");
    let b = record("c2", json!({"b": {"y": 2, "x": 1}, "a": 1}), "2024-05-01T11:00:00Z");

    let outcomes = sync.reconcile(&[a, b]).await;
    assert_eq!(outcomes[0].status, OutcomeStatus::Applied);
    assert_eq!(outcomes[1].status, OutcomeStatus::SkippedDuplicate);
}

#[tokio::test]
async fn test_newer_content_applies_and_older_is_stale() {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir, PoolSettings::default()).await;
    let sync = reconciler(&pool);

    let v1 = record("c3", json!({"name": "v1"}), "2024-05-01T10:00:00Z");
    let v2 = record("c3", json!({"name": "v2"}), "2024-05-02T10:00:00Z");
    let old = record("c3", json!({"name": "v0"}), "2024-04-01T10:00:00Z");

    let outcomes = sync.reconcile(&[v1, v2, old]).await;
    let statuses: Vec<_> = outcomes.iter().map(|o| o.status).collect();
    assert_eq!(
        statuses,
        vec![
            OutcomeStatus::Applied,
            OutcomeStatus::Applied,
            OutcomeStatus::SkippedStale
        ]
    );

    let stored = sync.lookup("c3").await.unwrap().unwrap();
    assert_eq!(stored.content_hash, outcomes[1].content_hash);
    assert_eq!(stored.source_updated_at, Some(ts("2024-05-02T10:00:00Z")));
    assert_eq!(target_payload(&pool, "c3").await.unwrap(), r#"{"name":"v2"}"#);
}

#[tokio::test]
async fn test_same_timestamp_different_content_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir, PoolSettings::default()).await;
    let sync = reconciler(&pool);

    let a = record("c4", json!({"name": "a"}), "2024-05-01T10:00:00Z");
    let b = record("c4", json!({"name": "b"}), "2024-05-01T10:00:00Z");

    let outcomes = sync.reconcile(&[a, b]).await;
    assert_eq!(outcomes[1].status, OutcomeStatus::Failed);
    assert!(outcomes[1].reason.as_deref().unwrap().contains("Sync conflict"));

    let stored = sync.lookup("c4").await.unwrap().unwrap();
    assert_eq!(stored.content_hash, outcomes[0].content_hash);
    assert_eq!(stored.status, SyncStatus::Success);
}

#[tokio::test]
async fn test_same_nanosecond_timestamp_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir, PoolSettings::default()).await;
    let sync = reconciler(&pool);

    let a = record("c5", json!({"v": 1}), "2024-05-01T10:00:00.123456789Z");
    let b = record("c5", json!({"v": 2}), "2024-05-01T10:00:00.123456789Z");

    let first = sync.reconcile(&[a]).await;
    assert_eq!(first[0].status, OutcomeStatus::Applied);
    let stored = sync.lookup("c5").await.unwrap().unwrap();
    assert_eq!(stored.source_updated_at, Some(ts("2024-05-01T10:00:00.123456789Z")));

    let second = sync.reconcile(&[b]).await;
    assert_eq!(second[0].status, OutcomeStatus::Failed);
    assert!(second[0].reason.as_deref().unwrap().contains("Sync conflict"));
    assert_eq!(target_payload(&pool, "c5").await.unwrap(), r#"{"v":1}"#);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_batches_all_apply() {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir, PoolSettings::default()).await;
    let sync = Arc::new(reconciler(&pool));
    sync.ensure_schema().await.unwrap();

    let tasks: Vec<_> = (0..4)
        .map(|batch| {
            let sync = Arc::clone(&sync);
            tokio::spawn(async move {
                let records: Vec<IncomingRecord> = (0..25)
                    .map(|i| record(&format!("t{batch}-{i}"), json!({"n": i}), "2024-05-01T10:00:00Z"))
                    .collect();
                sync.reconcile(&records).await
            })
        })
        .collect();

    for task in tasks {
        let outcomes = task.await.unwrap();
        assert_eq!(outcomes.len(), 25);
        for outcome in &outcomes {
            assert_eq!(outcome.status, OutcomeStatus::Applied, "{:?}", outcome.reason);
        }
    }
    for batch in 0..4 {
        for i in 0..25 {
            let stored = sync.lookup(&format!("t{batch}-{i}")).await.unwrap().unwrap();
            assert_eq!(stored.status, SyncStatus::Success);
        }
    }
}

#[tokio::test]
async fn test_failed_apply_is_recorded_then_retried() {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir, PoolSettings::default()).await;
    let sync = reconciler(&pool);
    sync.ensure_schema().await.unwrap();
    exec(
        &pool,
        "CREATE TRIGGER reject_poison BEFORE INSERT ON sync_documents \
         WHEN NEW.record_id = 'poison' BEGIN SELECT RAISE(ABORT, 'poisoned record'); END",
    )
    .await;

    let r = record("poison", json!({"name": "bad"}), "2024-05-01T10:00:00Z");
    let outcomes = sync.reconcile(std::slice::from_ref(&r)).await;
    assert_eq!(outcomes[0].status, OutcomeStatus::Failed);
    assert!(outcomes[0].reason.as_deref().unwrap().contains("poisoned record"));

    let stored = sync.lookup("poison").await.unwrap().unwrap();
    assert_eq!(stored.status, SyncStatus::Failed);
    assert_eq!(stored.content_hash, outcomes[0].content_hash);
    assert!(target_payload(&pool, "poison").await.is_none());

    exec(&pool, "DROP TRIGGER reject_poison").await;
    let retried = sync.reconcile(&[r]).await;
    assert_eq!(retried[0].status, OutcomeStatus::Applied);
    assert!(retried[0].retried);
    assert_eq!(
        sync.lookup("poison").await.unwrap().unwrap().status,
        SyncStatus::Success
    );
}

#[tokio::test]
async fn test_invalid_record_fails_without_touching_tables() {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir, PoolSettings::default()).await;
    let sync = reconciler(&pool);

    let outcomes = sync
        .reconcile(&[record("", json!({"x": 1}), "2024-05-01T10:00:00Z")])
        .await;
    assert_eq!(outcomes[0].status, OutcomeStatus::Failed);
}

#[tokio::test]
async fn test_resumable_batch_resumes_after_last_completed_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir, PoolSettings::default()).await;
    let sync = reconciler(&pool);
    let records: Vec<_> = (0..5)
        .map(|i| record(&format!("r{i}"), json!({"n": i}), "2024-05-01T10:00:00Z"))
        .collect();

    // An earlier run finished the first chunk and then stopped
    let mut progress = sync.workflow().load("sync:batch-1", 3).await.unwrap();
    sync.workflow().complete_step(&mut progress, 0).await.unwrap();

    let report = sync
        .reconcile_resumable("batch-1", &records, 2)
        .await
        .unwrap();
    assert_eq!(report.resumed_from, Some(1));
    assert_eq!(report.chunks_total, 3);
    assert_eq!(report.chunks_run, 2);
    let ids: Vec<_> = report.outcomes.iter().map(|o| o.record_id.as_str()).collect();
    assert_eq!(ids, vec!["r2", "r3", "r4"]);
    assert!(sync.lookup("r0").await.unwrap().is_none());
    assert!(sync.lookup("r4").await.unwrap().is_some());

    let again = sync
        .reconcile_resumable("batch-1", &records, 2)
        .await
        .unwrap();
    assert_eq!(again.chunks_run, 0);
    assert!(again.outcomes.is_empty());
}

#[tokio::test]
async fn test_resumable_batch_from_scratch() {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir, PoolSettings::default()).await;
    let sync = reconciler(&pool);
    let records: Vec<_> = (0..3)
        .map(|i| record(&format!("s{i}"), json!({"n": i}), "2024-05-01T10:00:00Z"))
        .collect();

    let report = sync
        .reconcile_resumable("batch-2", &records, 10)
        .await
        .unwrap();
    assert_eq!(report.resumed_from, None);
    assert_eq!(report.chunks_run, 1);
    assert!(
        report
            .outcomes
            .iter()
            .all(|o| o.status == OutcomeStatus::Applied)
    );
}
