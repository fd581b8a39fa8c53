//! Similarity search over stored embeddings.
//!
//! A plain scan: every `(id, embedding)` row of the configured table is
//! streamed through the batch reader, scored by cosine similarity and kept in
//! a bounded min-heap of the best `top_k`.

use crate::config::{MAX_ROW_LIMIT, validate_identifier};
use crate::db::{ConnectionPool, Connector, DbConnection, QueryExecutor, SqlxConnector};
use crate::error::{DbError, DbResult};
use crate::models::{StatementRequest, VectorMatch};
use serde_json::Value as JsonValue;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;
use tracing::{debug, info};

/// Result of a search, best match first.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub matches: Vec<VectorMatch>,
    pub scanned: usize,
    pub skipped: usize,
}

pub struct VectorSearch<C: Connector = SqlxConnector> {
    pool: ConnectionPool<C>,
    executor: QueryExecutor,
    table: String,
}

impl<C> VectorSearch<C>
where
    C: Connector<Connection = DbConnection>,
{
    pub fn new(pool: ConnectionPool<C>, executor: QueryExecutor, table: impl Into<String>) -> DbResult<Self> {
        let table = table.into();
        validate_identifier(&table)
            .map_err(|e| DbError::configuration(format!("invalid vector table name: {e}")))?;
        Ok(Self {
            pool,
            executor,
            table,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Return the `top_k` stored embeddings most similar to `vector`.
    pub async fn search(&self, vector: &[f64], top_k: usize, timeout: Option<Duration>) -> DbResult<SearchResult> {
        if top_k == 0 {
            return Err(DbError::invalid_input("topK must be at least 1"));
        }
        if top_k > MAX_ROW_LIMIT as usize {
            return Err(DbError::invalid_input(format!(
                "topK must not exceed {MAX_ROW_LIMIT}"
            )));
        }
        let query_norm = norm(vector);
        if vector.is_empty() || query_norm == 0.0 || !query_norm.is_finite() {
            return Err(DbError::invalid_input(
                "query vector must be non-empty, finite and non-zero",
            ));
        }

        let mut request = StatementRequest::new(format!("SELECT id, embedding FROM {}", self.table));
        if let Some(timeout) = timeout {
            request = request.with_timeout(timeout);
        }
        let deadline = self.executor.deadline_for(&request);

        let mut conn = self.pool.acquire_until(deadline).await?;
        let mut heap: BinaryHeap<Reverse<Ranked>> = BinaryHeap::with_capacity(top_k + 1);
        let mut scanned = 0;
        let mut skipped = 0;

        let (outcome, timed_out) = {
            let mut batches = self.executor.stream(&request, &mut conn, deadline);
            let mut outcome = Ok(());
            while let Some(batch) = batches.next_batch().await {
                let batch = match batch {
                    Ok(batch) => batch,
                    Err(e) => {
                        outcome = Err(e);
                        break;
                    }
                };
                for mut row in batch.rows {
                    let seq = scanned;
                    scanned += 1;
                    let (Some(embedding), Some(id)) = (row.pop(), row.into_iter().next()) else {
                        skipped += 1;
                        continue;
                    };
                    let Some(score) = parse_embedding(&embedding)
                        .and_then(|candidate| cosine(vector, query_norm, &candidate))
                    else {
                        debug!(id = %id, "Skipping embedding with mismatched or malformed dimensions");
                        skipped += 1;
                        continue;
                    };
                    push_bounded(&mut heap, Ranked { score, seq, id }, top_k);
                }
            }
            (outcome, batches.timed_out())
        };

        if timed_out {
            conn.mark_unusable();
        }
        conn.release().await;
        outcome?;

        let mut ranked: Vec<Ranked> = heap.into_iter().map(|Reverse(r)| r).collect();
        ranked.sort_by(|a, b| b.cmp(a));
        let matches: Vec<VectorMatch> = ranked
            .into_iter()
            .map(|r| VectorMatch { id: r.id, score: r.score })
            .collect();

        info!(
            table = %self.table,
            scanned,
            skipped,
            returned = matches.len(),
            "Vector search complete"
        );
        Ok(SearchResult {
            matches,
            scanned,
            skipped,
        })
    }
}

/// Heap entry. Higher score wins; earlier rows win ties.
#[derive(Debug)]
struct Ranked {
    score: f64,
    seq: usize,
    id: JsonValue,
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

fn push_bounded(heap: &mut BinaryHeap<Reverse<Ranked>>, item: Ranked, limit: usize) {
    if heap.len() < limit {
        heap.push(Reverse(item));
        return;
    }
    if let Some(Reverse(smallest)) = heap.peek() {
        if item > *smallest {
            heap.pop();
            heap.push(Reverse(item));
        }
    }
}

/// Embeddings are stored as JSON arrays, either natively or as text.
fn parse_embedding(value: &JsonValue) -> Option<Vec<f64>> {
    let parsed;
    let array = match value {
        JsonValue::Array(items) => items,
        JsonValue::String(text) => {
            parsed = serde_json::from_str::<JsonValue>(text).ok()?;
            parsed.as_array()?
        }
        _ => return None,
    };
    array.iter().map(JsonValue::as_f64).collect()
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

fn cosine(query: &[f64], query_norm: f64, candidate: &[f64]) -> Option<f64> {
    if candidate.len() != query.len() {
        return None;
    }
    let candidate_norm = norm(candidate);
    if candidate_norm == 0.0 {
        return None;
    }
    let dot: f64 = query.iter().zip(candidate).map(|(a, b)| a * b).sum();
    let score = dot / (query_norm * candidate_norm);
    score.is_finite().then_some(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolOptions;
    use crate::db::PoolSettings;
    use crate::models::{ConnectionConfig, ExecutionDefaults};

    #[test]
    fn test_cosine() {
        let q = [1.0, 0.0];
        assert_eq!(cosine(&q, 1.0, &[2.0, 0.0]), Some(1.0));
        assert_eq!(cosine(&q, 1.0, &[0.0, 3.0]), Some(0.0));
        assert_eq!(cosine(&q, 1.0, &[1.0, 0.0, 0.0]), None);
        assert_eq!(cosine(&q, 1.0, &[0.0, 0.0]), None);
    }

    #[test]
    fn test_parse_embedding() {
        assert_eq!(parse_embedding(&serde_json::json!([1, 2.5])), Some(vec![1.0, 2.5]));
        assert_eq!(parse_embedding(&serde_json::json!("[0.5, 1]")), Some(vec![0.5, 1.0]));
        assert_eq!(parse_embedding(&serde_json::json!("not json")), None);
        assert_eq!(parse_embedding(&serde_json::json!([1, "x"])), None);
    }

    #[test]
    fn test_bounded_heap_keeps_best() {
        let mut heap = BinaryHeap::new();
        for (seq, score) in [0.1, 0.9, 0.5, 0.7, 0.2].into_iter().enumerate() {
            push_bounded(&mut heap, Ranked { score, seq, id: serde_json::json!(seq) }, 2);
        }
        let mut best: Vec<f64> = heap.into_iter().map(|Reverse(r)| r.score).collect();
        best.sort_by(|a, b| b.total_cmp(a));
        assert_eq!(best, vec![0.9, 0.7]);
    }

    async fn search(dir: &tempfile::TempDir) -> VectorSearch {
        let url = format!("sqlite:{}", dir.path().join("vectors.db").display());
        let config = ConnectionConfig::new("vec", &url, true, None, PoolOptions::default()).unwrap();
        let pool = ConnectionPool::new(
            "vec",
            crate::db::SqlxConnector::from_config(&config).unwrap(),
            PoolSettings::default(),
        );
        let executor = QueryExecutor::new(ExecutionDefaults {
            batch_size: 2,
            ..ExecutionDefaults::default()
        });

        let mut conn = pool.acquire().await.unwrap();
        let setup = StatementRequest::new(
            "CREATE TABLE embeddings (id TEXT PRIMARY KEY, embedding TEXT);
             INSERT INTO embeddings VALUES
                ('north', '[0, 1]'), ('east', '[1, 0]'), ('northeast', '[1, 1]'),
                ('broken', 'oops'), ('wide', '[1, 0, 0]'), ('south', '[0, -1]');",
        )
        .writable();
        executor.execute(&setup, &mut conn).await.unwrap();
        conn.release().await;

        VectorSearch::new(pool, executor, "embeddings").unwrap()
    }

    #[tokio::test]
    async fn test_search_ranks_by_similarity() {
        let dir = tempfile::tempdir().unwrap();
        let search = search(&dir).await;

        let result = search.search(&[0.0, 2.0], 2, None).await.unwrap();
        let ids: Vec<_> = result.matches.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec![serde_json::json!("north"), serde_json::json!("northeast")]);
        assert!((result.matches[0].score - 1.0).abs() < 1e-9);
        assert_eq!(result.scanned, 6);
        assert_eq!(result.skipped, 2);
    }

    #[tokio::test]
    async fn test_search_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let search = search(&dir).await;

        let err = search.search(&[0.0, 0.0], 3, None).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
        let err = search.search(&[1.0, 0.0], 0, None).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_table_name_must_be_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let search = search(&dir).await;
        let pool = search.pool.clone();
        assert!(VectorSearch::new(pool, QueryExecutor::default(), "x; DROP TABLE y").is_err());
    }
}
