//! Health reporting.
//!
//! A check acquires a connection with a short deadline, pings it and hands it
//! back. The whole check sits under a hard timeout, so a hung database turns
//! into a degraded report instead of a hung endpoint.

use crate::db::{ConnectionPool, Connector, SqlxConnector};
use crate::error::DbError;
use crate::models::{DependencyCheck, HealthSnapshot, HealthStatus};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct LastKnown {
    success: Option<DateTime<Utc>>,
    error: Option<String>,
}

/// Produces [`HealthSnapshot`]s for one pool.
pub struct HealthReporter<C: Connector = SqlxConnector> {
    pool: ConnectionPool<C>,
    timeout: Duration,
    last: Arc<Mutex<LastKnown>>,
}

impl<C: Connector> Clone for HealthReporter<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            timeout: self.timeout,
            last: Arc::clone(&self.last),
        }
    }
}

impl<C: Connector> HealthReporter<C> {
    pub fn new(pool: ConnectionPool<C>, timeout: Duration) -> Self {
        Self {
            pool,
            timeout,
            last: Arc::new(Mutex::new(LastKnown::default())),
        }
    }

    /// Probe the database and build a snapshot. Returns within the timeout.
    pub async fn check(&self) -> HealthSnapshot {
        let started = Instant::now();
        let deadline = started + self.timeout;

        let outcome = match tokio::time::timeout_at(deadline, self.probe(deadline)).await {
            Ok(result) => result,
            Err(_) => Err(DbError::timeout(
                "health probe",
                started.elapsed().as_millis() as u64,
            )),
        };
        let latency = started.elapsed();
        let latency_ms = latency.as_millis() as u64;

        let (status, error) = match outcome {
            Ok(()) if latency > self.timeout / 2 => (
                HealthStatus::Degraded,
                Some(format!("slow response: {}ms", latency_ms)),
            ),
            Ok(()) => (HealthStatus::Healthy, None),
            Err(e @ (DbError::PoolExhausted { .. } | DbError::ExecutionTimeout { .. })) => {
                (HealthStatus::Degraded, Some(e.to_string()))
            }
            Err(e) => (HealthStatus::Unhealthy, Some(e.to_string())),
        };

        let last_success = {
            let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
            match &error {
                None => {
                    last.success = Some(Utc::now());
                    last.error = None;
                }
                Some(e) => last.error = Some(e.clone()),
            }
            last.success
        };

        if status == HealthStatus::Healthy {
            debug!(pool = %self.pool.id(), latency_ms, "Health probe succeeded");
        } else {
            warn!(pool = %self.pool.id(), latency_ms, status = %status, error = ?error, "Health probe not healthy");
        }

        let mut checks = BTreeMap::new();
        checks.insert(
            self.pool.id().to_string(),
            DependencyCheck {
                status,
                latency_ms,
                error,
                pool: Some(self.pool.stats()),
            },
        );
        HealthSnapshot::from_checks(checks, last_success)
    }

    /// Error recorded by the most recent failing check, if the last check failed.
    pub fn last_error(&self) -> Option<String> {
        self.last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .error
            .clone()
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).success
    }

    async fn probe(&self, deadline: Instant) -> Result<(), DbError> {
        let mut conn = self.pool.acquire_until(deadline).await?;
        let result = conn.ping().await;
        // Returned from a spawned task so a slow release cannot stretch the check
        drop(conn);
        result
    }
}
