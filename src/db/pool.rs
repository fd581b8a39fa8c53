//! Connection pool management.
//!
//! A bounded set of reusable connections for one database. Capacity is gated
//! by a semaphore with `max_connections` permits; the idle/busy bookkeeping
//! lives behind a single mutex so `busy + idle + opening <= max` holds at every
//! observable point.
//!
//! Callers get a [`PooledConnection`] guard. `release().await` probes the
//! connection and parks it as idle (or discards it); dropping the guard does
//! the same from a spawned task.

use crate::config::PoolOptions;
use crate::db::connection::{Connector, SqlxConnector};
use crate::error::{DbError, DbResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const EXPECT_MSG: &str = "BUG: PooledConnection used after its connection was returned";

/// Bounded exponential backoff between connection attempts.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as i32;
        let ms = self.initial.as_millis() as f64 * self.multiplier.powi(exp);
        Duration::from_millis(ms.min(self.max.as_millis() as f64) as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

/// Resolved pool sizing and timing.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub min_connections: u32,
    pub max_connections: u32,
    /// Connections opened together when the pool has to grow
    pub increment: u32,
    pub acquire_timeout: Duration,
    /// Upper bound on retrying a failing connect
    pub connect_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    /// Liveness probe bound on release and before acquire
    pub probe_timeout: Duration,
    pub test_before_acquire: bool,
    pub backoff: Backoff,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            increment: 1,
            acquire_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(600)),
            probe_timeout: Duration::from_secs(2),
            test_before_acquire: true,
            backoff: Backoff::default(),
        }
    }
}

impl PoolSettings {
    /// Resolve URL pool options against backend defaults.
    pub fn from_options(
        options: &PoolOptions,
        is_sqlite: bool,
        connect_timeout: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            min_connections: options.min_connections_or_default(is_sqlite),
            max_connections: options.max_connections_or_default(is_sqlite),
            increment: options.pool_increment_or_default(),
            acquire_timeout: Duration::from_secs(options.acquire_timeout_or_default()),
            connect_timeout,
            idle_timeout: match options.idle_timeout_or_default() {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            probe_timeout,
            test_before_acquire: options.test_before_acquire_or_default(),
            backoff: Backoff::default(),
        }
    }

    fn normalized(mut self) -> Self {
        self.max_connections = self.max_connections.max(1);
        self.min_connections = self.min_connections.min(self.max_connections);
        self.increment = self.increment.max(1);
        self
    }
}

/// Bookkeeping attached to every live connection.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub acquired_at: Option<DateTime<Utc>>,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub min: u32,
    pub max: u32,
    pub increment: u32,
    pub idle: u32,
    pub busy: u32,
    /// Connections being opened for the idle set
    pub opening: u32,
    pub total_created: u64,
    pub total_discarded: u64,
}

impl PoolStats {
    pub fn live(&self) -> u32 {
        self.idle + self.busy + self.opening
    }
}

struct IdleConnection<T> {
    conn: T,
    meta: ConnectionMeta,
    idle_since: Instant,
}

struct PoolState<T> {
    idle: VecDeque<IdleConnection<T>>,
    /// Handed out, or being opened on behalf of a caller
    busy: u32,
    /// Being opened for the idle set (growth increment, warm-up, replenish)
    opening: u32,
    closed: bool,
    total_created: u64,
    total_discarded: u64,
}

impl<T> PoolState<T> {
    fn live(&self) -> u32 {
        self.idle.len() as u32 + self.busy + self.opening
    }
}

struct PoolInner<C: Connector> {
    id: String,
    connector: C,
    settings: PoolSettings,
    state: Mutex<PoolState<C::Connection>>,
    permits: Arc<Semaphore>,
    /// Signalled whenever a connection lands in the idle set or a reserved slot frees up
    changed: Notify,
    next_id: AtomicU64,
    replenishing: AtomicBool,
}

/// Bounded connection pool for one database.
pub struct ConnectionPool<C: Connector = SqlxConnector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.inner.id)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

enum Step<'a, T> {
    Take(IdleConnection<T>),
    Open { extra: u32 },
    Wait(std::pin::Pin<Box<tokio::sync::futures::Notified<'a>>>),
}

impl<C: Connector> ConnectionPool<C> {
    /// Create an empty pool. Call [`warm_up`](Self::warm_up) to open the minimum.
    pub fn new(id: impl Into<String>, connector: C, settings: PoolSettings) -> Self {
        let settings = settings.normalized();
        let permits = Arc::new(Semaphore::new(settings.max_connections as usize));
        Self {
            inner: Arc::new(PoolInner {
                id: id.into(),
                connector,
                settings,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    busy: 0,
                    opening: 0,
                    closed: false,
                    total_created: 0,
                    total_discarded: 0,
                }),
                permits,
                changed: Notify::new(),
                next_id: AtomicU64::new(1),
                replenishing: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    fn state(&self) -> MutexGuard<'_, PoolState<C::Connection>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state();
        let settings = &self.inner.settings;
        PoolStats {
            min: settings.min_connections,
            max: settings.max_connections,
            increment: settings.increment,
            idle: state.idle.len() as u32,
            busy: state.busy,
            opening: state.opening,
            total_created: state.total_created,
            total_discarded: state.total_discarded,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Acquire a connection, waiting at most the configured acquire timeout.
    pub async fn acquire(&self) -> DbResult<PooledConnection<C>> {
        self.acquire_until(Instant::now() + self.inner.settings.acquire_timeout)
            .await
    }

    /// Acquire a connection before `deadline` (capped by the acquire timeout).
    pub async fn acquire_until(&self, deadline: Instant) -> DbResult<PooledConnection<C>> {
        let started = Instant::now();
        let deadline = deadline.min(started + self.inner.settings.acquire_timeout);

        let permit =
            match tokio::time::timeout_at(deadline, self.inner.permits.clone().acquire_owned())
                .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    return Err(DbError::connectivity(
                        format!("Pool '{}' is closed", self.inner.id),
                        "The service is shutting down",
                    ));
                }
                Err(_) => {
                    debug!(pool = %self.inner.id, "Timed out waiting for a pool permit");
                    return Err(self.exhausted(started));
                }
            };

        loop {
            let mut expired = Vec::new();
            let step = {
                let mut state = self.state();
                let mut step = None;
                while let Some(idle) = state.idle.pop_back() {
                    if self.is_expired(&idle) {
                        state.total_discarded += 1;
                        expired.push(idle.conn);
                        continue;
                    }
                    state.busy += 1;
                    step = Some(Step::Take(idle));
                    break;
                }
                match step {
                    Some(step) => step,
                    None if state.live() < self.inner.settings.max_connections => {
                        let room = self.inner.settings.max_connections - state.live() - 1;
                        let extra = (self.inner.settings.increment - 1).min(room);
                        state.busy += 1;
                        state.opening += extra;
                        Step::Open { extra }
                    }
                    None => {
                        let mut notified = Box::pin(self.inner.changed.notified());
                        notified.as_mut().enable();
                        Step::Wait(notified)
                    }
                }
            };

            for conn in expired {
                debug!(pool = %self.inner.id, "Discarding connection past idle timeout");
                self.inner.connector.close(conn).await;
            }

            match step {
                Step::Take(mut idle) => {
                    if self.inner.settings.test_before_acquire
                        && self.probe(&mut idle.conn, deadline).await.is_err()
                    {
                        debug!(pool = %self.inner.id, conn_id = idle.meta.id, "Idle connection failed liveness check");
                        self.discard(idle.conn);
                        continue;
                    }
                    return Ok(self.hand_out(idle.conn, idle.meta, permit));
                }
                Step::Open { extra } => {
                    for _ in 0..extra {
                        self.spawn_grow();
                    }
                    match self.connect_with_backoff(deadline).await {
                        Ok((conn, meta)) => return Ok(self.hand_out(conn, meta, permit)),
                        Err(e) => {
                            {
                                let mut state = self.state();
                                state.busy -= 1;
                            }
                            self.inner.changed.notify_waiters();
                            return Err(e);
                        }
                    }
                }
                Step::Wait(notified) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(self.exhausted(started));
                    }
                }
            }
        }
    }

    /// Open the configured minimum number of connections.
    ///
    /// Returns how many connections were opened. Connections that did open stay
    /// in the pool even when others failed.
    pub async fn warm_up(&self) -> DbResult<u32> {
        let deadline = Instant::now() + self.inner.settings.connect_timeout;
        let opened = self.fill_to_min(deadline).await?;
        info!(
            pool = %self.inner.id,
            opened,
            min = self.inner.settings.min_connections,
            "Pool warmed up"
        );
        Ok(opened)
    }

    /// Stop handing out connections and close the idle ones.
    pub async fn close(&self) {
        self.inner.permits.close();
        let idle: Vec<_> = {
            let mut state = self.state();
            state.closed = true;
            state.total_discarded += state.idle.len() as u64;
            state.idle.drain(..).collect()
        };
        let count = idle.len();
        for entry in idle {
            self.inner.connector.close(entry.conn).await;
        }
        self.inner.changed.notify_waiters();
        info!(pool = %self.inner.id, closed = count, "Pool closed");
    }

    fn exhausted(&self, started: Instant) -> DbError {
        DbError::pool_exhausted(&self.inner.id, started.elapsed().as_millis() as u64)
    }

    fn is_expired(&self, idle: &IdleConnection<C::Connection>) -> bool {
        self.inner
            .settings
            .idle_timeout
            .is_some_and(|timeout| idle.idle_since.elapsed() >= timeout)
    }

    fn hand_out(
        &self,
        conn: C::Connection,
        mut meta: ConnectionMeta,
        permit: OwnedSemaphorePermit,
    ) -> PooledConnection<C> {
        meta.acquired_at = Some(Utc::now());
        debug!(pool = %self.inner.id, conn_id = meta.id, "Connection acquired");
        PooledConnection {
            conn: Some(conn),
            meta,
            pool: self.clone(),
            permit: Some(permit),
            unusable: false,
        }
    }

    async fn probe(&self, conn: &mut C::Connection, deadline: Instant) -> DbResult<()> {
        let bound = deadline.min(Instant::now() + self.inner.settings.probe_timeout);
        match tokio::time::timeout_at(bound, self.inner.connector.ping(conn)).await {
            Ok(result) => result,
            Err(_) => Err(DbError::timeout(
                "liveness probe",
                self.inner.settings.probe_timeout.as_millis() as u64,
            )),
        }
    }

    /// Open one connection, retrying with backoff until `deadline` or the connect timeout.
    async fn connect_with_backoff(
        &self,
        deadline: Instant,
    ) -> DbResult<(C::Connection, ConnectionMeta)> {
        let started = Instant::now();
        let deadline = deadline.min(started + self.inner.settings.connect_timeout);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match tokio::time::timeout_at(deadline, self.inner.connector.connect()).await {
                Ok(Ok(conn)) => {
                    let meta = ConnectionMeta {
                        id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
                        created_at: Utc::now(),
                        acquired_at: None,
                    };
                    self.state().total_created += 1;
                    debug!(pool = %self.inner.id, conn_id = meta.id, attempt, "Opened connection");
                    return Ok((conn, meta));
                }
                Ok(Err(e)) => {
                    let delay = self.inner.settings.backoff.delay(attempt);
                    if Instant::now() + delay >= deadline {
                        warn!(pool = %self.inner.id, attempt, error = %e, "Giving up on connect");
                        return Err(match e {
                            DbError::Connectivity { message, suggestion } => DbError::connectivity(
                                format!("{} (after {} attempts)", message, attempt),
                                suggestion,
                            ),
                            other => other,
                        });
                    }
                    debug!(
                        pool = %self.inner.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connect failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(_) => {
                    return Err(DbError::timeout(
                        "connect",
                        started.elapsed().as_millis() as u64,
                    ));
                }
            }
        }
    }

    fn spawn_grow(&self) {
        let pool = self.clone();
        tokio::spawn(async move {
            let deadline = Instant::now() + pool.inner.settings.connect_timeout;
            let result = pool.connect_with_backoff(deadline).await;
            pool.finish_opening(result.ok());
        });
    }

    /// Settle one reserved `opening` slot, parking the connection if there is one.
    fn finish_opening(&self, opened: Option<(C::Connection, ConnectionMeta)>) {
        let leftover = {
            let mut state = self.state();
            state.opening -= 1;
            match opened {
                Some((conn, meta)) if !state.closed => {
                    state.idle.push_back(IdleConnection {
                        conn,
                        meta,
                        idle_since: Instant::now(),
                    });
                    None
                }
                Some((conn, _)) => {
                    state.total_discarded += 1;
                    Some(conn)
                }
                None => None,
            }
        };
        self.inner.changed.notify_waiters();
        if let Some(conn) = leftover {
            let pool = self.clone();
            tokio::spawn(async move { pool.inner.connector.close(conn).await });
        }
    }

    async fn fill_to_min(&self, deadline: Instant) -> DbResult<u32> {
        let wanted = {
            let mut state = self.state();
            if state.closed {
                return Ok(0);
            }
            let settings = &self.inner.settings;
            let live = state.live();
            let wanted = settings
                .min_connections
                .saturating_sub(live)
                .min(settings.max_connections.saturating_sub(live));
            state.opening += wanted;
            wanted
        };

        let attempts = (0..wanted).map(|_| self.connect_with_backoff(deadline));
        let results = futures_util::future::join_all(attempts).await;

        let mut opened = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(conn) => {
                    opened += 1;
                    self.finish_opening(Some(conn));
                }
                Err(e) => {
                    self.finish_opening(None);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(opened),
        }
    }

    fn maybe_replenish(&self) {
        {
            let state = self.state();
            if state.closed || state.live() >= self.inner.settings.min_connections {
                return;
            }
        }
        if self.inner.replenishing.swap(true, Ordering::AcqRel) {
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move {
            let deadline = Instant::now() + pool.inner.settings.connect_timeout;
            if let Err(e) = pool.fill_to_min(deadline).await {
                warn!(pool = %pool.inner.id, error = %e, "Failed to replenish pool to its minimum");
            }
            pool.inner.replenishing.store(false, Ordering::Release);
        });
    }

    fn discard(&self, conn: C::Connection) {
        {
            let mut state = self.state();
            state.busy -= 1;
            state.total_discarded += 1;
        }
        self.inner.changed.notify_waiters();
        // A connection abandoned mid-statement may take as long to close as the statement runs
        let pool = self.clone();
        tokio::spawn(async move {
            pool.inner.connector.close(conn).await;
        });
        self.maybe_replenish();
    }

    /// Return a busy connection. Runs before the caller's permit is dropped.
    async fn give_back(&self, mut conn: C::Connection, meta: ConnectionMeta, unusable: bool) {
        if unusable {
            debug!(pool = %self.inner.id, conn_id = meta.id, "Discarding connection marked unusable");
            self.discard(conn);
            return;
        }
        let deadline = Instant::now() + self.inner.settings.probe_timeout;
        if let Err(e) = self.probe(&mut conn, deadline).await {
            debug!(pool = %self.inner.id, conn_id = meta.id, error = %e, "Discarding connection that failed liveness probe");
            self.discard(conn);
            return;
        }

        let leftover = {
            let mut state = self.state();
            state.busy -= 1;
            if state.closed {
                state.total_discarded += 1;
                Some(conn)
            } else {
                state.idle.push_back(IdleConnection {
                    conn,
                    meta,
                    idle_since: Instant::now(),
                });
                None
            }
        };
        self.inner.changed.notify_waiters();
        if let Some(conn) = leftover {
            self.inner.connector.close(conn).await;
        }
    }

    /// Synchronous fallback when a guard is dropped outside a runtime.
    fn forget(&self) {
        let mut state = self.state();
        state.busy -= 1;
        state.total_discarded += 1;
    }
}

/// A connection borrowed from a [`ConnectionPool`].
///
/// Prefer `release().await`; dropping the guard returns the connection from a
/// spawned task.
pub struct PooledConnection<C: Connector = SqlxConnector> {
    conn: Option<C::Connection>,
    meta: ConnectionMeta,
    pool: ConnectionPool<C>,
    permit: Option<OwnedSemaphorePermit>,
    unusable: bool,
}

impl<C: Connector> PooledConnection<C> {
    pub fn meta(&self) -> &ConnectionMeta {
        &self.meta
    }

    /// Mark the connection as being in an unknown state; it is discarded on release.
    pub fn mark_unusable(&mut self) {
        self.unusable = true;
    }

    pub fn is_unusable(&self) -> bool {
        self.unusable
    }

    /// Round-trip to the database, bounded by the pool's probe timeout.
    pub async fn ping(&mut self) -> DbResult<()> {
        let pool = self.pool.clone();
        let deadline = Instant::now() + pool.inner.settings.probe_timeout;
        let conn = self.conn.as_mut().expect(EXPECT_MSG);
        let result = pool.probe(conn, deadline).await;
        if result.is_err() {
            self.unusable = true;
        }
        result
    }

    /// Return the connection to the pool.
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            let permit = self.permit.take();
            self.pool
                .give_back(conn, self.meta.clone(), self.unusable)
                .await;
            drop(permit);
        }
    }
}

impl<C: Connector> std::ops::Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect(EXPECT_MSG)
    }
}

impl<C: Connector> std::ops::DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect(EXPECT_MSG)
    }
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.inner.id)
            .field("meta", &self.meta)
            .field("unusable", &self.unusable)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let permit = self.permit.take();
        let pool = self.pool.clone();
        let meta = self.meta.clone();
        let unusable = self.unusable;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.give_back(conn, meta, unusable).await;
                    drop(permit);
                });
            }
            Err(_) => {
                pool.forget();
                drop(conn);
                drop(permit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingConnector {
        opened: AtomicUsize,
        fail: AtomicBool,
        ping_fails: AtomicBool,
        closed: AtomicUsize,
    }

    impl Connector for Arc<CountingConnector> {
        type Connection = usize;

        async fn connect(&self) -> DbResult<usize> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DbError::connectivity("refused", "start the server"));
            }
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }

        async fn ping(&self, _conn: &mut usize) -> DbResult<()> {
            if self.ping_fails.load(Ordering::SeqCst) {
                Err(DbError::connectivity("gone", "reconnect"))
            } else {
                Ok(())
            }
        }

        async fn close(&self, _conn: usize) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn settings(min: u32, max: u32) -> PoolSettings {
        PoolSettings {
            min_connections: min,
            max_connections: max,
            acquire_timeout: Duration::from_millis(300),
            connect_timeout: Duration::from_millis(300),
            backoff: Backoff {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(40),
                multiplier: 2.0,
            },
            ..PoolSettings::default()
        }
    }

    #[test]
    fn test_backoff_is_bounded() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(1), Duration::from_millis(50));
        assert_eq!(backoff.delay(2), Duration::from_millis(100));
        assert_eq!(backoff.delay(3), Duration::from_millis(200));
        assert_eq!(backoff.delay(30), Duration::from_secs(2));
    }

    #[test]
    fn test_settings_normalized() {
        let s = PoolSettings {
            min_connections: 9,
            max_connections: 0,
            increment: 0,
            ..PoolSettings::default()
        }
        .normalized();
        assert_eq!(s.max_connections, 1);
        assert_eq!(s.min_connections, 1);
        assert_eq!(s.increment, 1);
    }

    #[tokio::test]
    async fn test_warm_up_opens_minimum() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new("t", connector.clone(), settings(3, 5));

        assert_eq!(pool.warm_up().await.unwrap(), 3);
        let stats = pool.stats();
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.busy, 0);
        assert_eq!(connector.opened.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_release_reuses_connection() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new("t", connector.clone(), settings(0, 2));

        let conn = pool.acquire().await.unwrap();
        let first = *conn;
        assert_eq!(pool.stats().busy, 1);
        conn.release().await;
        assert_eq!(pool.stats().idle, 1);

        let again = pool.acquire().await.unwrap();
        assert_eq!(*again, first);
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
        again.release().await;
    }

    #[tokio::test]
    async fn test_unusable_connection_is_discarded() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new("t", connector.clone(), settings(0, 2));

        let mut conn = pool.acquire().await.unwrap();
        conn.mark_unusable();
        conn.release().await;

        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.total_discarded, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_probe_on_release_discards() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new("t", connector.clone(), settings(0, 2));

        let conn = pool.acquire().await.unwrap();
        connector.ping_fails.store(true, Ordering::SeqCst);
        conn.release().await;

        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().total_discarded, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_connectivity_error() {
        let connector = Arc::new(CountingConnector::default());
        connector.fail.store(true, Ordering::SeqCst);
        let pool = ConnectionPool::new("t", connector, settings(0, 2));

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, DbError::Connectivity { .. }), "got {err:?}");
        assert!(err.to_string().contains("attempts"));
        assert_eq!(pool.stats().busy, 0);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new("t", connector, settings(0, 1));

        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, DbError::PoolExhausted { .. }));
        held.release().await;
    }

    #[tokio::test]
    async fn test_increment_opens_extra_idle_connections() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new(
            "t",
            connector.clone(),
            PoolSettings {
                increment: 3,
                ..settings(0, 4)
            },
        );

        let conn = pool.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = pool.stats();
        assert_eq!(stats.busy, 1);
        assert_eq!(stats.idle, 2);
        assert!(stats.live() <= stats.max);
        conn.release().await;
    }

    #[tokio::test]
    async fn test_drop_returns_connection() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new("t", connector, settings(0, 1));

        {
            let _conn = pool.acquire().await.unwrap();
        }
        let again = tokio::time::timeout(Duration::from_secs(1), pool.acquire())
            .await
            .unwrap()
            .unwrap();
        again.release().await;
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_acquire() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new("t", connector, settings(1, 2));
        pool.warm_up().await.unwrap();
        pool.close().await;

        assert!(pool.is_closed());
        assert_eq!(pool.stats().idle, 0);
        assert!(matches!(
            pool.acquire().await,
            Err(DbError::Connectivity { .. })
        ));
    }

    #[tokio::test]
    async fn test_discard_below_min_replenishes() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new("t", connector.clone(), settings(1, 2));
        pool.warm_up().await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        conn.mark_unusable();
        conn.release().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
    }
}
