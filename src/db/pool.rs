//! Connection pool management.
//!
//! This module owns the single pooled connection handle used by the tool
//! layer. Pools are database-specific (MySqlPool, PgPool, SqlitePool) to keep
//! full type support. [`ConnectionManager`] acquires the pool lazily with
//! exponential backoff and reports health without touching the network.

use crate::db::connector::{Connector, Sleeper, SqlxConnector, TokioSleeper, backoff_delay};
use crate::error::{DbError, DbResult};
use crate::models::{
    AuthMode, ConnectionConfig, ConnectionDescriptor, ConnectionPhase, DatabaseType,
    HealthSnapshot, PoolHealth, TrustDecision,
};
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, PgPool, SqlitePool};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{error, info, warn};

/// Upper bound for graceful pool shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    /// Close the connection pool.
    pub async fn close(&self) {
        impl_db_dispatch!(self, {
            MySql(p) => p.close().await,
            Postgres(p) => p.close().await,
            SQLite(p) => p.close().await,
        })
    }

    /// Get the database type for this pool.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbPool::MySql(_) => DatabaseType::MySQL,
            DbPool::Postgres(_) => DatabaseType::PostgreSQL,
            DbPool::SQLite(_) => DatabaseType::SQLite,
        }
    }

    pub fn is_closed(&self) -> bool {
        impl_db_dispatch!(self, {
            MySql(p) => p.is_closed(),
            Postgres(p) => p.is_closed(),
            SQLite(p) => p.is_closed(),
        })
    }

    /// Open connections (idle and checked out).
    pub fn size(&self) -> u32 {
        impl_db_dispatch!(self, {
            MySql(p) => p.size(),
            Postgres(p) => p.size(),
            SQLite(p) => p.size(),
        })
    }

    pub fn num_idle(&self) -> u32 {
        let idle = impl_db_dispatch!(self, {
            MySql(p) => p.num_idle(),
            Postgres(p) => p.num_idle(),
            SQLite(p) => p.num_idle(),
        });
        u32::try_from(idle).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Default)]
struct ManagerState {
    pool: Option<DbPool>,
    phase: ConnectionPhase,
    auth: Option<AuthMode>,
    trust: Option<TrustDecision>,
    last_connected_at: Option<DateTime<Utc>>,
}

/// Decrements the waiting-caller count on every exit path of `connect()`.
struct PendingGuard<'a>(&'a AtomicU32);

impl<'a> PendingGuard<'a> {
    fn enter(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owns the pooled connection handle.
///
/// `connect()` returns the live pool when there is one and otherwise runs the
/// acquisition loop. Concurrent callers are serialized so only one loop runs
/// at a time; the rest reuse its result.
pub struct ConnectionManager {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    sleeper: Arc<dyn Sleeper>,
    state: RwLock<ManagerState>,
    connect_lock: tokio::sync::Mutex<()>,
    pending: AtomicU32,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("phase", &self.read_state().phase)
            .field("pending", &self.pending.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager that connects with sqlx and sleeps on the tokio timer.
    pub fn new(config: ConnectionConfig) -> Self {
        let connector = SqlxConnector::new(config.connect_timeout);
        Self::with_connector(config, Arc::new(connector), Arc::new(TokioSleeper))
    }

    /// Create a manager with explicit connector and sleeper implementations.
    pub fn with_connector(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            config,
            connector,
            sleeper,
            state: RwLock::new(ManagerState::default()),
            connect_lock: tokio::sync::Mutex::new(()),
            pending: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, ManagerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, ManagerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_pool(&self) -> Option<DbPool> {
        self.read_state()
            .pool
            .as_ref()
            .filter(|pool| !pool.is_closed())
            .cloned()
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        self.write_state().phase = phase;
    }

    /// Return the live pool, connecting with retries if there is none.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ConnectionExhausted`] once `max_retries` attempts
    /// have failed. Errors that retrying cannot fix, such as an unparseable
    /// URL, are returned after the first attempt.
    pub async fn connect(&self) -> DbResult<DbPool> {
        if let Some(pool) = self.live_pool() {
            return Ok(pool);
        }

        let _pending = PendingGuard::enter(&self.pending);
        let _serialized = self.connect_lock.lock().await;

        // Another caller may have finished while we waited
        if let Some(pool) = self.live_pool() {
            return Ok(pool);
        }

        let descriptor = ConnectionDescriptor::build(&self.config)?;
        {
            let mut state = self.write_state();
            state.phase = ConnectionPhase::Connecting;
            state.auth = Some(descriptor.auth.clone());
            state.trust = Some(descriptor.trust);
        }

        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 1;
        loop {
            info!(
                attempt,
                max_attempts,
                db_type = %descriptor.db_type,
                url = %descriptor.masked_url(),
                auth_mode = descriptor.auth.name(),
                "Connecting to database"
            );

            let outcome = match tokio::time::timeout(
                self.config.connect_timeout,
                self.connector.connect(&descriptor, &self.config.pool_options),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(DbError::timeout(
                    "connect",
                    u32::try_from(self.config.connect_timeout.as_secs()).unwrap_or(u32::MAX),
                )),
            };

            match outcome {
                Ok(pool) => {
                    let mut state = self.write_state();
                    state.pool = Some(pool.clone());
                    state.phase = ConnectionPhase::Connected;
                    state.last_connected_at = Some(Utc::now());
                    info!(attempt, db_type = %descriptor.db_type, "Connected successfully");
                    return Ok(pool);
                }
                Err(e) if !e.is_retryable() => {
                    error!(attempt, error = %e, "Connection failed with a non-retryable error");
                    self.set_phase(ConnectionPhase::Idle);
                    return Err(e);
                }
                Err(e) if attempt < max_attempts => {
                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Connection attempt failed, retrying"
                    );
                    self.set_phase(ConnectionPhase::RetryWait);
                    self.sleeper.sleep(delay).await;
                    self.set_phase(ConnectionPhase::Connecting);
                    attempt += 1;
                }
                Err(e) => {
                    error!(attempts = attempt, error = %e, "Connection attempts exhausted");
                    self.set_phase(ConnectionPhase::Idle);
                    return Err(DbError::connection_exhausted(attempt, e.to_string()));
                }
            }
        }
    }

    /// Close the pool. Safe to call repeatedly; shutdown problems are logged.
    pub async fn close(&self) {
        let pool = {
            let mut state = self.write_state();
            state.phase = ConnectionPhase::Closed;
            state.pool.take()
        };

        let Some(pool) = pool else {
            return;
        };

        match tokio::time::timeout(CLOSE_TIMEOUT, pool.close()).await {
            Ok(()) => info!(db_type = %pool.db_type(), "Connection pool closed"),
            Err(_) => warn!(
                timeout_secs = CLOSE_TIMEOUT.as_secs(),
                "Timed out waiting for connection pool to close"
            ),
        }
    }

    /// Whether a live pool is currently held.
    pub fn is_active(&self) -> bool {
        self.live_pool().is_some()
    }

    /// Snapshot of connection state and pool occupancy. Performs no I/O.
    pub fn health(&self) -> HealthSnapshot {
        let pending = self.pending.load(Ordering::SeqCst);
        let state = self.read_state();
        let live = state.pool.as_ref().filter(|pool| !pool.is_closed());

        let pool = match live {
            None => PoolHealth::NoPool,
            Some(pool) => {
                let size = pool.size();
                let available = pool.num_idle().min(size);
                PoolHealth::Active {
                    size,
                    available,
                    pending,
                    borrowed: size - available,
                }
            }
        };

        HealthSnapshot {
            connected: live.is_some(),
            connecting: matches!(
                state.phase,
                ConnectionPhase::Connecting | ConnectionPhase::RetryWait
            ),
            phase: state.phase,
            auth_mode: state.auth.clone(),
            trust: state.trust,
            pool,
            last_connected_at: state.last_connected_at,
        }
    }
}
