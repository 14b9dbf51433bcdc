//! Pool manager (spec component E): checks connections out of the driver
//! under a capacity limit, applies session parameters on acquire, and hands
//! callers either an implicit per-call connection ([`Pool`] itself, via
//! [`Queryable`]) or a pinned [`PooledConnection`]/[`Transaction`].
//!
//! The capacity limit and the release-on-drop pattern are grounded on
//! `deadpool`'s managed-pool shape (`examples/other_examples/1d344738_bikeshedder-deadpool__postgres-src-lib.rs.rs`),
//! generalized here to wrap the crate's own [`Driver`] seam rather than
//! `tokio_postgres::Client` directly — `Drop` can't run an async release
//! call, so it spawns one instead (the same trick `ManagedConnection`'s own
//! cleanup would need if it had one).

use crate::config::PoolConfig;
use crate::driver::{ConnectionId, Driver, SessionParameters};
use crate::error::SlonikError;
use crate::handle::{BusyGuard, Queryable};
use crate::interceptor::ConnectionKind;
use crate::interpreter::interpret;
use crate::pipeline::{self, backoff, PipelineContext, QueryResult};
use crate::row::TypeRegistry;
use crate::stream::{self, RowStream, RowStreamExt};
use crate::token::SqlToken;
use crate::transaction::Transaction;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// A point-in-time snapshot of the pool's capacity (spec §3: `{active, idle,
/// waiting, ended}`; spec §6: `getPoolState()`). `waiting_client_count` is
/// always reported as `0`: `tokio::sync::Semaphore` doesn't expose its
/// waiter count, so there is no cheap way to report it without tracking it
/// ourselves at every acquire/release, which this pool doesn't currently do.
#[derive(Debug, Clone, Copy)]
pub struct PoolState {
    pub ended: bool,
    pub max_pool_size: u32,
    pub active_connection_count: u32,
    pub idle_connection_count: u32,
    pub waiting_client_count: u32,
}

pub(crate) struct PoolInner {
    pub(crate) pool_id: Uuid,
    pub(crate) config: PoolConfig,
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) registry: TypeRegistry,
    semaphore: Arc<Semaphore>,
    ended: AtomicBool,
}

impl PoolInner {
    /// Checks a connection out: waits for capacity, retries acquisition up
    /// to `connection_retry_limit` times, then applies the configured
    /// session parameters (spec §4.E).
    pub(crate) async fn checkout(&self) -> Result<ConnectionLease, SlonikError> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(SlonikError::PoolEnded);
        }

        let acquire_permit = self.semaphore.clone().acquire_owned();
        let permit = match self.config.connection_timeout.as_duration() {
            Some(timeout) => tokio::time::timeout(timeout, acquire_permit)
                .await
                .map_err(|_| SlonikError::Connection {
                    message: "timed out waiting for a free slot in the pool".to_string(),
                    source: None,
                })?,
            None => acquire_permit.await,
        }
        .map_err(|_| SlonikError::PoolEnded)?;

        if self.ended.load(Ordering::SeqCst) {
            return Err(SlonikError::PoolEnded);
        }

        let mut last_err = None;
        for attempt in 0..=self.config.connection_retry_limit {
            if attempt > 0 {
                tokio::time::sleep(backoff(attempt)).await;
            }

            let acquired = match self.config.connection_timeout.as_duration() {
                Some(timeout) => match tokio::time::timeout(timeout, self.driver.acquire()).await {
                    Ok(result) => result,
                    Err(_) => {
                        last_err = Some(SlonikError::Connection {
                            message: "connection attempt timed out".to_string(),
                            source: None,
                        });
                        continue;
                    }
                },
                None => self.driver.acquire().await,
            };

            match acquired {
                Ok(connection_id) => {
                    let params = SessionParameters {
                        statement_timeout: self.config.statement_timeout.as_duration(),
                        idle_in_transaction_session_timeout: self.config.idle_in_transaction_session_timeout.as_duration(),
                    };
                    self.driver.set_session_parameters(connection_id, &params).await?;
                    tracing::debug!(pool_id = %self.pool_id, %connection_id, attempt, "connection acquired");
                    return Ok(ConnectionLease::new(connection_id, self.driver.clone(), permit));
                }
                Err(err) => {
                    tracing::warn!(pool_id = %self.pool_id, attempt, error = %err, "connection acquisition attempt failed");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| SlonikError::Connection {
            message: "failed to acquire a connection".to_string(),
            source: None,
        }))
    }
}

/// A checked-out connection. Releasing it back to the driver happens on
/// `Drop` rather than requiring every call site to remember to release —
/// `Drop::drop` can't be `async`, so it spawns the release instead (spec
/// invariant: every acquired connection is released on every exit path,
/// including a panicking handler).
pub(crate) struct ConnectionLease {
    pub(crate) connection_id: ConnectionId,
    driver: Arc<dyn Driver>,
    _permit: OwnedSemaphorePermit,
    destroy: AtomicBool,
    released: AtomicBool,
}

impl ConnectionLease {
    fn new(connection_id: ConnectionId, driver: Arc<dyn Driver>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            connection_id,
            driver,
            _permit: permit,
            destroy: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    /// Marks the connection to be dropped rather than recycled once released
    /// (e.g. after `BackendTerminated`).
    pub(crate) fn mark_for_destruction(&self) {
        self.destroy.store(true, Ordering::SeqCst);
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let driver = self.driver.clone();
        let connection_id = self.connection_id;
        let destroy = self.destroy.load(Ordering::SeqCst);
        tokio::spawn(async move {
            tracing::debug!(%connection_id, destroy, "releasing connection");
            driver.release(connection_id, destroy).await;
        });
    }
}

fn should_destroy(err: &SlonikError) -> bool {
    matches!(err, SlonikError::BackendTerminated { .. })
}

/// The entry point of the crate (spec §2: `Pool`): owns the driver and the
/// capacity semaphore, and is itself a [`Queryable`] — a bare `pool.one(...)`
/// checks a connection out implicitly, runs the query, and releases it.
#[derive(Clone)]
pub struct Pool(pub(crate) Arc<PoolInner>);

impl Pool {
    pub fn new(config: PoolConfig, driver: Arc<dyn Driver>) -> Self {
        let mut registry = TypeRegistry::new();
        for parser in &config.type_parsers {
            registry.register(parser.clone());
        }
        let semaphore = Arc::new(Semaphore::new(config.maximum_pool_size as usize));
        Self(Arc::new(PoolInner {
            pool_id: Uuid::new_v4(),
            config,
            driver,
            registry,
            semaphore,
            ended: AtomicBool::new(false),
        }))
    }

    pub fn configuration(&self) -> &PoolConfig {
        &self.0.config
    }

    pub fn state(&self) -> PoolState {
        let idle_connection_count = self.0.semaphore.available_permits() as u32;
        PoolState {
            ended: self.0.ended.load(Ordering::SeqCst),
            max_pool_size: self.0.config.maximum_pool_size,
            active_connection_count: self.0.config.maximum_pool_size.saturating_sub(idle_connection_count),
            idle_connection_count,
            waiting_client_count: 0,
        }
    }

    /// Streams rows in batches from a server-side cursor, checking out a
    /// connection for the duration of the stream (spec §6: `DatabasePool.stream`).
    pub async fn stream(&self, token: SqlToken, batch_size: u32) -> Result<RowStream, SlonikError> {
        let lease = Arc::new(self.0.checkout().await?);
        let stream = stream::stream(self.0.driver.as_ref(), lease.connection_id, &self.0.registry, token, batch_size).await?;
        Ok(stream.keep_alive(lease))
    }

    /// Streams `rows` into `sql` via binary `COPY FROM STDIN`, checking out a
    /// connection for the duration of the call (spec §6: `DatabasePool.copyFromBinary`).
    pub async fn copy_from_binary(
        &self,
        sql: &str,
        column_types: &[String],
        rows: &[Vec<crate::token::PrimitiveValue>],
    ) -> Result<crate::copy::CopyOutcome, SlonikError> {
        let lease = self.0.checkout().await?;
        crate::copy::copy_from_binary(self.0.driver.as_ref(), lease.connection_id, sql, column_types, rows).await
    }

    /// Stops handing out new connections, then waits for every connection
    /// already checked out to be released before returning (spec §4.E:
    /// `end()` waits for active connections to drain; spec §8 invariant 4).
    /// Idempotent: once `ended` is set, a second call just re-drains, which
    /// resolves immediately since the semaphore is already fully returned.
    pub async fn end(&self) {
        self.0.ended.store(true, Ordering::SeqCst);
        tracing::info!(pool_id = %self.0.pool_id, "pool ending, waiting for active connections to drain");
        // No further checkout can succeed past the `ended` flag above, so
        // the permits this acquires are never handed back out — once every
        // outstanding connection's `Drop` has returned its permit, this
        // resolves holding the full semaphore, which it then releases.
        let _ = self.0.semaphore.clone().acquire_many_owned(self.0.config.maximum_pool_size).await;
        tracing::info!(pool_id = %self.0.pool_id, "pool ended, no further connections will be handed out");
    }

    /// Runs `handler` against a pinned connection checked out for the
    /// duration of the call (spec §3: `EXPLICIT` connection kind).
    pub async fn connect<T, F, Fut>(&self, handler: F) -> Result<T, SlonikError>
    where
        F: FnOnce(&PooledConnection) -> Fut,
        Fut: Future<Output = Result<T, SlonikError>>,
    {
        let lease = self.0.checkout().await?;
        let conn = PooledConnection::new(self.0.clone(), lease);
        handler(&conn).await
    }

    /// Runs `handler` inside a `BEGIN`/`COMMIT`/`ROLLBACK` transaction on a
    /// connection pinned for the whole attempt, retrying the entire
    /// transaction — same connection, fresh `BEGIN` — while the failure is
    /// SQLSTATE class `40` and under `transaction_retry_limit` (spec §4.F).
    pub async fn transaction<T, F, Fut>(&self, handler: F) -> Result<T, SlonikError>
    where
        F: Fn(&Transaction) -> Fut,
        Fut: Future<Output = Result<T, SlonikError>>,
    {
        let lease = Arc::new(self.0.checkout().await?);
        let mut attempt = 0;
        loop {
            let tx = Transaction::begin_top_level(self.0.clone(), lease.clone()).await?;
            tracing::debug!(transaction_id = %tx.transaction_id(), attempt, "transaction begin");
            match handler(&tx).await {
                Ok(value) => {
                    tx.commit_top_level().await?;
                    tracing::debug!(transaction_id = %tx.transaction_id(), "transaction commit");
                    return Ok(value);
                }
                Err(err) => {
                    tx.rollback_top_level().await;
                    tracing::debug!(transaction_id = %tx.transaction_id(), error = %err, "transaction rollback");
                    if attempt < self.0.config.transaction_retry_limit && err.is_transaction_rollback_class() {
                        attempt += 1;
                        tracing::info!(attempt, sqlstate = err.sqlstate().unwrap_or("?"), "retrying transaction after rollback-class error");
                        tokio::time::sleep(backoff(attempt)).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[async_trait]
impl Queryable for Pool {
    async fn run(&self, token: SqlToken) -> Result<QueryResult, SlonikError> {
        let query = interpret(&token)?;
        let mut lease = self.0.checkout().await?;
        let pipeline = PipelineContext {
            driver: self.0.driver.as_ref(),
            connection_id: lease.connection_id,
            pool_id: self.0.pool_id,
            registry: &self.0.registry,
            interceptors: &self.0.config.interceptors,
            retry_limit: self.0.config.query_retry_limit,
            connection_kind: ConnectionKind::Pool,
            transaction_id: None,
            capture_stack_trace: self.0.config.capture_stack_trace,
            statement_timeout: self.0.config.statement_timeout.as_duration(),
        };
        let result = pipeline::execute(&pipeline, query).await;
        if let Err(err) = &result {
            if should_destroy(err) {
                lease.mark_for_destruction();
            }
        }
        result
    }
}

/// A pinned connection handed to a [`Pool::connect`] handler (spec §3:
/// `EXPLICIT`). Busy-guarded like [`Transaction`]: only one call may be in
/// flight on it at a time.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    lease: Arc<ConnectionLease>,
    busy: AtomicBool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, lease: ConnectionLease) -> Self {
        Self {
            pool,
            lease: Arc::new(lease),
            busy: AtomicBool::new(false),
        }
    }

    /// Like [`Pool::transaction`], but on this already-pinned connection
    /// instead of checking a new one out.
    pub async fn transaction<T, F, Fut>(&self, handler: F) -> Result<T, SlonikError>
    where
        F: Fn(&Transaction) -> Fut,
        Fut: Future<Output = Result<T, SlonikError>>,
    {
        let mut attempt = 0;
        loop {
            let tx = Transaction::begin_top_level(self.pool.clone(), self.lease.clone()).await?;
            tracing::debug!(transaction_id = %tx.transaction_id(), attempt, "transaction begin");
            match handler(&tx).await {
                Ok(value) => {
                    tx.commit_top_level().await?;
                    tracing::debug!(transaction_id = %tx.transaction_id(), "transaction commit");
                    return Ok(value);
                }
                Err(err) => {
                    tx.rollback_top_level().await;
                    tracing::debug!(transaction_id = %tx.transaction_id(), error = %err, "transaction rollback");
                    if attempt < self.pool.config.transaction_retry_limit && err.is_transaction_rollback_class() {
                        attempt += 1;
                        tracing::info!(attempt, sqlstate = err.sqlstate().unwrap_or("?"), "retrying transaction after rollback-class error");
                        tokio::time::sleep(backoff(attempt)).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Streams rows in batches from a server-side cursor (spec §4.H).
    pub async fn stream(&self, token: SqlToken, batch_size: u32) -> Result<RowStream, SlonikError> {
        let _guard = BusyGuard::acquire(&self.busy)?;
        stream::stream(self.pool.driver.as_ref(), self.lease.connection_id, &self.pool.registry, token, batch_size).await
    }

    /// Streams `rows` into `sql` via binary `COPY FROM STDIN` (spec §4.H).
    pub async fn copy_from_binary(
        &self,
        sql: &str,
        column_types: &[String],
        rows: &[Vec<crate::token::PrimitiveValue>],
    ) -> Result<crate::copy::CopyOutcome, SlonikError> {
        let _guard = BusyGuard::acquire(&self.busy)?;
        crate::copy::copy_from_binary(self.pool.driver.as_ref(), self.lease.connection_id, sql, column_types, rows).await
    }
}

#[async_trait]
impl Queryable for PooledConnection {
    async fn run(&self, token: SqlToken) -> Result<QueryResult, SlonikError> {
        let _guard = BusyGuard::acquire(&self.busy)?;
        let query = interpret(&token)?;
        let pipeline = PipelineContext {
            driver: self.pool.driver.as_ref(),
            connection_id: self.lease.connection_id,
            pool_id: self.pool.pool_id,
            registry: &self.pool.registry,
            interceptors: &self.pool.config.interceptors,
            retry_limit: self.pool.config.query_retry_limit,
            connection_kind: ConnectionKind::ExplicitConnection,
            transaction_id: None,
            capture_stack_trace: self.pool.config.capture_stack_trace,
            statement_timeout: self.pool.config.statement_timeout.as_duration(),
        };
        pipeline::execute(&pipeline, query).await
    }
}
