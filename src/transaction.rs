//! Transaction state machine (spec component F): `BEGIN`/`COMMIT`/`ROLLBACK`
//! at the top level, `SAVEPOINT`/`RELEASE SAVEPOINT`/`ROLLBACK TO SAVEPOINT`
//! for nesting. The savepoint naming/nesting scheme is grounded on
//! `examples/other_examples/0cd7cd00_HFQR-xitca-web__postgres-src-transaction.rs.rs`'s
//! `SavePoint` enum, simplified here to a plain depth counter since this
//! crate does not expose user-chosen savepoint names.
//!
//! Unlike [`crate::pool::Pool::transaction`], nesting never retries: a retry
//! restarts the whole top-level transaction, not one savepoint inside it
//! (spec §4.F).

use crate::driver::ConnectionId;
use crate::error::SlonikError;
use crate::handle::{BusyGuard, Queryable};
use crate::interceptor::ConnectionKind;
use crate::interpreter::interpret;
use crate::pipeline::{self, PipelineContext, QueryResult};
use crate::pool::{ConnectionLease, PoolInner};
use crate::stream::{self, RowStream};
use crate::token::SqlToken;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use uuid::Uuid;

/// A pinned, transactional connection handle (spec §3: `IMPLICIT_TRANSACTION`).
/// Handed by reference to a `pool.transaction(...)`/`connection.transaction(...)`
/// handler so the owning call site keeps the value around long enough to
/// commit or roll it back once the handler's future resolves.
pub struct Transaction {
    pool: Arc<PoolInner>,
    lease: Arc<ConnectionLease>,
    transaction_id: Uuid,
    depth: u32,
    busy: AtomicBool,
}

impl Transaction {
    pub(crate) async fn begin_top_level(pool: Arc<PoolInner>, lease: Arc<ConnectionLease>) -> Result<Self, SlonikError> {
        pool.driver.execute(lease.connection_id, "BEGIN", &[]).await?;
        Ok(Self {
            pool,
            lease,
            transaction_id: Uuid::new_v4(),
            depth: 0,
            busy: AtomicBool::new(false),
        })
    }

    pub(crate) async fn commit_top_level(&self) -> Result<(), SlonikError> {
        self.exec_raw("COMMIT").await
    }

    /// Best-effort: a failed `ROLLBACK` doesn't change the outcome already
    /// decided by the handler's `Result`, so this swallows its own error.
    pub(crate) async fn rollback_top_level(&self) {
        let _ = self.exec_raw("ROLLBACK").await;
    }

    pub fn transaction_id(&self) -> Uuid {
        self.transaction_id
    }

    pub(crate) fn connection_id(&self) -> ConnectionId {
        self.lease.connection_id
    }

    async fn exec_raw(&self, sql: &str) -> Result<(), SlonikError> {
        self.pool.driver.execute(self.lease.connection_id, sql, &[]).await?;
        Ok(())
    }

    /// Opens a nested transaction via a savepoint. Never retried: a
    /// SQLSTATE-40 failure here propagates out and triggers a retry of the
    /// *enclosing* top-level transaction instead (spec §4.F).
    pub async fn transaction<T, F, Fut>(&self, handler: F) -> Result<T, SlonikError>
    where
        F: FnOnce(&Transaction) -> Fut,
        Fut: Future<Output = Result<T, SlonikError>>,
    {
        let depth = self.depth + 1;
        let name = format!("slonik_{depth}");
        self.exec_raw(&format!("SAVEPOINT {name}")).await?;
        tracing::debug!(savepoint = %name, "savepoint begin");

        let nested = Transaction {
            pool: self.pool.clone(),
            lease: self.lease.clone(),
            transaction_id: Uuid::new_v4(),
            depth,
            busy: AtomicBool::new(false),
        };

        match handler(&nested).await {
            Ok(value) => {
                self.exec_raw(&format!("RELEASE SAVEPOINT {name}")).await?;
                tracing::debug!(savepoint = %name, "savepoint release");
                Ok(value)
            }
            Err(err) => {
                let _ = self.exec_raw(&format!("ROLLBACK TO SAVEPOINT {name}")).await;
                tracing::debug!(savepoint = %name, error = %err, "savepoint rollback");
                Err(err)
            }
        }
    }

    /// Streams rows in batches from a server-side cursor on this transaction's
    /// connection (spec §4.H).
    pub async fn stream(&self, token: SqlToken, batch_size: u32) -> Result<RowStream, SlonikError> {
        let _guard = BusyGuard::acquire(&self.busy)?;
        stream::stream(self.pool.driver.as_ref(), self.lease.connection_id, &self.pool.registry, token, batch_size).await
    }
}

#[async_trait]
impl Queryable for Transaction {
    async fn run(&self, token: SqlToken) -> Result<QueryResult, SlonikError> {
        let _guard = BusyGuard::acquire(&self.busy)?;
        let query = interpret(&token)?;
        let pipeline = PipelineContext {
            driver: self.pool.driver.as_ref(),
            connection_id: self.lease.connection_id,
            pool_id: self.pool.pool_id,
            registry: &self.pool.registry,
            interceptors: &self.pool.config.interceptors,
            // A failing statement must bubble up and unwind the whole
            // transaction rather than be retried in place: spec §4.F retries
            // the transaction, not the individual statement.
            retry_limit: 0,
            connection_kind: ConnectionKind::Transaction,
            transaction_id: Some(self.transaction_id),
            capture_stack_trace: self.pool.config.capture_stack_trace,
            statement_timeout: self.pool.config.statement_timeout.as_duration(),
        };
        pipeline::execute(&pipeline, query).await
    }
}
