//! Cross-module scenarios from spec §8 that need a `Pool` wired up to a real
//! `Driver` implementation to exercise: transaction retry (S6), pool end
//! (S7), and the pool bounds/release-liveness invariants. Tested against an
//! in-memory fake `Driver` rather than a live Postgres container — the wire
//! driver is out of scope for this crate (spec §1), so this is the seam the
//! teacher's own `tests/catalog_manager_suite.rs` would reach for
//! `testcontainers` at, generalized here to a plain mock since nothing below
//! `Driver` is this crate's responsibility to verify.

use async_trait::async_trait;
use slonik::driver::{ConnectionId, Driver, ExecuteOutcome, RowBatchStream, SessionParameters};
use slonik::error::SlonikError;
use slonik::token::PrimitiveValue;
use slonik::{sql, Pool, PoolConfigBuilder, Queryable};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// An in-memory `Driver` that never touches a socket: `acquire` mints a
/// fresh id, `execute` always succeeds with zero rows unless a test installs
/// a scripted failure via `fail_next_n_executes`.
#[derive(Default)]
struct MockDriver {
    outstanding: Mutex<Vec<ConnectionId>>,
    max_outstanding_seen: AtomicU32,
    executes: AtomicUsize,
    fail_next_n_executes: AtomicUsize,
    fail_sqlstate: Mutex<String>,
}

impl MockDriver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_sqlstate: Mutex::new("40001".to_string()),
            ..Default::default()
        })
    }

    fn script_rollback_failures(&self, n: usize) {
        self.fail_next_n_executes.store(n, Ordering::SeqCst);
    }

    fn execute_count(&self) -> usize {
        self.executes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn acquire(&self) -> Result<ConnectionId, SlonikError> {
        let id = Uuid::new_v4();
        let mut outstanding = self.outstanding.lock().unwrap();
        outstanding.push(id);
        let count = outstanding.len() as u32;
        self.max_outstanding_seen.fetch_max(count, Ordering::SeqCst);
        Ok(id)
    }

    async fn release(&self, conn: ConnectionId, _destroy: bool) {
        self.outstanding.lock().unwrap().retain(|id| *id != conn);
    }

    async fn execute(&self, _conn: ConnectionId, _sql: &str, _values: &[PrimitiveValue]) -> Result<ExecuteOutcome, SlonikError> {
        self.executes.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_next_n_executes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_n_executes.store(remaining - 1, Ordering::SeqCst);
            let sqlstate = self.fail_sqlstate.lock().unwrap().clone();
            return Err(SlonikError::TransactionRollback {
                sqlstate,
                ctx: Default::default(),
            });
        }
        Ok(ExecuteOutcome::default())
    }

    async fn execute_cursor(
        &self,
        _conn: ConnectionId,
        _sql: &str,
        _values: &[PrimitiveValue],
        _batch_size: u32,
    ) -> Result<RowBatchStream, SlonikError> {
        let batches: Vec<Result<Vec<slonik::row::RawRow>, SlonikError>> = Vec::new();
        Ok(Box::pin(futures::stream::iter(batches)))
    }

    async fn copy_in_binary(
        &self,
        _conn: ConnectionId,
        _sql: &str,
        _column_types: &[String],
        _tuples: &[Vec<PrimitiveValue>],
    ) -> Result<u64, SlonikError> {
        Ok(0)
    }

    async fn cancel(&self, _conn: ConnectionId) -> Result<(), SlonikError> {
        Ok(())
    }

    async fn set_session_parameters(&self, _conn: ConnectionId, _params: &SessionParameters) -> Result<(), SlonikError> {
        Ok(())
    }
}

fn pool_with(driver: Arc<MockDriver>, max_pool_size: u32) -> Pool {
    let config = PoolConfigBuilder::new()
        .maximum_pool_size(max_pool_size)
        .transaction_retry_limit(5)
        .query_retry_limit(5)
        .build()
        .unwrap();
    Pool::new(config, driver)
}

/// S6: a transaction handler that fails once with SQLSTATE 40001 then
/// succeeds, with `transactionRetryLimit = 5`, is invoked exactly twice and
/// the outer result is the success.
#[tokio::test]
async fn s6_transaction_retries_on_rollback_class_then_succeeds() {
    let driver = MockDriver::new();
    let pool = pool_with(driver.clone(), 5);

    let invocation_count = Arc::new(AtomicUsize::new(0));
    let counted = invocation_count.clone();

    let result = pool
        .transaction(move |tx| {
            let counted = counted.clone();
            async move {
                let attempt = counted.fetch_add(1, Ordering::SeqCst);
                if attempt == 0 {
                    return Err(SlonikError::TransactionRollback {
                        sqlstate: "40001".to_string(),
                        ctx: Default::default(),
                    });
                }
                tx.query(sql!("SELECT 1")).await?;
                Ok(42)
            }
        })
        .await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(invocation_count.load(Ordering::SeqCst), 2);
}

/// A non-class-40 handler failure is not retried: the transaction surfaces
/// immediately after one invocation (spec §4.F: "any non-40 error is
/// surfaced; the transaction rolls back").
#[tokio::test]
async fn non_rollback_class_error_is_not_retried() {
    let driver = MockDriver::new();
    let pool = pool_with(driver, 5);

    let invocation_count = Arc::new(AtomicUsize::new(0));
    let counted = invocation_count.clone();

    let result: Result<(), SlonikError> = pool
        .transaction(move |_tx| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Err(SlonikError::UnexpectedState {
                    message: "boom".to_string(),
                })
            }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(invocation_count.load(Ordering::SeqCst), 1);
}

/// A query-level SQLSTATE-40 failure (no enclosing transaction) is retried
/// in place up to `queryRetryLimit`, bounding the number of `execute` calls
/// at `1 + queryRetryLimit` (spec §8 invariant 8).
#[tokio::test]
async fn standalone_query_retries_up_to_query_retry_limit() {
    let driver = MockDriver::new();
    driver.script_rollback_failures(2);
    let pool = pool_with(driver.clone(), 5);

    let result = pool.query(sql!("SELECT 1")).await;
    assert!(result.is_ok());
    assert_eq!(driver.execute_count(), 3);
}

/// S7: after `pool.end()`, any query rejects with `PoolEndedError` and
/// `getPoolState().ended` is `true`.
#[tokio::test]
async fn s7_pool_end_rejects_subsequent_queries() {
    let driver = MockDriver::new();
    let pool = pool_with(driver, 5);

    pool.end().await;
    assert!(pool.state().ended);
    assert_eq!(pool.state().active_connection_count, 0);

    let result = pool.query(sql!("SELECT 1")).await;
    assert!(matches!(result, Err(SlonikError::PoolEnded)));
}

/// `pool.end()` waits for a connection still checked out to be released
/// before it resolves (spec §4.E), rather than returning the instant the
/// `ended` flag is set.
#[tokio::test]
async fn pool_end_waits_for_active_connections_to_drain() {
    let driver = MockDriver::new();
    let pool = pool_with(driver, 5);

    let holder = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.connect(|conn| async move {
                conn.query(sql!("SELECT 1")).await?;
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok::<_, SlonikError>(())
            })
            .await
        })
    };
    // Give the spawned task a moment to check its connection out before
    // `end()` takes its drain snapshot.
    tokio::time::sleep(Duration::from_millis(5)).await;

    pool.end().await;
    assert_eq!(pool.state().active_connection_count, 0);
    holder.await.unwrap().unwrap();
}

/// Pool bounds (spec §8 invariant 4): with `maximumPoolSize = 2`, no more
/// than 2 connections are ever checked out concurrently, even when more
/// callers are waiting.
#[tokio::test]
async fn pool_never_exceeds_its_configured_capacity() {
    let driver = MockDriver::new();
    let pool = pool_with(driver.clone(), 2);

    let mut handles = Vec::new();
    for _ in 0..6 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            pool.connect(|conn| async move {
                conn.query(sql!("SELECT 1")).await?;
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, SlonikError>(())
            })
            .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert!(driver.max_outstanding_seen.load(Ordering::SeqCst) <= 2);
}

/// Release liveness (spec §8 invariant 6): after every acquisition in a
/// finite sequence resolves, no connection remains checked out.
#[tokio::test]
async fn every_acquired_connection_is_eventually_released() {
    let driver = MockDriver::new();
    let pool = pool_with(driver.clone(), 3);

    for _ in 0..10 {
        pool.query(sql!("SELECT 1")).await.unwrap();
    }
    // Connection release is spawned off `Drop`, so give the runtime a tick
    // to run those tasks before asserting the outstanding set is empty.
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(driver.outstanding.lock().unwrap().is_empty());
}

/// Nested transactions (savepoints) roll back independently of the
/// enclosing transaction: a failing nested block doesn't fail the outer one.
#[tokio::test]
async fn nested_transaction_failure_does_not_fail_enclosing_transaction() {
    let driver = MockDriver::new();
    let pool = pool_with(driver, 5);

    let result = pool
        .transaction(|tx| async move {
            let nested: Result<(), SlonikError> = tx
                .transaction(|inner| async move {
                    inner.query(sql!("SELECT 1")).await?;
                    Err(SlonikError::UnexpectedState {
                        message: "nested failure".to_string(),
                    })
                })
                .await;
            assert!(nested.is_err());

            tx.query(sql!("SELECT 2")).await?;
            Ok(())
        })
        .await;

    assert!(result.is_ok());
}
