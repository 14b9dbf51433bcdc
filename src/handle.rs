//! The shared query-method surface every connection handle exposes
//! (spec §6: `DatabasePool`/`DatabaseTransactionConnection`/
//! `DatabasePoolConnection` all expose the same `query`/`one`/`oneFirst`/…
//! methods). [`Queryable::run`] is the one method each handle kind
//! implements concretely — acquiring or reusing a connection per its own
//! rules (spec §3: `ConnectionKind`) — and every shape function
//! (`one`, `maybeOne`, `exists`, …) is a default method built on top of it,
//! so [`crate::pool::Pool`], [`crate::pool::PooledConnection`] and
//! [`crate::transaction::Transaction`] get them for free.

use crate::error::SlonikError;
use crate::pipeline::{self, QueryResult};
use crate::row::Row;
use crate::token::{raw_fragments, PrimitiveValue, SqlToken, ValueExpr};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

/// Guards a pinned handle's busy flag for the duration of one call,
/// resetting it on every exit path (spec §5: overlapping calls on the same
/// pinned handle are a contract violation, detected by this flag).
pub(crate) struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Result<Self, SlonikError> {
        if flag.swap(true, Ordering::SeqCst) {
            return Err(SlonikError::Concurrency);
        }
        Ok(Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The query-method surface common to every handle kind (spec §6).
#[async_trait]
pub trait Queryable: Send + Sync {
    /// Runs one token tree through the execution pipeline and returns the
    /// shaped result, before any cardinality check. Each handle kind
    /// supplies its own connection-acquisition rule here.
    async fn run(&self, token: SqlToken) -> Result<QueryResult, SlonikError>;

    /// No cardinality constraint: whatever rows came back (spec §4.G `query`/`any`).
    async fn query(&self, token: SqlToken) -> Result<QueryResult, SlonikError> {
        self.run(token).await
    }

    /// Exactly one row, or an error (spec §4.G `one`).
    async fn one(&self, token: SqlToken) -> Result<Row, SlonikError> {
        pipeline::one(self.run(token).await?)
    }

    /// Exactly one row with exactly one column; returns that value (spec §4.G `oneFirst`).
    async fn one_first(&self, token: SqlToken) -> Result<PrimitiveValue, SlonikError> {
        pipeline::one_first(self.run(token).await?)
    }

    /// Zero or one row (spec §4.G `maybeOne`).
    async fn maybe_one(&self, token: SqlToken) -> Result<Option<Row>, SlonikError> {
        pipeline::maybe_one(self.run(token).await?)
    }

    /// Zero or one row, narrowed to its single column (spec §4.G `maybeOneFirst`).
    async fn maybe_one_first(&self, token: SqlToken) -> Result<Option<PrimitiveValue>, SlonikError> {
        pipeline::maybe_one_first(self.run(token).await?)
    }

    /// At least one row (spec §4.G `many`).
    async fn many(&self, token: SqlToken) -> Result<Vec<Row>, SlonikError> {
        pipeline::many(self.run(token).await?)
    }

    /// At least one row, narrowed to each row's single column (spec §4.G `manyFirst`).
    async fn many_first(&self, token: SqlToken) -> Result<Vec<PrimitiveValue>, SlonikError> {
        pipeline::many_first(self.run(token).await?)
    }

    /// Zero or more rows (spec §4.G `any`).
    async fn any(&self, token: SqlToken) -> Result<Vec<Row>, SlonikError> {
        Ok(pipeline::any(self.run(token).await?))
    }

    /// Zero or more rows, narrowed to each row's single column (spec §4.G `anyFirst`).
    async fn any_first(&self, token: SqlToken) -> Result<Vec<PrimitiveValue>, SlonikError> {
        pipeline::any_first(self.run(token).await?)
    }

    /// Wraps `token` as `SELECT EXISTS (<query>)` and returns the boolean
    /// (spec §4.G `exists`).
    async fn exists(&self, token: SqlToken) -> Result<bool, SlonikError> {
        let wrapped = raw_fragments(&["SELECT EXISTS (", ")"], vec![ValueExpr::Token(token)]);
        match pipeline::one_first(self.run(wrapped).await?)? {
            PrimitiveValue::Bool(b) => Ok(b),
            other => Err(SlonikError::UnexpectedState {
                message: format!("EXISTS query returned a non-boolean value: {other:?}"),
            }),
        }
    }
}
