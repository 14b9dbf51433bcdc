//! Interceptor protocol (ambient component L): a trait with default no-op
//! hooks, matching the design note's "represent as a trait/interface with
//! default no-op implementations; the pipeline pattern-matches on each
//! hook's return variant." Each hook's return type is the concrete shape
//! that variant carries (`Query` for a replacement, `Option<QueryResult>`
//! for a possible short-circuit) rather than one shared enum forcing every
//! hook into the same shape — [`HookResult`] below still names the
//! `Continue`/`ShortCircuit` pair literally for `before_query_execution`,
//! the one hook where the design note's wording maps directly onto a single
//! call site.

use crate::error::SlonikError;
use crate::interpreter::Query;
use crate::row::Row;
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// How a handle was opened, driving interceptor context (spec §3:
/// `EXPLICIT`|`IMPLICIT_QUERY`|`IMPLICIT_TRANSACTION`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Pool,
    ExplicitConnection,
    Transaction,
}

impl ConnectionKind {
    pub fn as_context_label(&self) -> &'static str {
        match self {
            ConnectionKind::Pool => "IMPLICIT_QUERY",
            ConnectionKind::ExplicitConnection => "EXPLICIT",
            ConnectionKind::Transaction => "IMPLICIT_TRANSACTION",
        }
    }
}

/// Created once per user-visible query call (spec §3: "Query context").
/// Passed by value into every interceptor hook.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub query_id: Uuid,
    pub connection_id: Uuid,
    pub pool_id: Uuid,
    pub submitted_at: Instant,
    pub original_query: Query,
    pub stack_trace: Option<Vec<String>>,
    pub sandbox: HashMap<String, serde_json::Value>,
    pub transaction_id: Option<Uuid>,
    pub connection_kind: ConnectionKind,
}

/// The shaped result of one `execute` call, post row-parsing, as seen by
/// `beforeQueryExecution`'s short-circuit and the later observational hooks.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub command_tag: String,
    pub rows: Vec<Row>,
    /// Notices emitted by the server during this call (spec §4.D/§4.G step 7),
    /// associated only with the call that produced them (spec §5). Always
    /// empty against [`crate::driver::TokioPostgresDriver`] today: a plain
    /// `NOTICE` is delivered on the connection's background I/O task, which
    /// `deadpool_postgres` drives internally and doesn't expose a hook for —
    /// wiring it through would mean driving the connection ourselves instead
    /// of handing that off to the pool.
    pub notices: Vec<String>,
}

/// `beforeQueryExecution`'s return shape (spec §6): a non-null result
/// short-circuits execution with that synthetic result.
#[derive(Debug, Clone)]
pub enum HookResult {
    Continue,
    ShortCircuit(QueryResult),
}

/// `beforePoolConnection`'s return shape (spec §6): a non-null value
/// re-routes the query to an alternate pool. Type-erased here so this
/// module — which the pool depends on — never needs to name the `Pool`
/// type itself; the pool downcasts `Alternate`'s payload back to its own
/// concrete type.
pub enum PoolRouting {
    Default,
    Alternate(Arc<dyn Any + Send + Sync>),
}

/// Hook bundle invoked at the fixed pipeline points enumerated in spec §4.G.
/// Every method has a no-op default; implementors override only the hooks
/// they care about.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn before_pool_connection(&self, _ctx: &QueryContext) -> Result<PoolRouting, SlonikError> {
        Ok(PoolRouting::Default)
    }

    async fn before_transform_query(&self, _ctx: &QueryContext) -> Result<(), SlonikError> {
        Ok(())
    }

    async fn transform_query(&self, _ctx: &QueryContext, query: Query) -> Result<Query, SlonikError> {
        Ok(query)
    }

    async fn before_query_execution(&self, _ctx: &QueryContext, _query: &Query) -> Result<HookResult, SlonikError> {
        Ok(HookResult::Continue)
    }

    async fn query_execution_error(&self, _ctx: &QueryContext, _error: &SlonikError) {}

    async fn before_query_result(&self, _ctx: &QueryContext, _result: &QueryResult) {}

    async fn transform_row(&self, _ctx: &QueryContext, row: Row) -> Row {
        row
    }

    async fn after_query_execution(&self, _ctx: &QueryContext, _result: &QueryResult) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopInterceptor;
    #[async_trait]
    impl Interceptor for NoopInterceptor {}

    #[tokio::test]
    async fn default_hooks_are_transparent() {
        let interceptor = NoopInterceptor;
        let ctx = QueryContext {
            query_id: Uuid::new_v4(),
            connection_id: Uuid::new_v4(),
            pool_id: Uuid::new_v4(),
            submitted_at: Instant::now(),
            original_query: Query {
                sql: "SELECT 1".into(),
                values: vec![],
                row_schema: None,
            },
            stack_trace: None,
            sandbox: HashMap::new(),
            transaction_id: None,
            connection_kind: ConnectionKind::Pool,
        };

        assert!(interceptor.before_transform_query(&ctx).await.is_ok());
        let query = interceptor
            .transform_query(&ctx, ctx.original_query.clone())
            .await
            .unwrap();
        assert_eq!(query.sql, "SELECT 1");
        assert!(matches!(
            interceptor.before_query_execution(&ctx, &query).await.unwrap(),
            HookResult::Continue
        ));
        assert!(matches!(
            interceptor.before_pool_connection(&ctx).await.unwrap(),
            PoolRouting::Default
        ));
    }
}
