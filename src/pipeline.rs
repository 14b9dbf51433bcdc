//! The execution pipeline (spec component G): the fixed sequence every query
//! — whether issued directly on a pool, an explicit connection, or inside a
//! transaction — runs through, and the shape functions (`one`, `many`, ...)
//! layered on top of it. Grounded on the interceptor call order spec §4.G
//! lays out; the retry-on-`40`-class-SQLSTATE behavior is grounded on
//! `examples/other_examples/0cd7cd00_HFQR-xitca-web__postgres-src-transaction.rs.rs`'s
//! retry wrapper around `execute`.

use crate::driver::{ConnectionId, Driver};
use crate::error::{QueryErrorContext, SlonikError};
use crate::interceptor::{ConnectionKind, HookResult, Interceptor, PoolRouting, QueryContext, QueryResult};
use crate::interpreter::Query;
use crate::row::{apply_row_schema, row_from_raw, TypeRegistry};
use crate::token::PrimitiveValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Everything the pipeline needs that isn't specific to one call: the
/// driver seam, the connection it's bound to, the type registry used to
/// parse rows, and the interceptor chain to run hooks through.
pub struct PipelineContext<'a> {
    pub driver: &'a dyn Driver,
    pub connection_id: ConnectionId,
    pub pool_id: Uuid,
    pub registry: &'a TypeRegistry,
    pub interceptors: &'a [Arc<dyn Interceptor>],
    pub retry_limit: u32,
    pub connection_kind: ConnectionKind,
    pub transaction_id: Option<Uuid>,
    pub capture_stack_trace: bool,
    /// Client-side enforcement of `statementTimeout` (spec §5): past this
    /// duration without a driver response, `driver.cancel` is issued and the
    /// resulting driver failure is awaited and remapped to
    /// `StatementTimeoutError`, alongside the server-side session setting
    /// applied at acquire time.
    pub statement_timeout: Option<Duration>,
}

fn new_context(pipeline: &PipelineContext<'_>, query: &Query) -> QueryContext {
    QueryContext {
        query_id: Uuid::new_v4(),
        connection_id: pipeline.connection_id,
        pool_id: pipeline.pool_id,
        submitted_at: Instant::now(),
        original_query: query.clone(),
        stack_trace: pipeline.capture_stack_trace.then(capture_stack_trace),
        sandbox: std::collections::HashMap::new(),
        transaction_id: pipeline.transaction_id,
        connection_kind: pipeline.connection_kind,
    }
}

/// Captures the current call site on query entry (spec §4.E:
/// `captureStackTrace`), trimmed of this crate's own pipeline frames so the
/// first reported frame is the caller's, not `new_context`/`execute`
/// themselves. `std::backtrace::Backtrace` only resolves symbol names when
/// the binary carries debug info and `RUST_BACKTRACE` is set; frames that
/// can't be resolved are reported by address instead of silently dropped.
fn capture_stack_trace() -> Vec<String> {
    let backtrace = std::backtrace::Backtrace::force_capture();
    format!("{backtrace}")
        .lines()
        .filter(|line| line.trim_start().starts_with(|c: char| c.is_ascii_digit()))
        .skip_while(|line| line.contains("capture_stack_trace") || line.contains("new_context") || line.contains("backtrace::Backtrace"))
        .map(str::trim)
        .map(str::to_string)
        .collect()
}

/// Runs one query through the full pipeline: hooks, retry-on-transient-error,
/// row parsing, and the `afterQueryExecution` hook. Returns the shaped
/// [`QueryResult`] (rows already parsed into [`crate::row::Row`]).
pub async fn execute(pipeline: &PipelineContext<'_>, query: Query) -> Result<QueryResult, SlonikError> {
    let mut ctx = new_context(pipeline, &query);

    for interceptor in pipeline.interceptors {
        if !matches!(interceptor.before_pool_connection(&ctx).await?, PoolRouting::Default) {
            tracing::warn!("beforePoolConnection re-routing was requested but is not wired up in this driver; continuing on the original pool");
        }
    }

    for interceptor in pipeline.interceptors {
        interceptor.before_transform_query(&ctx).await?;
    }

    let mut query = query;
    for interceptor in pipeline.interceptors {
        query = interceptor.transform_query(&ctx, query).await?;
    }
    ctx.original_query = query.clone();

    for interceptor in pipeline.interceptors {
        if let HookResult::ShortCircuit(result) = interceptor.before_query_execution(&ctx, &query).await? {
            for interceptor in pipeline.interceptors {
                interceptor.after_query_execution(&ctx, &result).await;
            }
            return Ok(result);
        }
    }

    let outcome = execute_with_retry(pipeline, &ctx, &query).await;
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            for interceptor in pipeline.interceptors {
                interceptor.query_execution_error(&ctx, &err).await;
            }
            return Err(err);
        }
    };

    let err_ctx = QueryErrorContext::new(ctx.query_id, query.sql.clone(), query.values.clone());
    let row_schema = query.row_schema.clone();
    let mut rows = Vec::with_capacity(outcome.rows.len());
    for raw in &outcome.rows {
        let mut row = row_from_raw(pipeline.registry, raw)?;
        for interceptor in pipeline.interceptors {
            row = interceptor.transform_row(&ctx, row).await;
        }
        if let Some(schema) = &row_schema {
            row = apply_row_schema(schema, row, &err_ctx)?;
        }
        rows.push(row);
    }

    let result = QueryResult {
        command_tag: outcome.command_tag,
        rows,
        notices: outcome.notices,
    };

    for interceptor in pipeline.interceptors {
        interceptor.before_query_result(&ctx, &result).await;
    }
    for interceptor in pipeline.interceptors {
        interceptor.after_query_execution(&ctx, &result).await;
    }

    Ok(result)
}

async fn execute_with_retry(
    pipeline: &PipelineContext<'_>,
    ctx: &QueryContext,
    query: &Query,
) -> Result<crate::driver::ExecuteOutcome, SlonikError> {
    let mut attempt = 0;
    loop {
        let outcome = execute_once_with_timeout(pipeline, ctx, query).await;
        match outcome {
            Ok(outcome) => return Ok(outcome),
            Err(err) if attempt < pipeline.retry_limit && err.is_transaction_rollback_class() => {
                attempt += 1;
                tracing::info!(
                    query_id = %ctx.query_id,
                    attempt,
                    sqlstate = err.sqlstate().unwrap_or("?"),
                    "retrying query after rollback-class error"
                );
                tokio::time::sleep(backoff(attempt)).await;
                continue;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Enforces `statementTimeout` client-side (spec §5): races the driver call
/// against the deadline; on expiry, issues `driver.cancel` and then awaits
/// the driver's own failure rather than returning immediately, so the
/// reported error is the deterministic `StatementTimeoutError` rather than a
/// raced, possibly-successful in-flight result (per the design notes' open
/// question: "cancel then await" over "cancel and forget").
async fn execute_once_with_timeout(
    pipeline: &PipelineContext<'_>,
    ctx: &QueryContext,
    query: &Query,
) -> Result<crate::driver::ExecuteOutcome, SlonikError> {
    let call = pipeline.driver.execute(pipeline.connection_id, &query.sql, &query.values);
    futures::pin_mut!(call);

    let Some(timeout) = pipeline.statement_timeout else {
        return call.await;
    };

    tokio::select! {
        result = &mut call => result,
        _ = tokio::time::sleep(timeout) => {
            tracing::warn!(
                query_id = %ctx.query_id,
                connection_id = %pipeline.connection_id,
                timeout_ms = timeout.as_millis() as u64,
                "statement exceeded its timeout, cancelling"
            );
            let _ = pipeline.driver.cancel(pipeline.connection_id).await;
            match call.await {
                Ok(outcome) => Ok(outcome),
                Err(_) => Err(SlonikError::StatementTimeout {
                    message: format!("statement exceeded its {}ms timeout", timeout.as_millis()),
                    ctx: QueryErrorContext::new(ctx.query_id, query.sql.clone(), query.values.clone()),
                }),
            }
        }
    }
}

pub(crate) fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(20u64.saturating_mul(1u64 << attempt.min(6)))
}

/// A single row is required; any other row count is an error
/// (spec §4.G: `one`).
pub fn one(result: QueryResult) -> Result<crate::row::Row, SlonikError> {
    match result.rows.len() {
        1 => Ok(result.rows.into_iter().next().unwrap()),
        0 => Err(SlonikError::NotFound {
            message: "expected exactly one row, got none".to_string(),
            ctx: QueryErrorContext::default(),
        }),
        n => Err(SlonikError::DataIntegrity {
            message: format!("expected exactly one row, got {n}"),
            ctx: QueryErrorContext::default(),
        }),
    }
}

/// Like [`one`], but also requires the row to have exactly one column and
/// returns that column's value (spec §4.G: `oneFirst`).
pub fn one_first(result: QueryResult) -> Result<PrimitiveValue, SlonikError> {
    first_column(one(result)?)
}

/// Zero or one row; `None` on zero, error on more than one
/// (spec §4.G: `maybeOne`).
pub fn maybe_one(result: QueryResult) -> Result<Option<crate::row::Row>, SlonikError> {
    match result.rows.len() {
        0 => Ok(None),
        1 => Ok(Some(result.rows.into_iter().next().unwrap())),
        n => Err(SlonikError::DataIntegrity {
            message: format!("expected at most one row, got {n}"),
            ctx: QueryErrorContext::default(),
        }),
    }
}

/// Like [`maybe_one`], narrowed to the row's single column
/// (spec §4.G: `maybeOneFirst`).
pub fn maybe_one_first(result: QueryResult) -> Result<Option<PrimitiveValue>, SlonikError> {
    maybe_one(result)?.map(first_column).transpose()
}

/// At least one row required; all rows returned as-is
/// (spec §4.G: `many`).
pub fn many(result: QueryResult) -> Result<Vec<crate::row::Row>, SlonikError> {
    if result.rows.is_empty() {
        return Err(SlonikError::NotFound {
            message: "expected at least one row, got none".to_string(),
            ctx: QueryErrorContext::default(),
        });
    }
    Ok(result.rows)
}

/// Like [`many`], narrowed to each row's single column
/// (spec §4.G: `manyFirst`).
pub fn many_first(result: QueryResult) -> Result<Vec<PrimitiveValue>, SlonikError> {
    many(result)?.into_iter().map(first_column).collect()
}

/// Any number of rows, including zero (spec §4.G: `any`).
pub fn any(result: QueryResult) -> Vec<crate::row::Row> {
    result.rows
}

/// Like [`any`], narrowed to each row's single column
/// (spec §4.G: `anyFirst`).
pub fn any_first(result: QueryResult) -> Result<Vec<PrimitiveValue>, SlonikError> {
    result.rows.into_iter().map(first_column).collect()
}

fn first_column(row: crate::row::Row) -> Result<PrimitiveValue, SlonikError> {
    if row.len() != 1 {
        return Err(SlonikError::DataIntegrity {
            message: format!("expected exactly one column, got {}", row.len()),
            ctx: QueryErrorContext::default(),
        });
    }
    Ok(row.get_index(0).expect("row.len() == 1").1.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Row;

    fn result_with(rows: Vec<Vec<(&str, PrimitiveValue)>>) -> QueryResult {
        QueryResult {
            command_tag: "0".to_string(),
            rows: rows
                .into_iter()
                .map(|cols| Row::new(cols.into_iter().map(|(n, v)| (n.to_string(), v)).collect()))
                .collect(),
            notices: Vec::new(),
        }
    }

    #[test]
    fn one_rejects_zero_and_many_rows() {
        assert!(one(result_with(vec![])).is_err());
        assert!(one(result_with(vec![vec![("a", PrimitiveValue::Int(1))], vec![("a", PrimitiveValue::Int(2))]])).is_err());
        assert!(one(result_with(vec![vec![("a", PrimitiveValue::Int(1))]])).is_ok());
    }

    #[test]
    fn one_first_requires_single_column() {
        let result = result_with(vec![vec![("a", PrimitiveValue::Int(1)), ("b", PrimitiveValue::Int(2))]]);
        assert!(one_first(result).is_err());

        let result = result_with(vec![vec![("a", PrimitiveValue::Int(7))]]);
        assert_eq!(one_first(result).unwrap(), PrimitiveValue::Int(7));
    }

    #[test]
    fn maybe_one_allows_zero_rows() {
        assert_eq!(maybe_one(result_with(vec![])).unwrap(), None);
        assert!(maybe_one(result_with(vec![vec![], vec![]])).is_ok());
    }

    #[test]
    fn many_rejects_empty() {
        assert!(many(result_with(vec![])).is_err());
        assert_eq!(many(result_with(vec![vec![], vec![]])).unwrap().len(), 2);
    }

}
