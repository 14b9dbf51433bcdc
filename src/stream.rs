//! Cursor-backed row stream (spec component H): batches rows off
//! `Driver::execute_cursor` and parses each batch through the
//! [`TypeRegistry`], without ever materializing the whole result set.
//! Grounded on `futures::TryStreamExt::try_flatten` over a stream-of-batches,
//! the same shape `examples/hotdata-dev-rivetdb/src/datafetch.rs` uses to turn
//! paginated fetches into one flat row stream.

use crate::driver::{ConnectionId, Driver};
use crate::error::{QueryErrorContext, SlonikError};
use crate::interpreter::interpret;
use crate::row::{apply_row_schema, row_from_raw, Row, TypeRegistry};
use crate::token::SqlToken;
use futures::{Stream, TryStreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

pub type RowStream = Pin<Box<dyn Stream<Item = Result<Row, SlonikError>> + Send>>;

/// Wraps a [`RowStream`] so an arbitrary guard value (e.g. a pool
/// [`crate::pool::ConnectionLease`]) is dropped, and releases its
/// connection, only once the stream itself is dropped — needed when
/// [`crate::pool::Pool::stream`] checks out a connection implicitly rather
/// than reusing an already-pinned handle's lease.
struct KeepAlive<T> {
    inner: RowStream,
    _guard: Arc<T>,
}

impl<T: Send + Sync + 'static> Stream for KeepAlive<T> {
    type Item = Result<Row, SlonikError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

pub(crate) trait RowStreamExt: Sized {
    fn keep_alive<T: Send + Sync + 'static>(self, guard: Arc<T>) -> RowStream;
}

impl RowStreamExt for RowStream {
    fn keep_alive<T: Send + Sync + 'static>(self, guard: Arc<T>) -> RowStream {
        Box::pin(KeepAlive { inner: self, _guard: guard })
    }
}

pub(crate) async fn stream(
    driver: &dyn Driver,
    connection_id: ConnectionId,
    registry: &TypeRegistry,
    token: SqlToken,
    batch_size: u32,
) -> Result<RowStream, SlonikError> {
    let query = interpret(&token)?;
    let batches = driver
        .execute_cursor(connection_id, &query.sql, &query.values, batch_size)
        .await?;

    let registry = registry.clone();
    let row_schema = query.row_schema.clone();
    let err_ctx = QueryErrorContext::new(uuid::Uuid::new_v4(), query.sql.clone(), query.values.clone());

    let rows = batches
        .map_ok(move |batch| {
            let registry = registry.clone();
            let row_schema = row_schema.clone();
            let err_ctx = err_ctx.clone();
            futures::stream::iter(batch.into_iter().map(move |raw| {
                let row = row_from_raw(&registry, &raw)?;
                match &row_schema {
                    Some(schema) => apply_row_schema(schema, row, &err_ctx),
                    None => Ok(row),
                }
            }))
        })
        .try_flatten();

    Ok(Box::pin(rows))
}
