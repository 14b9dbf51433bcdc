//! Binary `COPY FROM STDIN` executor (spec component H), a thin wrapper over
//! [`Driver::copy_in_binary`] returning the affected row count.

use crate::driver::{ConnectionId, Driver};
use crate::error::SlonikError;
use crate::token::PrimitiveValue;

/// The outcome of a bulk binary copy (spec §4.H: row count written).
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOutcome {
    pub row_count: u64,
}

pub(crate) async fn copy_from_binary(
    driver: &dyn Driver,
    connection_id: ConnectionId,
    sql: &str,
    column_types: &[String],
    rows: &[Vec<PrimitiveValue>],
) -> Result<CopyOutcome, SlonikError> {
    let row_count = driver.copy_in_binary(connection_id, sql, column_types, rows).await?;
    Ok(CopyOutcome { row_count })
}
