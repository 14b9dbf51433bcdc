//! The crate's error taxonomy.
//!
//! Every error the pipeline can surface descends from [`SlonikError`]. Each
//! variant carries enough of the originating query (`sql`, `values`,
//! `query_id`) to let a caller log a useful report without re-threading that
//! context through every call site.

use crate::token::PrimitiveValue;
use thiserror::Error;
use uuid::Uuid;

/// Context common to most query-level errors.
#[derive(Debug, Clone, Default)]
pub struct QueryErrorContext {
    pub query_id: Option<Uuid>,
    pub sql: Option<String>,
    pub values: Vec<PrimitiveValue>,
}

impl QueryErrorContext {
    pub fn new(query_id: Uuid, sql: impl Into<String>, values: Vec<PrimitiveValue>) -> Self {
        Self {
            query_id: Some(query_id),
            sql: Some(sql.into()),
            values,
        }
    }
}

/// The root error type returned by every public entry point.
#[derive(Debug, Error)]
pub enum SlonikError {
    #[error("invalid input: {message}")]
    InvalidInput {
        message: String,
        ctx: QueryErrorContext,
    },

    #[error("could not acquire a connection from the pool: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<anyhow_like::BoxError>,
    },

    #[error("pool has been ended, no further connections can be acquired")]
    PoolEnded,

    #[error("concurrent use of a pinned connection handle is not allowed")]
    Concurrency,

    #[error("statement exceeded its timeout: {message}")]
    StatementTimeout {
        message: String,
        ctx: QueryErrorContext,
    },

    #[error("idle transaction session timeout: {message}")]
    IdleTransactionTimeout {
        message: String,
        ctx: QueryErrorContext,
    },

    #[error("{message}")]
    NotFound {
        message: String,
        ctx: QueryErrorContext,
    },

    #[error("data integrity violation: {message}")]
    DataIntegrity {
        message: String,
        ctx: QueryErrorContext,
    },

    #[error("row failed schema validation: {message}")]
    SchemaValidation {
        message: String,
        ctx: QueryErrorContext,
    },

    #[error("unique constraint '{constraint}' violated")]
    UniqueIntegrityConstraintViolation {
        constraint: String,
        ctx: QueryErrorContext,
    },

    #[error("foreign key constraint '{constraint}' violated")]
    ForeignKeyIntegrityConstraintViolation {
        constraint: String,
        ctx: QueryErrorContext,
    },

    #[error("not-null constraint on column '{column}' violated")]
    NotNullIntegrityConstraintViolation {
        column: String,
        ctx: QueryErrorContext,
    },

    #[error("check constraint '{constraint}' violated")]
    CheckIntegrityConstraintViolation {
        constraint: String,
        ctx: QueryErrorContext,
    },

    #[error("tuple moved to another partition concurrently")]
    TupleMovedToAnotherPartition { ctx: QueryErrorContext },

    /// SQLSTATE class `40` (transaction rollback) — the sole class the
    /// transaction/query retry policy acts on (spec §4.F/§7). Named as its
    /// own variant, rather than left folded into `Driver`, so the retry
    /// decision in `is_transaction_rollback_class` — and tests of it — don't
    /// need a live `tokio_postgres::Error` to construct.
    #[error("transaction rollback (SQLSTATE {sqlstate})")]
    TransactionRollback {
        sqlstate: String,
        ctx: QueryErrorContext,
    },

    #[error("backend was terminated: {message}")]
    BackendTerminated { message: String },

    #[error("input syntax error: {message}")]
    InputSyntax {
        message: String,
        ctx: QueryErrorContext,
    },

    #[error("invalid server configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("unexpected internal state: {message}")]
    UnexpectedState { message: String },

    #[error("underlying driver error: {0}")]
    Driver(#[from] tokio_postgres::Error),
}

impl SlonikError {
    pub fn query_id(&self) -> Option<Uuid> {
        self.ctx().and_then(|c| c.query_id)
    }

    fn ctx(&self) -> Option<&QueryErrorContext> {
        match self {
            SlonikError::InvalidInput { ctx, .. }
            | SlonikError::StatementTimeout { ctx, .. }
            | SlonikError::IdleTransactionTimeout { ctx, .. }
            | SlonikError::NotFound { ctx, .. }
            | SlonikError::DataIntegrity { ctx, .. }
            | SlonikError::SchemaValidation { ctx, .. }
            | SlonikError::UniqueIntegrityConstraintViolation { ctx, .. }
            | SlonikError::ForeignKeyIntegrityConstraintViolation { ctx, .. }
            | SlonikError::NotNullIntegrityConstraintViolation { ctx, .. }
            | SlonikError::CheckIntegrityConstraintViolation { ctx, .. }
            | SlonikError::TupleMovedToAnotherPartition { ctx }
            | SlonikError::TransactionRollback { ctx, .. }
            | SlonikError::InputSyntax { ctx, .. } => Some(ctx),
            _ => None,
        }
    }

    /// `true` for the sole class of error the transaction/query retry policy
    /// acts on (SQLSTATE class `40`, transaction rollback).
    pub fn is_transaction_rollback_class(&self) -> bool {
        matches!(self, SlonikError::TransactionRollback { .. })
    }

    /// The reported SQLSTATE, for `TransactionRollback` only — used by the
    /// retry loop's logging, not by the retry decision itself.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            SlonikError::TransactionRollback { sqlstate, .. } => Some(sqlstate),
            _ => None,
        }
    }
}

/// Maps a driver-reported SQLSTATE to the crate's error taxonomy. Called once,
/// at the boundary where a `tokio_postgres::Error` is about to escape the
/// pipeline (spec §7: "driver errors are mapped to the taxonomy before they
/// escape the pipeline").
pub fn map_driver_error(err: tokio_postgres::Error, ctx: QueryErrorContext) -> SlonikError {
    use tokio_postgres::error::SqlState;

    let Some(code) = err.code() else {
        return SlonikError::Driver(err);
    };

    match *code {
        SqlState::UNIQUE_VIOLATION => SlonikError::UniqueIntegrityConstraintViolation {
            constraint: constraint_name(&err),
            ctx,
        },
        SqlState::FOREIGN_KEY_VIOLATION => SlonikError::ForeignKeyIntegrityConstraintViolation {
            constraint: constraint_name(&err),
            ctx,
        },
        SqlState::NOT_NULL_VIOLATION => SlonikError::NotNullIntegrityConstraintViolation {
            column: constraint_name(&err),
            ctx,
        },
        SqlState::CHECK_VIOLATION => SlonikError::CheckIntegrityConstraintViolation {
            constraint: constraint_name(&err),
            ctx,
        },
        SqlState::ADMIN_SHUTDOWN | SqlState::CRASH_SHUTDOWN => SlonikError::BackendTerminated {
            message: err.to_string(),
        },
        ref code if code.code() == "25P03" => SlonikError::IdleTransactionTimeout {
            message: err.to_string(),
            ctx,
        },
        SqlState::SYNTAX_ERROR => SlonikError::InputSyntax {
            message: err.to_string(),
            ctx,
        },
        SqlState::INVALID_PARAMETER_VALUE | SqlState::CONFIG_FILE_ERROR => {
            SlonikError::InvalidConfiguration {
                message: err.to_string(),
            }
        }
        ref code if code.code() == "40P03" => SlonikError::TupleMovedToAnotherPartition { ctx },
        ref code if code.code().starts_with("40") => SlonikError::TransactionRollback {
            sqlstate: code.code().to_string(),
            ctx,
        },
        _ => SlonikError::Driver(err),
    }
}

fn constraint_name(err: &tokio_postgres::Error) -> String {
    err.as_db_error()
        .and_then(|db| db.constraint())
        .unwrap_or("unknown")
        .to_string()
}

/// A tiny local substitute for a boxed `dyn Error` so `Connection` doesn't
/// need to name a concrete source type at every call site.
mod anyhow_like {
    pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
}
