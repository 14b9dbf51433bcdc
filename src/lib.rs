//! `slonik`: safe SQL composition, typed result parsing, and a
//! connection/transaction lifecycle manager with interceptors and retries.
//!
//! The entry points are [`pool::Pool`] (acquire a handle from a URI and a
//! [`config::PoolConfig`]) and the [`sql!`] builder macro for assembling
//! [`token::SqlToken`] trees. Everything downstream of a built token —
//! interpretation, connection acquisition, retries, row parsing — is
//! internal pipeline machinery described module-by-module below.

pub mod config;
pub mod copy;
pub mod driver;
pub mod error;
pub mod handle;
pub mod interceptor;
pub mod interpreter;
pub mod pipeline;
pub mod pool;
pub mod row;
pub mod stream;
pub mod token;
pub mod transaction;

pub use config::{ConnectionOptions, PoolConfig, PoolConfigBuilder, SslMode, TimeoutSetting};
pub use copy::CopyOutcome;
pub use driver::{Driver, TokioPostgresDriver};
pub use error::SlonikError;
pub use handle::Queryable;
pub use interceptor::{ConnectionKind, HookResult, Interceptor, PoolRouting, QueryContext, QueryResult};
pub use pool::{Pool, PoolState, PooledConnection};
pub use row::{Row, RowSchema, TypeParser, TypeRegistry};
pub use stream::RowStream;
pub use token::{
    array, binary, identifier, join, json, jsonb, literal_value, raw_fragments, typed, unnest,
    IntoValueExpr, PrimitiveValue, SqlToken, ValueExpr,
};
pub use transaction::Transaction;
