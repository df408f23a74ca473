//! sqlwire - a pipelined database wire-protocol client.
//!
//! The command pipeline and the connection pool are written once against
//! the [`codec::ProtocolCodec`] capability; [`pg`] is the PostgreSQL
//! backend built on them.
//!
//! ```no_run
//! use sqlwire::pg::{ConnectOptions, PgPool, PgValue};
//! use sqlwire::PoolOptions;
//!
//! # async fn run() -> sqlwire::Result<()> {
//! let options = ConnectOptions::new().host("localhost").user("app").password("secret");
//! let pool = PgPool::connect(options, PoolOptions::default().max_size(8))?;
//! let result = pool.query("SELECT $1::int4 + 1", &[PgValue::Int4(41)]).await?;
//! assert_eq!(result.rows[0].get(0), Some(&PgValue::Int4(42)));
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod pg;
pub mod pipeline;
pub mod pool;

pub use connection::{ConnectionEvent, ConnectionState, Holder};
pub use error::{Error, Result, ServerError};
pub use pipeline::{Pipeline, PipelineStats};
pub use pool::{Pool, PoolOptions, PoolStatus, PoolStrategy, PooledConnection};
