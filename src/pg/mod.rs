//! PostgreSQL v3 wire protocol backend.
//!
//! Architecture:
//! - `protocol`: Low-level wire protocol encoding/decoding
//! - `types`, `numeric`, `datetime`, `array`: value codecs and the type registry
//! - `command`: commands, response exchanges and the pipeline codec
//! - `statement`: Prepared statements, rows and the statement cache
//! - `connection`: Connect options, handshake, TLS sequencing, cancellation
//! - `cursor`: Portals read incrementally, with a demand-driven row stream
//! - `scram`: SCRAM-SHA-256 authentication
//! - `pool`: Connection factory for the generic pool

mod array;
pub mod command;
pub mod connection;
pub mod cursor;
pub mod datetime;
pub mod numeric;
pub mod pool;
pub mod protocol;
pub mod scram;
pub mod statement;
pub mod types;

#[cfg(test)]
mod tests;

pub use command::{md5_password, PgCodec, PgCommand, PgResponse, Session};
pub use connection::{ConnectOptions, PgConnection, SslMode, TlsUpgrade};
pub use cursor::{Cursor, DemandHandle, RowStream};
pub use datetime::Interval;
pub use numeric::Numeric;
pub use pool::{PgConnector, PgPool};
pub use statement::{PreparedStatement, QueryResult, Row, RowDescriptor};
pub use types::{Oid, PgValue, TypeKind, TypeRegistry};
