//! Error types shared by every layer of the client.
//!
//! Errors are `Clone` so that a single connection-fatal cause can be handed
//! to every command that was pending or in flight when the connection died.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::connection::ConnectionState;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the codec, pipeline, cursor and pool layers.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Socket read/write failure or unexpected EOF.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// Corrupt frame header (bad length or tag). Always fatal to the connection.
    #[error("Framing error: {0}")]
    Framing(String),

    /// Message that could not be interpreted (unexpected type, truncated body).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed or the server asked for an unsupported method.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The server answered a command with an error message.
    #[error("{0}")]
    Server(Box<ServerError>),

    /// Value could not be encoded or decoded.
    #[error("Type error: {0}")]
    Type(String),

    /// A command was scheduled while the connection was not accepting work.
    #[error("Connection not open (state: {0:?})")]
    NotOpen(ConnectionState),

    /// The connection closed; carries the error that caused it, if any.
    #[error("{}", closed_message(.0))]
    Closed(Option<Arc<Error>>),

    /// The pool was shut down.
    #[error("Connection pool closed")]
    PoolClosed,

    /// The pool's bounded wait queue is full.
    #[error("Max waiter size reached")]
    WaitQueueFull,

    /// No pooled connection became available within the connection timeout.
    #[error("Timed out waiting for a pooled connection after {0:?}")]
    AcquireTimeout(std::time::Duration),

    /// Illegal call on a local object (exhausted cursor, double close).
    #[error("Illegal call: {0}")]
    Misuse(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

fn closed_message(cause: &Option<Arc<Error>>) -> String {
    match cause {
        Some(cause) => format!("Connection closed: {}", cause),
        None => "Connection closed".to_string(),
    }
}

impl Error {
    /// SQLSTATE code when the error came from the server.
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Server(e) => Some(&e.code),
            _ => None,
        }
    }

    /// The error that caused a connection close, if this is one.
    pub fn close_cause(&self) -> Option<&Error> {
        match self {
            Error::Closed(Some(cause)) => Some(cause),
            _ => None,
        }
    }

    /// Whether this error was reported because the connection closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed(_))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<ServerError> for Error {
    fn from(e: ServerError) -> Self {
        Error::Server(Box::new(e))
    }
}

// ============================================================================
// Server Errors
// ============================================================================

/// Error or notice reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<u32>,
    pub where_: Option<String>,
}

impl ServerError {
    /// Build from the tagged fields of an error or notice message.
    pub fn from_fields(fields: &HashMap<u8, String>) -> Self {
        Self {
            // 'V' is the non-localized severity, present on newer servers
            severity: fields
                .get(&b'V')
                .or_else(|| fields.get(&b'S'))
                .cloned()
                .unwrap_or_default(),
            code: fields.get(&b'C').cloned().unwrap_or_default(),
            message: fields.get(&b'M').cloned().unwrap_or_default(),
            detail: fields.get(&b'D').cloned(),
            hint: fields.get(&b'H').cloned(),
            position: fields.get(&b'P').and_then(|p| p.parse().ok()),
            where_: fields.get(&b'W').cloned(),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(d) = &self.detail {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}
