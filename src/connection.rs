//! Backend-independent connection pieces: lifecycle state, the holder
//! interface and out-of-band server events.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, ServerError};

// ============================================================================
// Connection State
// ============================================================================

/// Lifecycle of a physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Init = 0,
    Connecting = 1,
    Authenticating = 2,
    Ready = 3,
    Closing = 4,
    Closed = 5,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Init,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Authenticating,
            3 => ConnectionState::Ready,
            4 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Connection state shared between the driver task and its handles.
///
/// Only the driver writes it once the pipeline is running; handles read it
/// to reject commands synchronously.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub fn new(state: ConnectionState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    #[inline]
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ConnectionState) {
        let previous = ConnectionState::from_u8(self.0.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "connection state changed");
        }
    }
}

// ============================================================================
// Holder
// ============================================================================

/// Asynchronous message from the server that belongs to no command.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// `NOTIFY` payload on a channel the session listens to.
    Notification {
        process_id: i32,
        channel: String,
        payload: String,
    },
    /// Informational notice (warnings, `RAISE NOTICE`, ...).
    Notice(Box<ServerError>),
    /// Runtime parameter changed after the handshake.
    ParameterStatus { name: String, value: String },
}

/// Owner-side callbacks of a connection.
///
/// `handle_closed` is invoked exactly once per connection. When the close
/// was caused by an error, `handle_exception` is invoked right before it.
pub trait Holder: Send + Sync + 'static {
    fn handle_event(&self, event: ConnectionEvent);

    fn handle_closed(&self);

    fn handle_exception(&self, error: &Error);
}

// ============================================================================
// Socket
// ============================================================================

/// Byte stream a connection runs over (TCP, TLS, in-memory duplex...).
pub trait Socket: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Socket for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased socket, used once TLS may have replaced the plain stream.
pub type BoxedSocket = Box<dyn Socket>;
