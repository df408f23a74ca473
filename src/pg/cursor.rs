//! Incremental execution of a prepared statement through a named portal.
//!
//! A [`Cursor`] moves through `Unopened -> Open(suspended) ->
//! Open(exhausted) -> Closed`. The first `read` binds the portal and
//! executes it with a row limit; later reads only re-execute it. Reads and
//! closes on one cursor are serialized.
//!
//! [`RowStream`] layers demand on top: rows are only fetched while the
//! consumer has outstanding demand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use uuid::Uuid;

use super::command::{PgCodec, PgCommand, PgResponse};
use super::connection::unexpected_response;
use super::statement::{PreparedStatement, Row};
use super::types::PgValue;
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Unopened,
    Open { suspended: bool },
    Closed,
}

/// Server-side portal over a prepared statement.
pub struct Cursor {
    pipeline: Pipeline<PgCodec>,
    statement: Arc<PreparedStatement>,
    portal: String,
    /// Held across a read or close; owns the arguments until the portal is bound
    gate: AsyncMutex<Option<Vec<PgValue>>>,
    state: Mutex<CursorState>,
}

impl Cursor {
    pub(crate) fn new(
        pipeline: Pipeline<PgCodec>,
        statement: Arc<PreparedStatement>,
        params: Vec<PgValue>,
    ) -> Self {
        Self {
            pipeline,
            statement,
            portal: format!("__sw_portal_{}", Uuid::new_v4().simple()),
            gate: AsyncMutex::new(Some(params)),
            state: Mutex::new(CursorState::Unopened),
        }
    }

    pub fn portal(&self) -> &str {
        &self.portal
    }

    pub fn statement(&self) -> &Arc<PreparedStatement> {
        &self.statement
    }

    /// Fetch up to `max_rows` rows.
    ///
    /// Fails without touching the wire once the cursor is exhausted or
    /// closed. Any other failure closes the cursor.
    pub async fn read(&self, max_rows: u32) -> Result<Vec<Row>> {
        let max_rows = i32::try_from(max_rows)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| Error::Misuse(format!("invalid fetch size: {}", max_rows)))?;

        let mut params = self.gate.lock().await;
        let bind = match *self.state.lock() {
            CursorState::Unopened => true,
            CursorState::Open { suspended: true } => false,
            CursorState::Open { suspended: false } => {
                return Err(Error::Misuse("cursor is exhausted".to_string()))
            }
            CursorState::Closed => return Err(Error::Misuse("cursor is closed".to_string())),
        };

        let command = PgCommand::Execute {
            statement: Arc::clone(&self.statement),
            params: if bind {
                params.take().unwrap_or_default()
            } else {
                Vec::new()
            },
            portal: self.portal.clone(),
            max_rows,
            bind,
        };

        match self.pipeline.schedule(command).await {
            Ok(PgResponse::Executed(outcome)) => {
                *self.state.lock() = CursorState::Open {
                    suspended: outcome.suspended,
                };
                Ok(outcome.result.rows)
            }
            Ok(other) => {
                *self.state.lock() = CursorState::Closed;
                Err(unexpected_response(&other))
            }
            Err(e) => {
                *self.state.lock() = CursorState::Closed;
                Err(e)
            }
        }
    }

    /// Whether the last read stopped at its row limit.
    ///
    /// Calling this before the first read is an error.
    pub fn has_more(&self) -> Result<bool> {
        match *self.state.lock() {
            CursorState::Unopened => Err(Error::Misuse(
                "has_more called before the first read".to_string(),
            )),
            CursorState::Open { suspended } => Ok(suspended),
            CursorState::Closed => Ok(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.state.lock() == CursorState::Closed
    }

    /// Release the portal. A no-op if it was never opened or is closed.
    pub async fn close(&self) -> Result<()> {
        let _gate = self.gate.lock().await;
        let previous = std::mem::replace(&mut *self.state.lock(), CursorState::Closed);
        if !matches!(previous, CursorState::Open { .. }) {
            return Ok(());
        }
        match self
            .pipeline
            .schedule(PgCommand::ClosePortal(self.portal.clone()))
            .await?
        {
            PgResponse::Closed => Ok(()),
            other => Err(unexpected_response(&other)),
        }
    }

    /// Stream rows in batches of `fetch_size`, driven by demand.
    pub fn into_rows(self, fetch_size: u32) -> RowStream {
        RowStream::new(self, fetch_size)
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if matches!(*self.state.get_mut(), CursorState::Open { .. }) {
            drop(
                self.pipeline
                    .schedule(PgCommand::ClosePortal(std::mem::take(&mut self.portal))),
            );
        }
    }
}

// ============================================================================
// Demand
// ============================================================================

#[derive(Default)]
struct Demand {
    requested: AtomicU64,
    paused: AtomicBool,
    notify: Notify,
}

impl Demand {
    fn ready(&self) -> bool {
        !self.paused.load(Ordering::Acquire) && self.requested.load(Ordering::Acquire) > 0
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.ready() {
                return;
            }
            notified.await;
        }
    }

    fn consume(&self) {
        let _ = self
            .requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match n {
                u64::MAX => None,
                0 => None,
                n => Some(n - 1),
            });
    }
}

/// Controls how many rows a [`RowStream`] may deliver.
///
/// `u64::MAX` requested rows means unbounded demand.
#[derive(Clone)]
pub struct DemandHandle(Arc<Demand>);

impl DemandHandle {
    /// Allow `rows` more rows to be delivered.
    pub fn request(&self, rows: u64) {
        let _ = self
            .0
            .requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_add(rows))
            });
        self.0.notify.notify_waiters();
    }

    pub fn pause(&self) {
        self.0.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.0.paused.store(false, Ordering::Release);
        self.0.notify.notify_waiters();
    }

    /// Rows that may still be delivered.
    pub fn outstanding(&self) -> u64 {
        self.0.requested.load(Ordering::Acquire)
    }
}

// ============================================================================
// Row Stream
// ============================================================================

/// Demand-driven row iterator over a [`Cursor`].
///
/// Starts with no demand; nothing is fetched until rows are requested
/// through [`RowStream::demand`]. The portal is closed once exhausted.
pub struct RowStream {
    cursor: Cursor,
    fetch_size: u32,
    demand: Arc<Demand>,
    buffer: VecDeque<Row>,
    done: bool,
}

impl RowStream {
    fn new(cursor: Cursor, fetch_size: u32) -> Self {
        Self {
            cursor,
            fetch_size: fetch_size.max(1),
            demand: Arc::new(Demand::default()),
            buffer: VecDeque::new(),
            done: false,
        }
    }

    pub fn demand(&self) -> DemandHandle {
        DemandHandle(Arc::clone(&self.demand))
    }

    /// Next row, waiting for demand first. `None` once exhausted.
    pub async fn next(&mut self) -> Option<Result<Row>> {
        if self.done && self.buffer.is_empty() {
            return None;
        }
        self.demand.wait().await;

        if self.buffer.is_empty() {
            if let Err(e) = self.fetch().await {
                self.done = true;
                return Some(Err(e));
            }
        }

        let row = self.buffer.pop_front()?;
        self.demand.consume();
        Some(Ok(row))
    }

    async fn fetch(&mut self) -> Result<()> {
        let rows = self.cursor.read(self.fetch_size).await?;
        self.buffer.extend(rows);
        if !self.cursor.has_more()? {
            self.done = true;
            self.cursor.close().await?;
        }
        Ok(())
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Row>> + Send {
        futures::stream::unfold(self, |mut rows| async move {
            rows.next().await.map(|item| (item, rows))
        })
    }
}
