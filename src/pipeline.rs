//! Per-connection command pipeline.
//!
//! Each connection is owned by a driver task. Callers talk to it through a
//! cloneable [`Pipeline`] handle that posts requests into the driver's inbox;
//! all queue and socket state is touched only by the driver, so responses can
//! be matched to commands in strict FIFO order without locks.
//!
//! The driver keeps:
//! - a pending queue of commands not yet written
//! - an in-flight queue of commands written and awaiting responses, bounded
//!   by the pipelining limit
//! - one write buffer, filled by each drain cycle and written out while the
//!   driver keeps reading, so a peer that replies before it has read
//!   everything can never stall the connection

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use crate::codec::{CommandExchange, Inbound, ProtocolCodec, Step};
use crate::connection::{ConnectionEvent, ConnectionState, Holder, StateCell};
use crate::error::{Error, Result};

/// Default number of commands allowed in flight on one connection.
pub const DEFAULT_PIPELINING_LIMIT: usize = 256;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Snapshot of a pipeline's queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub state: ConnectionState,
    pub pending: usize,
    pub in_flight: usize,
    pub limit: usize,
}

enum Request<C: ProtocolCodec> {
    Schedule {
        command: C::Command,
        reply: Reply<C::Output>,
        handshake: bool,
    },
    Close(oneshot::Sender<()>),
    SetHolder(Option<Arc<dyn Holder>>),
    Stats(oneshot::Sender<PipelineStats>),
}

// ============================================================================
// Scheduled
// ============================================================================

/// Completion of a scheduled command.
///
/// The command is handed to the connection when it is scheduled, not when
/// this future is first polled. Dropping the future does not cancel the
/// command; its result is discarded.
pub struct Scheduled<T> {
    inner: ScheduledInner<T>,
}

enum ScheduledInner<T> {
    Pending(oneshot::Receiver<Result<T>>),
    Failed(Option<Error>),
}

impl<T> Scheduled<T> {
    /// A command rejected before reaching the connection.
    pub fn failed(error: Error) -> Self {
        Self {
            inner: ScheduledInner::Failed(Some(error)),
        }
    }

    fn pending(rx: oneshot::Receiver<Result<T>>) -> Self {
        Self {
            inner: ScheduledInner::Pending(rx),
        }
    }
}

impl<T> Unpin for Scheduled<T> {}

impl<T> Future for Scheduled<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            ScheduledInner::Pending(rx) => Pin::new(rx).poll(cx).map(|received| match received {
                Ok(result) => result,
                // Driver gone without replying
                Err(_) => Err(Error::Closed(None)),
            }),
            ScheduledInner::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(Error::Closed(None))))
            }
        }
    }
}

// ============================================================================
// Pipeline Handle
// ============================================================================

/// Handle to a connection's driver task.
pub struct Pipeline<C: ProtocolCodec> {
    inbox: mpsc::UnboundedSender<Request<C>>,
    state: StateCell,
}

impl<C: ProtocolCodec> Clone for Pipeline<C> {
    fn clone(&self) -> Self {
        Self {
            inbox: self.inbox.clone(),
            state: self.state.clone(),
        }
    }
}

impl<C: ProtocolCodec> Pipeline<C> {
    /// Start a driver task over `socket`.
    ///
    /// `state` is the connection's state cell; a pipeline started in
    /// `Authenticating` only admits handshake commands until one succeeds.
    /// Must be called within a tokio runtime.
    pub fn spawn<S>(socket: S, codec: C, limit: usize, state: StateCell) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (read_half, write_half) = tokio::io::split(socket);

        let driver = Driver {
            reader: FramedRead::new(read_half, codec.framer()),
            writer: write_half,
            codec,
            inbox: rx,
            inbox_open: true,
            write_buf: BytesMut::with_capacity(8 * 1024),
            pending: VecDeque::new(),
            in_flight: VecDeque::new(),
            limit: limit.max(1),
            state: state.clone(),
            holder: None,
            unflushed: false,
            close_sent: false,
            close_waiters: Vec::new(),
        };
        tokio::spawn(driver.run());

        Self { inbox: tx, state }
    }

    /// Queue a command. Fails immediately unless the connection is `Ready`.
    pub fn schedule(&self, command: C::Command) -> Scheduled<C::Output> {
        self.submit(command, false)
    }

    /// Queue the startup/authentication command.
    ///
    /// Admitted while `Authenticating`; success moves the connection to
    /// `Ready`, failure closes it.
    pub fn schedule_handshake(&self, command: C::Command) -> Scheduled<C::Output> {
        self.submit(command, true)
    }

    fn submit(&self, command: C::Command, handshake: bool) -> Scheduled<C::Output> {
        let state = self.state.get();
        if !admits(state, handshake) {
            return Scheduled::failed(Error::NotOpen(state));
        }

        let (tx, rx) = oneshot::channel();
        let request = Request::Schedule {
            command,
            reply: tx,
            handshake,
        };
        if self.inbox.send(request).is_err() {
            return Scheduled::failed(Error::NotOpen(ConnectionState::Closed));
        }
        Scheduled::pending(rx)
    }

    /// Close the connection after everything already queued has been sent.
    ///
    /// Resolves once the connection is closed. Safe to call repeatedly.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inbox.send(Request::Close(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Install (or clear) the connection's holder.
    ///
    /// A holder installed on an already closed connection is told so at once.
    pub fn set_holder(&self, holder: Option<Arc<dyn Holder>>) {
        if let Err(mpsc::error::SendError(Request::SetHolder(Some(holder)))) =
            self.inbox.send(Request::SetHolder(holder))
        {
            holder.handle_closed();
        }
    }

    /// Current queue sizes, as seen by the driver.
    pub async fn stats(&self) -> PipelineStats {
        let closed = PipelineStats {
            state: ConnectionState::Closed,
            pending: 0,
            in_flight: 0,
            limit: 0,
        };
        let (tx, rx) = oneshot::channel();
        if self.inbox.send(Request::Stats(tx)).is_err() {
            return closed;
        }
        rx.await.unwrap_or(closed)
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.state.get() == ConnectionState::Ready
    }
}

fn admits(state: ConnectionState, handshake: bool) -> bool {
    match state {
        ConnectionState::Ready => true,
        ConnectionState::Authenticating => handshake,
        _ => false,
    }
}

/// One partial write of `buf`, or a flush once it is empty.
async fn write_some<W: AsyncWrite + Unpin>(writer: &mut W, buf: &[u8]) -> Result<usize> {
    if buf.is_empty() {
        writer.flush().await?;
        return Ok(0);
    }
    Ok(writer.write(buf).await?)
}

// ============================================================================
// Driver
// ============================================================================

enum Queued<C: ProtocolCodec> {
    Command {
        command: C::Command,
        reply: Reply<C::Output>,
        handshake: bool,
    },
    Close,
}

struct InFlight<C: ProtocolCodec> {
    exchange: C::Exchange,
    reply: Reply<C::Output>,
    handshake: bool,
}

struct Driver<C: ProtocolCodec, S> {
    codec: C,
    inbox: mpsc::UnboundedReceiver<Request<C>>,
    inbox_open: bool,
    reader: FramedRead<ReadHalf<S>, C::Framer>,
    writer: WriteHalf<S>,
    write_buf: BytesMut,
    pending: VecDeque<Queued<C>>,
    in_flight: VecDeque<InFlight<C>>,
    limit: usize,
    state: StateCell,
    holder: Option<Arc<dyn Holder>>,
    /// Bytes were written since the last flush.
    unflushed: bool,
    /// Termination message queued; nothing may follow it.
    close_sent: bool,
    close_waiters: Vec<oneshot::Sender<()>>,
}

impl<C, S> Driver<C, S>
where
    C: ProtocolCodec,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn run(mut self) {
        let cause = loop {
            if self.close_sent
                && self.in_flight.is_empty()
                && self.write_buf.is_empty()
                && !self.unflushed
            {
                break None;
            }

            tokio::select! {
                request = self.inbox.recv(), if self.inbox_open => {
                    let outcome = match request {
                        Some(request) => self.handle_request(request),
                        None => {
                            // Every handle dropped
                            self.inbox_open = false;
                            self.begin_close();
                            Ok(())
                        }
                    };
                    if let Err(e) = outcome {
                        break Some(e);
                    }
                }
                written = write_some(&mut self.writer, &self.write_buf),
                    if !self.write_buf.is_empty() || self.unflushed =>
                {
                    if let Err(e) = written.and_then(|n| self.advance(n)) {
                        break Some(e);
                    }
                }
                frame = self.reader.next() => match frame {
                    Some(Ok(message)) => {
                        if let Err(e) = self.handle_message(message) {
                            break Some(e);
                        }
                    }
                    Some(Err(e)) => break Some(e),
                    None if self.close_sent => break None,
                    None => {
                        break Some(Error::from(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "server closed the connection",
                        )));
                    }
                },
            }
        };

        self.shutdown(cause).await;
    }

    fn handle_request(&mut self, request: Request<C>) -> Result<()> {
        match request {
            Request::Schedule {
                command,
                reply,
                handshake,
            } => {
                // Re-checked here: the state may have moved since the handle looked
                let state = self.state.get();
                if !admits(state, handshake) {
                    let _ = reply.send(Err(Error::NotOpen(state)));
                    return Ok(());
                }
                self.pending.push_back(Queued::Command {
                    command,
                    reply,
                    handshake,
                });
                self.drain();
            }
            Request::Close(reply) => {
                self.close_waiters.push(reply);
                self.begin_close();
            }
            Request::SetHolder(holder) => self.holder = holder,
            Request::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
        Ok(())
    }

    fn begin_close(&mut self) {
        if matches!(
            self.state.get(),
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return;
        }
        self.state.set(ConnectionState::Closing);
        // Bypasses admission so it is always the last thing written
        self.pending.push_back(Queued::Close);
        self.drain();
    }

    /// Move pending commands in flight up to the limit. Their bytes go out
    /// through the write branch of the driver loop.
    fn drain(&mut self) {
        while !self.close_sent && self.in_flight.len() < self.limit {
            let Some(queued) = self.pending.pop_front() else {
                break;
            };
            match queued {
                Queued::Command {
                    command,
                    reply,
                    handshake,
                } => {
                    let mark = self.write_buf.len();
                    match self.codec.encode(command, &mut self.write_buf) {
                        Ok(exchange) => self.in_flight.push_back(InFlight {
                            exchange,
                            reply,
                            handshake,
                        }),
                        Err(e) => {
                            // Never written; only this command fails
                            self.write_buf.truncate(mark);
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                Queued::Close => {
                    self.codec.encode_close(&mut self.write_buf);
                    self.close_sent = true;
                }
            }
        }
    }

    /// Account for a completed `write_some`.
    fn advance(&mut self, written: usize) -> Result<()> {
        if self.write_buf.is_empty() {
            // That was the flush
            self.unflushed = false;
            return Ok(());
        }
        if written == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero).into());
        }
        self.write_buf.advance(written);
        self.unflushed = true;
        Ok(())
    }

    fn handle_message(&mut self, message: C::Message) -> Result<()> {
        let message = match self.codec.classify(message)? {
            Inbound::Event(event) => {
                self.dispatch_event(event);
                return Ok(());
            }
            Inbound::Response(message) => message,
        };

        let step = match self.in_flight.front_mut() {
            Some(head) => head.exchange.on_message(message, &mut self.write_buf),
            None => {
                return Err(Error::Protocol(
                    "response received with no command in flight".to_string(),
                ))
            }
        };

        let Step::Done(result) = step else {
            return Ok(());
        };
        let Some(done) = self.in_flight.pop_front() else {
            return Ok(());
        };

        if done.handshake {
            match &result {
                Ok(_) => {
                    if self.state.get() == ConnectionState::Authenticating {
                        self.state.set(ConnectionState::Ready);
                    }
                }
                Err(e) => {
                    let cause = e.clone();
                    let _ = done.reply.send(result);
                    return Err(cause);
                }
            }
        }

        // Refill the window before handing the result back
        self.drain();
        let _ = done.reply.send(result);
        Ok(())
    }

    fn dispatch_event(&self, event: ConnectionEvent) {
        match &self.holder {
            Some(holder) => holder.handle_event(event),
            None => debug!(?event, "no holder installed, dropping event"),
        }
    }

    fn stats(&self) -> PipelineStats {
        PipelineStats {
            state: self.state.get(),
            pending: self.pending.len(),
            in_flight: self.in_flight.len(),
            limit: self.limit,
        }
    }

    async fn shutdown(mut self, cause: Option<Error>) {
        self.state.set(ConnectionState::Closed);
        match &cause {
            Some(e) => warn!(error = %e, "connection closed on error"),
            None => debug!("connection closed"),
        }

        if let Some(holder) = self.holder.take() {
            if let Some(e) = &cause {
                holder.handle_exception(e);
            }
            holder.handle_closed();
        }

        let error = Error::Closed(cause.map(Arc::new));
        for entry in self.in_flight.drain(..) {
            let _ = entry.reply.send(Err(error.clone()));
        }
        for queued in self.pending.drain(..) {
            if let Queued::Command { reply, .. } = queued {
                let _ = reply.send(Err(error.clone()));
            }
        }

        let _ = self.writer.shutdown().await;

        self.inbox.close();
        while let Ok(request) = self.inbox.try_recv() {
            match request {
                Request::Schedule { reply, .. } => {
                    let _ = reply.send(Err(Error::NotOpen(ConnectionState::Closed)));
                }
                Request::Close(reply) => self.close_waiters.push(reply),
                Request::SetHolder(Some(holder)) => holder.handle_closed(),
                Request::SetHolder(None) => {}
                Request::Stats(reply) => {
                    let _ = reply.send(self.stats());
                }
            }
        }

        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}
