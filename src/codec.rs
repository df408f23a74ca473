//! The protocol capability the pipeline is written against.
//!
//! A backend supplies a frame decoder, a way to serialize commands, and one
//! exchange state machine per command that consumes the command's response
//! messages. The pipeline never looks inside messages.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::connection::ConnectionEvent;
use crate::error::{Error, Result};

/// Result of routing one inbound message.
#[derive(Debug)]
pub enum Inbound<M> {
    /// Belongs to the oldest in-flight command.
    Response(M),
    /// Out-of-band; goes to the connection holder.
    Event(ConnectionEvent),
}

/// Progress of a command's response exchange.
#[derive(Debug)]
pub enum Step<T> {
    /// More messages are expected.
    Continue,
    /// The command is complete.
    Done(Result<T>),
}

/// Per-command response state machine.
pub trait CommandExchange: Send + 'static {
    type Message;
    type Output;

    /// Consume one response message.
    ///
    /// Bytes written to `out` are sent to the server before the next message
    /// is read; this is how interactive exchanges (authentication) reply.
    /// A message the exchange cannot interpret is reported through
    /// `Step::Done(Err(..))` once the exchange reaches its end, so that the
    /// error stays attributed to this command.
    fn on_message(&mut self, message: Self::Message, out: &mut BytesMut) -> Step<Self::Output>;
}

/// A backend wire protocol.
pub trait ProtocolCodec: Send + 'static {
    type Command: Send + 'static;
    type Output: Send + 'static;
    type Message: Send + 'static;
    type Framer: Decoder<Item = Self::Message, Error = Error> + Send + 'static;
    type Exchange: CommandExchange<Message = Self::Message, Output = Self::Output>;

    /// Streaming frame decoder for the inbound byte stream.
    fn framer(&self) -> Self::Framer;

    /// Serialize `command` into `buf` and return the exchange awaiting its
    /// response. Bytes written before an error are discarded by the caller.
    fn encode(&mut self, command: Self::Command, buf: &mut BytesMut) -> Result<Self::Exchange>;

    /// Route an inbound message. An error here is fatal to the connection.
    fn classify(&mut self, message: Self::Message) -> Result<Inbound<Self::Message>>;

    /// Serialize the connection termination message.
    fn encode_close(&mut self, buf: &mut BytesMut);
}
