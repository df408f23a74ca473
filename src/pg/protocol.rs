//! PostgreSQL v3 wire messages
//! (<https://www.postgresql.org/docs/current/protocol-message-formats.html>).
//!
//! Frontend messages are written into a shared output buffer; the length
//! field is reserved first and patched once the payload is complete.
//! Inbound bytes go through [`PgFrameCodec`], a streaming decoder that only
//! ever consumes whole frames, and each frame body is then parsed by
//! [`BackendMessage::parse`] with every read bounds-checked.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use super::types::Oid;
use crate::error::{Error, Result};

// ============================================================================
// Protocol Constants
// ============================================================================

/// `3 << 16`, protocol 3.0
pub const PROTOCOL_VERSION: i32 = 196608;

/// Magic code of the SSLRequest message
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Magic code of the CancelRequest message
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Largest frame accepted by default (1 GiB, the server's own limit)
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1 << 30;

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

impl Format {
    pub fn from_code(code: i16) -> Result<Self> {
        match code {
            0 => Ok(Format::Text),
            1 => Ok(Format::Binary),
            other => Err(Error::Protocol(format!("Unknown format code: {}", other))),
        }
    }
}

/// Status byte carried by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    /// Aborted transaction; commands fail until it ends
    Failed,
}

impl TryFrom<u8> for TransactionStatus {
    type Error = Error;

    fn try_from(b: u8) -> Result<Self> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(Error::Protocol(format!(
                "Unknown transaction status: {}",
                other as char
            ))),
        }
    }
}

/// Target of a Describe or Close message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

impl Target {
    fn code(self) -> u8 {
        match self {
            Target::Statement => b'S',
            Target::Portal => b'P',
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// A client-to-server message that appends itself to an output buffer.
pub trait FrontendMessage {
    fn encode(&self, buf: &mut BytesMut);
}

/// Write one message: optional tag, length placeholder, payload, then patch
/// the length (which counts itself but not the tag).
fn write_message(buf: &mut BytesMut, tag: Option<u8>, payload: impl FnOnce(&mut BytesMut)) {
    if let Some(tag) = tag {
        buf.put_u8(tag);
    }
    let start = buf.len();
    buf.put_i32(0);
    payload(buf);
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

/// Length of an Int16-counted list.
fn count16(what: &str, len: usize) -> Result<i16> {
    i16::try_from(len).map_err(|_| {
        Error::Type(format!("{} {} exceeds the protocol limit of {}", len, what, i16::MAX))
    })
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Untagged first message of a session.
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, None, |buf| {
            buf.put_i32(PROTOCOL_VERSION);
            put_cstring(buf, "user");
            put_cstring(buf, &self.user);
            if let Some(ref db) = self.database {
                put_cstring(buf, "database");
                put_cstring(buf, db);
            }
            for (key, value) in &self.options {
                put_cstring(buf, key);
                put_cstring(buf, value);
            }
            // Terminator
            buf.put_u8(0);
        });
    }
}

/// Request to upgrade the socket to TLS, answered by a single byte
#[derive(Debug, Clone, Copy)]
pub struct SslRequest;

impl FrontendMessage for SslRequest {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, None, |buf| buf.put_i32(SSL_REQUEST_CODE));
    }
}

/// Out-of-band cancellation, sent on its own short-lived socket
#[derive(Debug, Clone, Copy)]
pub struct CancelRequest {
    pub process_id: i32,
    pub secret_key: i32,
}

impl FrontendMessage for CancelRequest {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, None, |buf| {
            buf.put_i32(CANCEL_REQUEST_CODE);
            buf.put_i32(self.process_id);
            buf.put_i32(self.secret_key);
        });
    }
}

/// Cleartext or md5-hashed password ('p').
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, Some(b'p'), |buf| put_cstring(buf, &self.password));
    }
}

/// First SASL message ('p'): mechanism plus the client-first data.
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    pub mechanism: String,
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, Some(b'p'), |buf| {
            put_cstring(buf, &self.mechanism);
            buf.put_i32(self.data.len() as i32);
            buf.put_slice(&self.data);
        });
    }
}

/// Later SASL message ('p').
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, Some(b'p'), |buf| buf.put_slice(&self.data));
    }
}

/// 'Q': one or more statements, text results.
#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub query: String,
}

impl FrontendMessage for QueryMessage {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, Some(b'Q'), |buf| put_cstring(buf, &self.query));
    }
}

/// 'P': compile `query` as statement `name`.
#[derive(Debug, Clone)]
pub struct ParseMessage {
    pub name: String,
    pub query: String,
    pub param_types: Vec<Oid>,
}

impl ParseMessage {
    /// Fails without writing when there are more types than an Int16 count holds.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let count = count16("parameter types", self.param_types.len())?;
        write_message(buf, Some(b'P'), |buf| {
            put_cstring(buf, &self.name);
            put_cstring(buf, &self.query);
            buf.put_i16(count);
            for oid in &self.param_types {
                buf.put_i32(oid.as_i32());
            }
        });
        Ok(())
    }
}

/// 'B': bind arguments to a statement, creating a portal.
///
/// Parameter values are already encoded; `None` is SQL NULL.
#[derive(Debug, Clone)]
pub struct BindMessage {
    pub portal: String,
    pub statement: String,
    pub param_formats: Vec<Format>,
    pub params: Vec<Option<Bytes>>,
    pub result_formats: Vec<Format>,
}

impl BindMessage {
    /// Fails without writing when a count or a value length overflows its
    /// wire field.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let formats = count16("parameter formats", self.param_formats.len())?;
        let params = count16("parameters", self.params.len())?;
        let results = count16("result columns", self.result_formats.len())?;
        if let Some(len) = self
            .params
            .iter()
            .flatten()
            .map(Bytes::len)
            .find(|len| i32::try_from(*len).is_err())
        {
            return Err(Error::Type(format!(
                "parameter value of {} bytes does not fit a message",
                len
            )));
        }

        write_message(buf, Some(b'B'), |buf| {
            put_cstring(buf, &self.portal);
            put_cstring(buf, &self.statement);

            buf.put_i16(formats);
            for fmt in &self.param_formats {
                buf.put_i16(*fmt as i16);
            }

            buf.put_i16(params);
            for param in &self.params {
                match param {
                    Some(value) => {
                        buf.put_i32(value.len() as i32);
                        buf.put_slice(value);
                    }
                    None => buf.put_i32(-1),
                }
            }

            buf.put_i16(results);
            for fmt in &self.result_formats {
                buf.put_i16(*fmt as i16);
            }
        });
        Ok(())
    }
}

/// 'E': run a portal, up to `max_rows` rows (0 = all).
#[derive(Debug, Clone)]
pub struct ExecuteMessage {
    pub portal: String,
    /// 0 = no limit
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, Some(b'E'), |buf| {
            put_cstring(buf, &self.portal);
            buf.put_i32(self.max_rows);
        });
    }
}

/// 'D'
#[derive(Debug, Clone)]
pub struct DescribeMessage {
    pub target: Target,
    pub name: String,
}

impl FrontendMessage for DescribeMessage {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, Some(b'D'), |buf| {
            buf.put_u8(self.target.code());
            put_cstring(buf, &self.name);
        });
    }
}

/// 'C': release a statement or portal.
#[derive(Debug, Clone)]
pub struct CloseMessage {
    pub target: Target,
    pub name: String,
}

impl FrontendMessage for CloseMessage {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, Some(b'C'), |buf| {
            buf.put_u8(self.target.code());
            put_cstring(buf, &self.name);
        });
    }
}

/// 'S': ends an extended-protocol command; answered by ReadyForQuery.
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, Some(b'S'), |_| {});
    }
}

/// 'X'
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self, buf: &mut BytesMut) {
        write_message(buf, Some(b'X'), |_| {});
    }
}

// ============================================================================
// Framing
// ============================================================================

/// One backend message: tag byte and body (length field stripped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub body: Bytes,
}

/// Streaming frame decoder for the backend message stream.
///
/// Partial frames stay in the buffer until complete. A length field smaller
/// than 4 or above the configured maximum is a framing error.
#[derive(Debug, Clone)]
pub struct PgFrameCodec {
    max_frame_length: usize,
}

impl PgFrameCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }
}

impl Default for PgFrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for PgFrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 5 {
            return Ok(None);
        }

        let tag = src[0];
        let len = i32::from_be_bytes([src[1], src[2], src[3], src[4]]);
        if len < 4 {
            return Err(Error::Framing(format!(
                "invalid length {} for message '{}'",
                len,
                tag.escape_ascii()
            )));
        }
        let len = len as usize;
        if len > self.max_frame_length {
            return Err(Error::Framing(format!(
                "message '{}' of {} bytes exceeds the {} byte limit",
                tag.escape_ascii(),
                len,
                self.max_frame_length
            )));
        }

        let total = 1 + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(5);
        Ok(Some(Frame {
            tag,
            body: frame.freeze(),
        }))
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// One column of a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Parsed server-to-client message.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password {
        salt: [u8; 4],
    },
    AuthenticationSASL {
        mechanisms: Vec<String>,
    },
    AuthenticationSASLContinue {
        data: Bytes,
    },
    AuthenticationSASLFinal {
        data: Bytes,
    },

    // Query responses
    RowDescription {
        fields: Vec<FieldDescription>,
    },
    DataRow {
        values: Vec<Option<Bytes>>,
    },
    CommandComplete {
        tag: String,
    },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription {
        type_oids: Vec<Oid>,
    },

    // Status
    ReadyForQuery {
        status: TransactionStatus,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },

    // Errors and notices
    ErrorResponse {
        fields: HashMap<u8, String>,
    },
    NoticeResponse {
        fields: HashMap<u8, String>,
    },

    // Asynchronous
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

impl BackendMessage {
    /// Parse the body of a frame according to its tag.
    pub fn parse(frame: Frame) -> Result<Self> {
        let Frame { tag, body } = frame;
        let mut body = Reader::new(tag, body);

        let message = match tag {
            b'R' => Self::parse_auth(&mut body)?,
            b'T' => Self::parse_row_description(&mut body)?,
            b'D' => Self::parse_data_row(&mut body)?,
            b'C' => BackendMessage::CommandComplete {
                tag: body.cstring()?,
            },
            b'Z' => BackendMessage::ReadyForQuery {
                status: TransactionStatus::try_from(body.u8()?)?,
            },
            b'E' => BackendMessage::ErrorResponse {
                fields: body.error_fields()?,
            },
            b'N' => BackendMessage::NoticeResponse {
                fields: body.error_fields()?,
            },
            b'S' => BackendMessage::ParameterStatus {
                name: body.cstring()?,
                value: body.cstring()?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: body.i32()?,
                secret_key: body.i32()?,
            },
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'I' => BackendMessage::EmptyQueryResponse,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b't' => {
                let count = body.count()?;
                let mut type_oids = Vec::with_capacity(count);
                for _ in 0..count {
                    type_oids.push(Oid::from_i32(body.i32()?));
                }
                BackendMessage::ParameterDescription { type_oids }
            }
            b'A' => BackendMessage::NotificationResponse {
                process_id: body.i32()?,
                channel: body.cstring()?,
                payload: body.cstring()?,
            },
            _ => {
                return Err(Error::Protocol(format!(
                    "Unknown message type: {}",
                    tag.escape_ascii()
                )))
            }
        };
        Ok(message)
    }

    fn parse_auth(body: &mut Reader) -> Result<Self> {
        let auth_type = body.i32()?;

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&body.bytes(4)?);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.remaining() > 0 {
                    let mech = body.cstring()?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue { data: body.rest() }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal { data: body.rest() }),
            _ => Err(Error::Auth(format!(
                "Unsupported authentication method: {}",
                auth_type
            ))),
        }
    }

    fn parse_row_description(body: &mut Reader) -> Result<Self> {
        let count = body.count()?;
        let mut fields = Vec::with_capacity(count);

        for _ in 0..count {
            fields.push(FieldDescription {
                name: body.cstring()?,
                table_oid: body.i32()?,
                column_attr: body.i16()?,
                type_oid: Oid::from_i32(body.i32()?),
                type_size: body.i16()?,
                type_modifier: body.i32()?,
                format: Format::from_code(body.i16()?)?,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn parse_data_row(body: &mut Reader) -> Result<Self> {
        let count = body.count()?;
        let mut values = Vec::with_capacity(count);

        for _ in 0..count {
            let len = body.i32()?;
            if len < 0 {
                values.push(None);
            } else {
                values.push(Some(body.bytes(len as usize)?));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Bounds-checked cursor over a message body.
struct Reader {
    tag: u8,
    buf: Bytes,
}

impl Reader {
    fn new(tag: u8, buf: Bytes) -> Self {
        Self { tag, buf }
    }

    fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::Protocol(format!(
                "Truncated '{}' message: needed {} more bytes, {} left",
                self.tag.escape_ascii(),
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn i16(&mut self) -> Result<i16> {
        self.need(2)?;
        Ok(self.buf.get_i16())
    }

    fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    /// Element count prefix (Int16, never negative).
    fn count(&mut self) -> Result<usize> {
        let n = self.i16()?;
        usize::try_from(n)
            .map_err(|_| Error::Protocol(format!("Negative element count: {}", n)))
    }

    fn bytes(&mut self, n: usize) -> Result<Bytes> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    fn rest(&mut self) -> Bytes {
        self.buf.split_off(0)
    }

    fn cstring(&mut self) -> Result<String> {
        read_cstring(&mut self.buf)
    }

    /// Read error/notice response fields
    fn error_fields(&mut self) -> Result<HashMap<u8, String>> {
        let mut fields = HashMap::new();
        while self.remaining() > 0 {
            let field_type = self.u8()?;
            if field_type == 0 {
                break;
            }
            let value = self.cstring()?;
            fields.insert(field_type, value);
        }
        Ok(fields)
    }
}

/// NUL-terminated string; invalid UTF-8 is replaced rather than rejected.
fn read_cstring(buf: &mut Bytes) -> Result<String> {
    let Some(end) = buf.iter().position(|b| *b == 0) else {
        return Err(Error::Protocol(
            "Missing null terminator in string".to_string(),
        ));
    };

    let s = std::str::from_utf8(&buf[..end])
        .map(|s| s.to_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(&buf[..end]).into_owned());

    buf.advance(end + 1);
    Ok(s)
}
