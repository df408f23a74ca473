//! PostgreSQL commands and their response exchanges.
//!
//! Every command ends with Sync (startup aside), so each one is answered by
//! exactly one ReadyForQuery. The exchange records the first error it sees
//! and completes at that ReadyForQuery, which keeps the stream aligned with
//! the pipeline's FIFO of in-flight commands even after a failure.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;

use super::protocol::{
    BackendMessage, BindMessage, CloseMessage, DescribeMessage, ExecuteMessage, Format, Frame,
    FrontendMessage, ParseMessage, PasswordMessage, PgFrameCodec, QueryMessage,
    SaslInitialResponseMessage, SaslResponseMessage, StartupMessage, SyncMessage, Target,
    TerminateMessage,
};
use super::scram::{self, ScramClient};
use super::statement::{PreparedStatement, QueryResult, Row, RowDescriptor};
use super::types::{Oid, PgValue, TypeRegistry};
use crate::codec::{CommandExchange, Inbound, ProtocolCodec, Step};
use crate::connection::ConnectionEvent;
use crate::error::{Error, Result, ServerError};

// ============================================================================
// Commands
// ============================================================================

/// Unit of work scheduled on a PostgreSQL connection.
#[derive(Debug)]
pub enum PgCommand {
    /// Startup and authentication; answered by `PgResponse::Ready`.
    Startup {
        user: String,
        database: Option<String>,
        password: Option<String>,
        parameters: Vec<(String, String)>,
    },
    /// Simple query protocol; may hold several statements.
    SimpleQuery(String),
    /// Parse + Describe of a named statement.
    Prepare {
        name: String,
        query: String,
        param_types: Vec<Oid>,
    },
    /// Bind (when `bind`) and Execute of a portal over a prepared statement.
    ///
    /// With `bind == false` the portal must already exist and suspended.
    Execute {
        statement: Arc<PreparedStatement>,
        params: Vec<PgValue>,
        portal: String,
        max_rows: i32,
        bind: bool,
    },
    /// The statement executed once per argument list under a single Sync;
    /// answered by one result per list.
    ExecuteBatch {
        statement: Arc<PreparedStatement>,
        params: Vec<Vec<PgValue>>,
    },
    CloseStatement(String),
    ClosePortal(String),
}

/// Session identity gathered during startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub process_id: i32,
    pub secret_key: i32,
    pub parameters: HashMap<String, String>,
}

/// Server-side shape of a freshly parsed statement.
#[derive(Debug, Clone)]
pub struct StatementDescription {
    pub param_types: Vec<Oid>,
    pub columns: Arc<RowDescriptor>,
}

#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub result: QueryResult,
    /// The row limit was hit and the portal may hold more rows
    pub suspended: bool,
}

#[derive(Debug, Clone)]
pub enum PgResponse {
    Ready(Session),
    Results(Vec<QueryResult>),
    Prepared(StatementDescription),
    Executed(ExecuteOutcome),
    Closed,
}

// ============================================================================
// Codec
// ============================================================================

/// PostgreSQL v3 backend of the command pipeline.
#[derive(Debug, Clone)]
pub struct PgCodec {
    registry: Arc<TypeRegistry>,
    max_frame_length: usize,
    handshaking: bool,
}

impl PgCodec {
    pub fn new(registry: Arc<TypeRegistry>, max_frame_length: usize) -> Self {
        Self {
            registry,
            max_frame_length,
            handshaking: false,
        }
    }

    fn check_open(statement: &PreparedStatement) -> Result<()> {
        if statement.is_closed() {
            return Err(Error::Misuse(format!(
                "statement {} is closed",
                statement.name
            )));
        }
        Ok(())
    }

    fn encode_bind(
        &self,
        statement: &PreparedStatement,
        params: &[PgValue],
        portal: &str,
        buf: &mut BytesMut,
    ) -> Result<()> {
        if params.len() != statement.param_types.len() {
            return Err(Error::Type(format!(
                "statement expects {} parameters, got {}",
                statement.param_types.len(),
                params.len()
            )));
        }

        let mut param_formats = Vec::with_capacity(params.len());
        let mut values: Vec<Option<Bytes>> = Vec::with_capacity(params.len());
        for (i, (value, oid)) in params.iter().zip(&statement.param_types).enumerate() {
            let (format, data) = self
                .registry
                .encode_param(value, *oid)
                .map_err(|e| Error::Type(format!("parameter ${}: {}", i + 1, e)))?;
            param_formats.push(format);
            values.push(data);
        }

        BindMessage {
            portal: portal.to_string(),
            statement: statement.name.clone(),
            param_formats,
            params: values,
            result_formats: statement.columns.columns().iter().map(|c| c.format).collect(),
        }
        .encode(buf)
    }

    fn encode_execute(
        &self,
        statement: &PreparedStatement,
        params: &[PgValue],
        portal: &str,
        max_rows: i32,
        bind: bool,
        buf: &mut BytesMut,
    ) -> Result<()> {
        Self::check_open(statement)?;
        if bind {
            self.encode_bind(statement, params, portal, buf)?;
        }
        ExecuteMessage {
            portal: portal.to_string(),
            max_rows,
        }
        .encode(buf);
        SyncMessage.encode(buf);
        Ok(())
    }

    /// One Bind/Execute pair per argument list, then a single Sync.
    fn encode_batch(
        &self,
        statement: &PreparedStatement,
        batch: &[Vec<PgValue>],
        buf: &mut BytesMut,
    ) -> Result<()> {
        Self::check_open(statement)?;
        if batch.is_empty() {
            return Err(Error::Misuse("empty batch".to_string()));
        }
        for (i, params) in batch.iter().enumerate() {
            self.encode_bind(statement, params, "", buf)
                .map_err(|e| match e {
                    Error::Type(msg) => Error::Type(format!("batch entry {}: {}", i, msg)),
                    other => other,
                })?;
            ExecuteMessage {
                portal: String::new(),
                max_rows: 0,
            }
            .encode(buf);
        }
        SyncMessage.encode(buf);
        Ok(())
    }
}

impl ProtocolCodec for PgCodec {
    type Command = PgCommand;
    type Output = PgResponse;
    type Message = Frame;
    type Framer = PgFrameCodec;
    type Exchange = PgExchange;

    fn framer(&self) -> PgFrameCodec {
        PgFrameCodec::new(self.max_frame_length)
    }

    fn encode(&mut self, command: PgCommand, buf: &mut BytesMut) -> Result<PgExchange> {
        let kind = match command {
            PgCommand::Startup {
                user,
                database,
                password,
                parameters,
            } => {
                StartupMessage {
                    user: user.clone(),
                    database,
                    options: parameters,
                }
                .encode(buf);
                self.handshaking = true;
                ExchangeKind::Startup(Box::new(StartupState {
                    user,
                    password,
                    scram: None,
                    session: Session::default(),
                }))
            }
            PgCommand::SimpleQuery(query) => {
                QueryMessage { query }.encode(buf);
                ExchangeKind::Simple(SimpleState {
                    registry: Arc::clone(&self.registry),
                    results: Vec::new(),
                    current: None,
                })
            }
            PgCommand::Prepare {
                name,
                query,
                param_types,
            } => {
                ParseMessage {
                    name: name.clone(),
                    query,
                    param_types,
                }
                .encode(buf)?;
                DescribeMessage {
                    target: Target::Statement,
                    name,
                }
                .encode(buf);
                SyncMessage.encode(buf);
                ExchangeKind::Prepare(PrepareState {
                    registry: Arc::clone(&self.registry),
                    param_types: Vec::new(),
                    columns: Vec::new(),
                })
            }
            PgCommand::Execute {
                statement,
                params,
                portal,
                max_rows,
                bind,
            } => {
                self.encode_execute(&statement, &params, &portal, max_rows, bind, buf)?;
                ExchangeKind::Execute(ExecuteState {
                    registry: Arc::clone(&self.registry),
                    columns: Arc::clone(&statement.columns),
                    rows: Vec::new(),
                    tag: String::new(),
                    suspended: false,
                })
            }
            PgCommand::ExecuteBatch { statement, params } => {
                self.encode_batch(&statement, &params, buf)?;
                ExchangeKind::Batch(BatchState {
                    registry: Arc::clone(&self.registry),
                    columns: Arc::clone(&statement.columns),
                    results: Vec::new(),
                    rows: Vec::new(),
                })
            }
            PgCommand::CloseStatement(name) => {
                CloseMessage {
                    target: Target::Statement,
                    name,
                }
                .encode(buf);
                SyncMessage.encode(buf);
                ExchangeKind::Close
            }
            PgCommand::ClosePortal(name) => {
                CloseMessage {
                    target: Target::Portal,
                    name,
                }
                .encode(buf);
                SyncMessage.encode(buf);
                ExchangeKind::Close
            }
        };
        Ok(PgExchange { kind, error: None })
    }

    fn classify(&mut self, frame: Frame) -> Result<Inbound<Frame>> {
        let event = match frame.tag {
            b'A' | b'N' => BackendMessage::parse(frame)?,
            // During startup ParameterStatus is part of the handshake reply
            b'S' if !self.handshaking => BackendMessage::parse(frame)?,
            b'Z' if self.handshaking => {
                self.handshaking = false;
                return Ok(Inbound::Response(frame));
            }
            _ => return Ok(Inbound::Response(frame)),
        };

        Ok(Inbound::Event(match event {
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => ConnectionEvent::Notification {
                process_id,
                channel,
                payload,
            },
            BackendMessage::NoticeResponse { fields } => {
                ConnectionEvent::Notice(Box::new(ServerError::from_fields(&fields)))
            }
            BackendMessage::ParameterStatus { name, value } => {
                ConnectionEvent::ParameterStatus { name, value }
            }
            other => return Err(unexpected(&other)),
        }))
    }

    fn encode_close(&mut self, buf: &mut BytesMut) {
        TerminateMessage.encode(buf);
    }
}

// ============================================================================
// Exchanges
// ============================================================================

/// Response state machine of one [`PgCommand`].
pub struct PgExchange {
    kind: ExchangeKind,
    /// First error seen; reported once ReadyForQuery arrives
    error: Option<Error>,
}

enum ExchangeKind {
    Startup(Box<StartupState>),
    Simple(SimpleState),
    Prepare(PrepareState),
    Execute(ExecuteState),
    Batch(BatchState),
    Close,
}

impl CommandExchange for PgExchange {
    type Message = Frame;
    type Output = PgResponse;

    fn on_message(&mut self, frame: Frame, out: &mut BytesMut) -> Step<PgResponse> {
        if let ExchangeKind::Startup(startup) = &mut self.kind {
            return match startup.on_message(frame, out) {
                Ok(Some(session)) => Step::Done(Ok(PgResponse::Ready(session))),
                Ok(None) => Step::Continue,
                Err(e) => Step::Done(Err(e)),
            };
        }

        if frame.tag == b'Z' {
            return Step::Done(match self.error.take() {
                Some(e) => Err(e),
                None => Ok(self.kind.finish()),
            });
        }

        let handled = BackendMessage::parse(frame).and_then(|message| match message {
            BackendMessage::ErrorResponse { fields } => {
                Err(ServerError::from_fields(&fields).into())
            }
            message => self.kind.on_message(message),
        });
        if let Err(e) = handled {
            self.error.get_or_insert(e);
        }
        Step::Continue
    }
}

impl ExchangeKind {
    fn on_message(&mut self, message: BackendMessage) -> Result<()> {
        match self {
            ExchangeKind::Simple(state) => state.on_message(message),
            ExchangeKind::Prepare(state) => state.on_message(message),
            ExchangeKind::Execute(state) => state.on_message(message),
            ExchangeKind::Batch(state) => state.on_message(message),
            ExchangeKind::Close => match message {
                BackendMessage::CloseComplete => Ok(()),
                other => Err(unexpected(&other)),
            },
            ExchangeKind::Startup(_) => Err(unexpected(&message)),
        }
    }

    fn finish(&mut self) -> PgResponse {
        match self {
            ExchangeKind::Simple(state) => PgResponse::Results(std::mem::take(&mut state.results)),
            ExchangeKind::Prepare(state) => PgResponse::Prepared(StatementDescription {
                param_types: std::mem::take(&mut state.param_types),
                columns: Arc::new(RowDescriptor::new(std::mem::take(&mut state.columns))),
            }),
            ExchangeKind::Execute(state) => PgResponse::Executed(ExecuteOutcome {
                result: QueryResult {
                    columns: (!state.columns.is_empty()).then(|| Arc::clone(&state.columns)),
                    rows: std::mem::take(&mut state.rows),
                    command_tag: std::mem::take(&mut state.tag),
                },
                suspended: state.suspended,
            }),
            ExchangeKind::Batch(state) => PgResponse::Results(std::mem::take(&mut state.results)),
            ExchangeKind::Close | ExchangeKind::Startup(_) => PgResponse::Closed,
        }
    }
}

struct StartupState {
    user: String,
    password: Option<String>,
    scram: Option<ScramClient>,
    session: Session,
}

impl StartupState {
    fn password(&self) -> Result<&str> {
        self.password
            .as_deref()
            .ok_or_else(|| Error::Auth("server requested a password but none was configured".to_string()))
    }

    /// `Some` once the server reports ReadyForQuery.
    fn on_message(&mut self, frame: Frame, out: &mut BytesMut) -> Result<Option<Session>> {
        match BackendMessage::parse(frame)? {
            BackendMessage::AuthenticationOk => {
                tracing::debug!(user = %self.user, "authenticated");
            }
            BackendMessage::AuthenticationCleartextPassword => {
                tracing::debug!("authentication method: cleartext");
                PasswordMessage {
                    password: self.password()?.to_string(),
                }
                .encode(out);
            }
            BackendMessage::AuthenticationMD5Password { salt } => {
                tracing::debug!("authentication method: md5");
                PasswordMessage {
                    password: md5_password(&self.user, self.password()?, &salt),
                }
                .encode(out);
            }
            BackendMessage::AuthenticationSASL { mechanisms } => {
                if !mechanisms.iter().any(|m| m == scram::MECHANISM) {
                    return Err(Error::Auth(format!(
                        "no supported SASL mechanism in {:?}",
                        mechanisms
                    )));
                }
                tracing::debug!("authentication method: {}", scram::MECHANISM);
                let client = ScramClient::new(&self.user, self.password()?);
                SaslInitialResponseMessage {
                    mechanism: scram::MECHANISM.to_string(),
                    data: client.client_first_message(),
                }
                .encode(out);
                self.scram = Some(client);
            }
            BackendMessage::AuthenticationSASLContinue { data } => {
                let client = self.scram.as_mut().ok_or_else(|| {
                    Error::Protocol("SASLContinue before SASL start".to_string())
                })?;
                SaslResponseMessage {
                    data: client.process_server_first(&data)?,
                }
                .encode(out);
            }
            BackendMessage::AuthenticationSASLFinal { data } => {
                let client = self.scram.as_ref().ok_or_else(|| {
                    Error::Protocol("SASLFinal before SASL start".to_string())
                })?;
                client.verify_server_final(&data)?;
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.session.parameters.insert(name, value);
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                self.session.process_id = process_id;
                self.session.secret_key = secret_key;
            }
            BackendMessage::ReadyForQuery { .. } => {
                return Ok(Some(std::mem::take(&mut self.session)));
            }
            BackendMessage::ErrorResponse { fields } => {
                return Err(ServerError::from_fields(&fields).into());
            }
            other => return Err(unexpected(&other)),
        }
        Ok(None)
    }
}

struct SimpleState {
    registry: Arc<TypeRegistry>,
    results: Vec<QueryResult>,
    current: Option<(Arc<RowDescriptor>, Vec<Row>)>,
}

impl SimpleState {
    fn on_message(&mut self, message: BackendMessage) -> Result<()> {
        match message {
            BackendMessage::RowDescription { fields } => {
                self.current = Some((Arc::new(RowDescriptor::new(fields)), Vec::new()));
            }
            BackendMessage::DataRow { values } => {
                let (desc, rows) = self.current.as_mut().ok_or_else(|| {
                    Error::Protocol("DataRow without RowDescription".to_string())
                })?;
                rows.push(decode_row(&self.registry, desc, values)?);
            }
            BackendMessage::CommandComplete { tag } => {
                let (columns, rows) = match self.current.take() {
                    Some((desc, rows)) => (Some(desc), rows),
                    None => (None, Vec::new()),
                };
                self.results.push(QueryResult {
                    columns,
                    rows,
                    command_tag: tag,
                });
            }
            BackendMessage::EmptyQueryResponse => self.results.push(QueryResult::default()),
            other => return Err(unexpected(&other)),
        }
        Ok(())
    }
}

struct PrepareState {
    registry: Arc<TypeRegistry>,
    param_types: Vec<Oid>,
    columns: Vec<super::protocol::FieldDescription>,
}

impl PrepareState {
    fn on_message(&mut self, message: BackendMessage) -> Result<()> {
        match message {
            BackendMessage::ParseComplete | BackendMessage::NoData => {}
            BackendMessage::ParameterDescription { type_oids } => self.param_types = type_oids,
            BackendMessage::RowDescription { fields } => {
                // Binary results for every type with a codec, text otherwise
                self.columns = fields
                    .into_iter()
                    .map(|mut field| {
                        field.format = if self.registry.kind(field.type_oid).is_some() {
                            Format::Binary
                        } else {
                            Format::Text
                        };
                        field
                    })
                    .collect();
            }
            other => return Err(unexpected(&other)),
        }
        Ok(())
    }
}

struct ExecuteState {
    registry: Arc<TypeRegistry>,
    columns: Arc<RowDescriptor>,
    rows: Vec<Row>,
    tag: String,
    suspended: bool,
}

impl ExecuteState {
    fn on_message(&mut self, message: BackendMessage) -> Result<()> {
        match message {
            BackendMessage::BindComplete => {}
            BackendMessage::DataRow { values } => {
                self.rows
                    .push(decode_row(&self.registry, &self.columns, values)?);
            }
            BackendMessage::CommandComplete { tag } => self.tag = tag,
            BackendMessage::PortalSuspended => self.suspended = true,
            BackendMessage::EmptyQueryResponse => {}
            other => return Err(unexpected(&other)),
        }
        Ok(())
    }
}

struct BatchState {
    registry: Arc<TypeRegistry>,
    columns: Arc<RowDescriptor>,
    results: Vec<QueryResult>,
    rows: Vec<Row>,
}

impl BatchState {
    fn on_message(&mut self, message: BackendMessage) -> Result<()> {
        match message {
            BackendMessage::BindComplete => {}
            BackendMessage::DataRow { values } => {
                self.rows
                    .push(decode_row(&self.registry, &self.columns, values)?);
            }
            BackendMessage::CommandComplete { tag } => self.results.push(QueryResult {
                columns: (!self.columns.is_empty()).then(|| Arc::clone(&self.columns)),
                rows: std::mem::take(&mut self.rows),
                command_tag: tag,
            }),
            BackendMessage::EmptyQueryResponse => self.results.push(QueryResult::default()),
            other => return Err(unexpected(&other)),
        }
        Ok(())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn decode_row(
    registry: &TypeRegistry,
    desc: &Arc<RowDescriptor>,
    values: Vec<Option<Bytes>>,
) -> Result<Row> {
    if values.len() != desc.len() {
        return Err(Error::Protocol(format!(
            "DataRow has {} values for {} columns",
            values.len(),
            desc.len()
        )));
    }
    let decoded = desc
        .columns()
        .iter()
        .zip(&values)
        .map(|(col, value)| registry.decode(col.type_oid, col.format, value.as_deref()))
        .collect::<Result<SmallVec<_>>>()?;
    Ok(Row::new(Arc::clone(desc), decoded))
}

fn unexpected(message: &BackendMessage) -> Error {
    let mut text = format!("{:?}", message);
    if text.len() > 120 {
        let cut = (0..=120).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
        text.truncate(cut);
        text.push_str("...");
    }
    Error::Protocol(format!("Unexpected message: {}", text))
}

/// Compute MD5 password hash for PostgreSQL authentication.
///
/// Format: `"md5" + hex(md5(hex(md5(password + user)) + salt))`
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{}{}", password, user)));
    let mut salted = inner.into_bytes();
    salted.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&salted))
}
