//! PostgreSQL connection.
//!
//! This module provides:
//! - `ConnectOptions`: connection configuration
//! - TLS upgrade sequencing (SSLRequest and hand-off to a `TlsUpgrade`)
//! - `PgConnection`: a handle over a pipelined connection, with the
//!   prepared statement cache, cursors and out-of-band cancellation

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::command::{PgCodec, PgCommand, PgResponse, Session};
use super::cursor::Cursor;
use super::protocol::{CancelRequest, FrontendMessage, SslRequest, DEFAULT_MAX_FRAME_LENGTH};
use super::statement::{PreparedStatement, QueryResult, StatementCache};
use super::types::{Oid, PgValue, TypeRegistry};
use crate::connection::{BoxedSocket, ConnectionState, Holder, StateCell};
use crate::error::{Error, Result};
use crate::pipeline::{Pipeline, PipelineStats, Scheduled, DEFAULT_PIPELINING_LIMIT};
use crate::pool::Poolable;

// ============================================================================
// Connection Configuration
// ============================================================================

/// Whether to negotiate TLS before the startup message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    /// Never send an SSLRequest
    #[default]
    Disable,
    /// Upgrade when the server agrees and an upgrader is available
    Prefer,
    /// Fail unless the connection is upgraded
    Require,
}

/// PostgreSQL connection configuration.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Hostname or IP address
    pub host: String,
    /// Port number (default: 5432)
    pub port: u16,
    /// Database name; the server defaults it to the user name
    pub database: Option<String>,
    pub user: String,
    pub password: Option<String>,
    pub application_name: Option<String>,
    /// Extra startup parameters (`search_path`, `TimeZone`, ...)
    pub params: BTreeMap<String, String>,
    pub ssl_mode: SslMode,
    /// Commands allowed in flight (default: 256)
    pub pipelining_limit: usize,
    /// Statement cache capacity (default: 100)
    pub statement_cache_capacity: usize,
    /// Largest accepted backend message
    pub max_frame_length: usize,
    #[serde(skip)]
    pub types: Arc<TypeRegistry>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: None,
            user: "postgres".to_string(),
            password: None,
            application_name: Some("sqlwire".to_string()),
            params: BTreeMap::new(),
            ssl_mode: SslMode::default(),
            pipelining_limit: DEFAULT_PIPELINING_LIMIT,
            statement_cache_capacity: 100,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            types: Arc::new(TypeRegistry::builtin()),
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("application_name", &self.application_name)
            .field("params", &self.params)
            .field("ssl_mode", &self.ssl_mode)
            .field("pipelining_limit", &self.pipelining_limit)
            .field("statement_cache_capacity", &self.statement_cache_capacity)
            .field("max_frame_length", &self.max_frame_length)
            .finish()
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Add a startup parameter.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    pub fn pipelining_limit(mut self, limit: usize) -> Self {
        self.pipelining_limit = limit;
        self
    }

    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }

    pub fn max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }

    /// Use a custom type registry.
    pub fn types(mut self, registry: TypeRegistry) -> Self {
        self.types = Arc::new(registry);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".to_string()));
        }
        if self.user.is_empty() {
            return Err(Error::Config("user must not be empty".to_string()));
        }
        if self.pipelining_limit == 0 {
            return Err(Error::Config("pipelining_limit must be > 0".to_string()));
        }
        if self.statement_cache_capacity == 0 {
            return Err(Error::Config(
                "statement_cache_capacity must be > 0".to_string(),
            ));
        }
        // Every frame carries at least its own 4-byte length
        if self.max_frame_length < 4 {
            return Err(Error::Config("max_frame_length must be >= 4".to_string()));
        }
        Ok(())
    }

    fn startup_parameters(&self) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = Vec::with_capacity(self.params.len() + 2);
        params.push(("client_encoding".to_string(), "UTF8".to_string()));
        if let Some(ref name) = self.application_name {
            params.push(("application_name".to_string(), name.clone()));
        }
        params.extend(
            self.params
                .iter()
                .filter(|(k, _)| k.as_str() != "client_encoding")
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        params
    }
}

// ============================================================================
// TLS
// ============================================================================

/// Performs the TLS handshake once the server has agreed to upgrade.
#[async_trait]
pub trait TlsUpgrade: Send + Sync + 'static {
    async fn upgrade(&self, socket: BoxedSocket, host: &str) -> Result<BoxedSocket>;
}

async fn negotiate_tls(
    mut socket: BoxedSocket,
    options: &ConnectOptions,
    tls: Option<&dyn TlsUpgrade>,
) -> Result<BoxedSocket> {
    let tls = match (options.ssl_mode, tls) {
        (SslMode::Disable, _) | (SslMode::Prefer, None) => return Ok(socket),
        (SslMode::Require, None) => {
            return Err(Error::Config(
                "ssl_mode=require needs a TLS upgrader".to_string(),
            ))
        }
        (_, Some(tls)) => tls,
    };

    let mut buf = BytesMut::with_capacity(8);
    SslRequest.encode(&mut buf);
    socket.write_all(&buf).await?;
    socket.flush().await?;

    match socket.read_u8().await? {
        b'S' => {
            debug!(host = %options.host, "server accepted TLS");
            tls.upgrade(socket, &options.host).await
        }
        b'N' if options.ssl_mode == SslMode::Require => Err(Error::Protocol(
            "server does not support TLS".to_string(),
        )),
        b'N' => {
            debug!(host = %options.host, "server declined TLS, continuing in plain text");
            Ok(socket)
        }
        other => Err(Error::Protocol(format!(
            "Unexpected SSLRequest answer: {:?}",
            other as char
        ))),
    }
}

// ============================================================================
// Connection
// ============================================================================

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A PostgreSQL connection.
///
/// All methods take `&self`; commands issued concurrently are pipelined
/// and answered in the order they were issued. Methods returning
/// `impl Future` queue their command when called, not when first polled.
pub struct PgConnection {
    id: u64,
    pipeline: Pipeline<PgCodec>,
    options: ConnectOptions,
    session: Session,
    cache: Mutex<StatementCache>,
}

impl PgConnection {
    /// Connect over TCP without TLS.
    pub async fn connect(options: ConnectOptions) -> Result<Self> {
        Self::connect_with(options, None).await
    }

    /// Connect over TCP, upgrading through `tls` according to `ssl_mode`.
    pub async fn connect_with(
        options: ConnectOptions,
        tls: Option<&dyn TlsUpgrade>,
    ) -> Result<Self> {
        options.validate()?;
        let stream = TcpStream::connect((options.host.as_str(), options.port)).await?;
        // Disable Nagle's algorithm for lower latency
        stream.set_nodelay(true)?;
        Self::handshake(Box::new(stream), options, tls).await
    }

    /// Run the handshake over an already connected socket.
    pub async fn connect_socket(
        socket: BoxedSocket,
        options: ConnectOptions,
        tls: Option<&dyn TlsUpgrade>,
    ) -> Result<Self> {
        options.validate()?;
        Self::handshake(socket, options, tls).await
    }

    /// TLS negotiation and startup; `options` are already validated.
    async fn handshake(
        socket: BoxedSocket,
        options: ConnectOptions,
        tls: Option<&dyn TlsUpgrade>,
    ) -> Result<Self> {
        let state = StateCell::new(ConnectionState::Connecting);
        let socket = negotiate_tls(socket, &options, tls).await?;

        state.set(ConnectionState::Authenticating);
        let codec = PgCodec::new(Arc::clone(&options.types), options.max_frame_length);
        let pipeline = Pipeline::spawn(socket, codec, options.pipelining_limit, state);

        let startup = PgCommand::Startup {
            user: options.user.clone(),
            database: options.database.clone(),
            password: options.password.clone(),
            parameters: options.startup_parameters(),
        };
        let session = match pipeline.schedule_handshake(startup).await {
            Ok(PgResponse::Ready(session)) => session,
            Ok(other) => {
                pipeline.close().await;
                return Err(unexpected_response(&other));
            }
            Err(e) => {
                pipeline.close().await;
                return Err(e);
            }
        };

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        info!(
            id,
            host = %options.host,
            process_id = session.process_id,
            "connection ready"
        );

        Ok(Self {
            id,
            pipeline,
            cache: Mutex::new(StatementCache::new(options.statement_cache_capacity)),
            options,
            session,
        })
    }

    /// Run one or more statements through the simple query protocol.
    ///
    /// Returns one result per statement, in order.
    pub fn simple_query(
        &self,
        sql: &str,
    ) -> impl Future<Output = Result<Vec<QueryResult>>> + Send + 'static {
        let scheduled = self
            .pipeline
            .schedule(PgCommand::SimpleQuery(sql.to_string()));
        async move {
            match scheduled.await? {
                PgResponse::Results(results) => Ok(results),
                other => Err(unexpected_response(&other)),
            }
        }
    }

    /// Prepare a statement, letting the server infer parameter types.
    ///
    /// The statement is not cached; close it with [`close_statement`].
    ///
    /// [`close_statement`]: PgConnection::close_statement
    pub fn prepare(
        &self,
        sql: &str,
    ) -> impl Future<Output = Result<Arc<PreparedStatement>>> + Send + 'static {
        self.prepare_typed(sql, &[])
    }

    /// Prepare a statement with explicit parameter types.
    ///
    /// `Oid::UNSPECIFIED` entries are left for the server to infer.
    pub fn prepare_typed(
        &self,
        sql: &str,
        param_types: &[Oid],
    ) -> impl Future<Output = Result<Arc<PreparedStatement>>> + Send + 'static {
        let name = self.cache.lock().next_statement_name();
        let scheduled = self.pipeline.schedule(PgCommand::Prepare {
            name: name.clone(),
            query: sql.to_string(),
            param_types: param_types.to_vec(),
        });
        let query = sql.to_string();
        let connection_id = self.id;
        async move {
            match scheduled.await? {
                PgResponse::Prepared(desc) => Ok(Arc::new(PreparedStatement::new(
                    name,
                    query,
                    desc.param_types,
                    desc.columns,
                    connection_id,
                ))),
                other => Err(unexpected_response(&other)),
            }
        }
    }

    /// Execute a prepared statement and collect every row.
    pub fn execute(
        &self,
        statement: &Arc<PreparedStatement>,
        params: &[PgValue],
    ) -> impl Future<Output = Result<QueryResult>> + Send + 'static {
        let scheduled = match self.check_owned(statement) {
            Ok(()) => self.pipeline.schedule(PgCommand::Execute {
                statement: Arc::clone(statement),
                params: params.to_vec(),
                portal: String::new(),
                max_rows: 0,
                bind: true,
            }),
            Err(e) => Scheduled::failed(e),
        };
        async move {
            match scheduled.await? {
                PgResponse::Executed(outcome) => Ok(outcome.result),
                other => Err(unexpected_response(&other)),
            }
        }
    }

    /// Execute a prepared statement once per argument list.
    ///
    /// Every list is bound and executed under a single Sync, so one
    /// failing entry fails the whole batch and the server rolls back what
    /// the batch did outside an explicit transaction.
    pub fn execute_batch(
        &self,
        statement: &Arc<PreparedStatement>,
        params: Vec<Vec<PgValue>>,
    ) -> impl Future<Output = Result<Vec<QueryResult>>> + Send + 'static {
        let scheduled = match self.check_owned(statement) {
            Ok(()) => self.pipeline.schedule(PgCommand::ExecuteBatch {
                statement: Arc::clone(statement),
                params,
            }),
            Err(e) => Scheduled::failed(e),
        };
        async move {
            match scheduled.await? {
                PgResponse::Results(results) => Ok(results),
                other => Err(unexpected_response(&other)),
            }
        }
    }

    /// Prepare (or reuse from the statement cache) and execute `sql`.
    ///
    /// A cached statement that was closed before its execute went out is
    /// prepared again once.
    pub async fn query(&self, sql: &str, params: &[PgValue]) -> Result<QueryResult> {
        let cached = self.cache.lock().get_and_touch(sql);
        if let Some(statement) = cached {
            match self.execute(&statement, params).await {
                Err(Error::Misuse(_)) if statement.is_closed() => {
                    debug!(statement = %statement.name, "cached statement closed, preparing again");
                }
                result => return result,
            }
        }
        let prepared = self.prepare(sql).await?;
        let statement = self.cache_statement(sql, prepared);
        self.execute(&statement, params).await
    }

    #[cfg(test)]
    pub(crate) fn cached_statement(&self, sql: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.lock().get_and_touch(sql)
    }

    /// Insert a freshly prepared statement, closing whatever it displaces.
    ///
    /// Returns the statement to use: a concurrent `query` may have cached
    /// one for the same SQL first, in which case ours is discarded.
    fn cache_statement(&self, sql: &str, prepared: Arc<PreparedStatement>) -> Arc<PreparedStatement> {
        let mut cache = self.cache.lock();
        if let Some(existing) = cache.get_and_touch(sql).filter(|s| !s.is_closed()) {
            drop(cache);
            self.discard_statement(&prepared);
            return existing;
        }
        let evicted = cache.insert(sql.to_string(), Arc::clone(&prepared));
        drop(cache);
        if let Some(evicted) = evicted {
            debug!(statement = %evicted.name, "statement evicted from cache");
            self.discard_statement(&evicted);
        }
        prepared
    }

    /// Close a statement on the server without waiting for the reply.
    fn discard_statement(&self, statement: &PreparedStatement) {
        if statement.mark_closed() {
            drop(
                self.pipeline
                    .schedule(PgCommand::CloseStatement(statement.name.clone())),
            );
        }
    }

    /// Close a prepared statement on the server.
    ///
    /// Closing twice, or closing a statement of another connection, fails
    /// without touching the wire.
    pub fn close_statement(
        &self,
        statement: &Arc<PreparedStatement>,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let scheduled = match self.check_owned(statement) {
            Ok(()) if statement.mark_closed() => {
                self.cache.lock().remove(statement);
                self.pipeline
                    .schedule(PgCommand::CloseStatement(statement.name.clone()))
            }
            Ok(()) => Scheduled::failed(Error::Misuse(format!(
                "statement {} is already closed",
                statement.name
            ))),
            Err(e) => Scheduled::failed(e),
        };
        async move {
            match scheduled.await? {
                PgResponse::Closed => Ok(()),
                other => Err(unexpected_response(&other)),
            }
        }
    }

    /// Open a cursor over `statement` bound to `params`.
    ///
    /// Portals only outlive a round trip inside a transaction block, so
    /// run cursors between `BEGIN` and `COMMIT`.
    pub fn cursor(&self, statement: &Arc<PreparedStatement>, params: Vec<PgValue>) -> Result<Cursor> {
        self.check_owned(statement)?;
        Ok(Cursor::new(
            self.pipeline.clone(),
            Arc::clone(statement),
            params,
        ))
    }

    /// Ask the server to cancel whatever this connection is running.
    ///
    /// Sent on a separate, short-lived socket; the running command still
    /// completes through its own connection, usually with error 57014.
    pub async fn cancel_request(&self) -> Result<()> {
        let mut stream = TcpStream::connect((self.options.host.as_str(), self.options.port)).await?;
        let mut buf = BytesMut::with_capacity(16);
        CancelRequest {
            process_id: self.session.process_id,
            secret_key: self.session.secret_key,
        }
        .encode(&mut buf);
        stream.write_all(&buf).await?;
        stream.shutdown().await?;
        debug!(process_id = self.session.process_id, "cancel request sent");
        Ok(())
    }

    /// Close the connection once queued commands have been sent.
    pub async fn close(&self) {
        self.pipeline.close().await;
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.pipeline.state()
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.pipeline.is_open()
    }

    pub async fn stats(&self) -> PipelineStats {
        self.pipeline.stats().await
    }

    /// Backend process id, as reported during startup.
    pub fn process_id(&self) -> i32 {
        self.session.process_id
    }

    /// Server parameter reported during startup.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.session.parameters.get(name).map(String::as_str)
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Number of statements currently in the statement cache.
    pub fn cached_statements(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn set_holder(&self, holder: Option<Arc<dyn Holder>>) {
        self.pipeline.set_holder(holder);
    }

    fn check_owned(&self, statement: &PreparedStatement) -> Result<()> {
        if statement.connection_id != self.id {
            return Err(Error::Misuse(format!(
                "statement {} belongs to another connection",
                statement.name
            )));
        }
        if statement.is_closed() {
            return Err(Error::Misuse(format!(
                "statement {} is closed",
                statement.name
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("process_id", &self.session.process_id)
            .finish()
    }
}

#[async_trait]
impl Poolable for PgConnection {
    fn set_holder(&self, holder: Option<Arc<dyn Holder>>) {
        PgConnection::set_holder(self, holder);
    }

    fn is_open(&self) -> bool {
        PgConnection::is_open(self)
    }

    async fn close(&self) {
        PgConnection::close(self).await;
    }
}

pub(crate) fn unexpected_response(response: &PgResponse) -> Error {
    let kind = match response {
        PgResponse::Ready(_) => "Ready",
        PgResponse::Results(_) => "Results",
        PgResponse::Prepared(_) => "Prepared",
        PgResponse::Executed(_) => "Executed",
        PgResponse::Closed => "Closed",
    };
    Error::Protocol(format!("Unexpected response: {}", kind))
}
