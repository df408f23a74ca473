//! PostgreSQL connection pool.
//!
//! Plugs [`PgConnection`] into the generic [`Pool`] and adds shortcuts that
//! check a connection out for exactly one command.

use std::sync::Arc;

use async_trait::async_trait;

use super::connection::{ConnectOptions, PgConnection, TlsUpgrade};
use super::statement::QueryResult;
use super::types::PgValue;
use crate::error::Result;
use crate::pool::{ConnectionFactory, Pool, PoolOptions};

/// Opens handshaken PostgreSQL connections for a pool.
#[derive(Clone)]
pub struct PgConnector {
    options: ConnectOptions,
    tls: Option<Arc<dyn TlsUpgrade>>,
}

impl PgConnector {
    pub fn new(options: ConnectOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { options, tls: None })
    }

    /// Upgrade new connections through `tls`, per the options' `ssl_mode`.
    pub fn with_tls(mut self, tls: Arc<dyn TlsUpgrade>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }
}

#[async_trait]
impl ConnectionFactory for PgConnector {
    type Connection = PgConnection;

    async fn connect(&self) -> Result<PgConnection> {
        PgConnection::connect_with(self.options.clone(), self.tls.as_deref()).await
    }
}

/// A pool of PostgreSQL connections.
pub type PgPool = Pool<PgConnector>;

impl Pool<PgConnector> {
    /// Create a pool over TCP connections described by `options`.
    pub fn connect(options: ConnectOptions, pool_options: PoolOptions) -> Result<Self> {
        Pool::new(PgConnector::new(options)?, pool_options)
    }

    /// Run `sql` on a pooled connection, through its statement cache.
    pub async fn query(&self, sql: &str, params: &[PgValue]) -> Result<QueryResult> {
        let conn = self.acquire().await?;
        conn.query(sql, params).await
    }

    /// Run `sql` on a pooled connection with the simple query protocol.
    pub async fn simple_query(&self, sql: &str) -> Result<Vec<QueryResult>> {
        let conn = self.acquire().await?;
        conn.simple_query(sql).await
    }
}
