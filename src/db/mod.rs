//! Database access for sessions.
//!
//! A session talks to at most one live connection at a time, owned by its
//! [`ConnectionManager`]. Backends (MySQL, PostgreSQL) sit behind the
//! [`SqlConnection`] / [`Connector`] traits so the manager, the SQL
//! dispatcher and the loop engine never name a driver type.

pub mod dispatch;
pub mod format;
pub mod manager;
pub mod mysql;
pub mod postgres;
pub mod spinner;

#[cfg(test)]
pub mod fake;

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use crate::config::DatabaseConfig;
use crate::error::{GateError, GateResult};

pub use manager::{ConnectionManager, ManagerSettings};

/// The relational backends a session can connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    MySql,
    Postgres,
}

impl BackendKind {
    pub fn parse(name: &str) -> GateResult<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::MySql),
            "postgresql" | "postgres" | "pg" => Ok(Self::Postgres),
            _ => Err(GateError::UnsupportedBackend(name.to_string())),
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::MySql => 3306,
            Self::Postgres => 5432,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgresql",
        })
    }
}

/// A CONNECT directive as handed over by the collaborator.
///
/// Every field is optional here; missing ones are filled from the startup
/// defaults before [`ConnectRequest::into_config`] checks what is required.
/// Keys other than the named fields land in `options` (e.g. `charset`,
/// `sslmode`).
#[derive(Clone, Default, Deserialize)]
pub struct ConnectRequest {
    #[serde(alias = "backend", alias = "type")]
    pub backend_type: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    #[serde(flatten)]
    pub options: BTreeMap<String, String>,
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("backend_type", &self.backend_type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("options", &self.options)
            .finish()
    }
}

impl ConnectRequest {
    /// Fills fields the request left out from the startup defaults.
    pub fn with_defaults(mut self, defaults: &DatabaseConfig) -> Self {
        self.backend_type = self.backend_type.or_else(|| defaults.backend_type.clone());
        self.host = self.host.or_else(|| defaults.host.clone());
        self.port = self.port.or(defaults.port);
        self.user = self.user.or_else(|| defaults.user.clone());
        self.password = self.password.or_else(|| defaults.password.clone());
        self.database = self.database.or_else(|| defaults.database.clone());
        self
    }

    /// Checks the required fields and resolves the backend.
    pub fn into_config(self) -> GateResult<ConnectionConfig> {
        fn required(value: Option<String>, name: &'static str) -> GateResult<String> {
            value
                .filter(|v| !v.trim().is_empty())
                .ok_or(GateError::MissingConnectionParameter(name))
        }

        let backend_type = required(self.backend_type, "backend_type")?;
        let host = required(self.host, "host")?;
        let user = required(self.user, "user")?;
        let password = self
            .password
            .ok_or(GateError::MissingConnectionParameter("password"))?;
        let backend = BackendKind::parse(&backend_type)?;

        Ok(ConnectionConfig {
            backend,
            host,
            port: self.port,
            user,
            password,
            database: self.database.filter(|d| !d.trim().is_empty()),
            options: self.options,
        })
    }
}

/// A complete, validated set of connection parameters.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub backend: BackendKind,
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    pub password: String,
    pub database: Option<String>,
    pub options: BTreeMap<String, String>,
}

impl ConnectionConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.backend.default_port())
    }

    /// Overwrites the password before the config is dropped.
    pub fn clear_credentials(&mut self) {
        self.password.clear();
        self.password.shrink_to_fit();
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("backend", &self.backend)
            .field("host", &self.host)
            .field("port", &self.port())
            .field("user", &self.user)
            .field("password", &"***")
            .field("database", &self.database)
            .field("options", &self.options)
            .finish()
    }
}

/// Rows of a result set, every cell rendered as text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl QueryRows {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of the first column, in row order.
    pub fn first_column(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter_map(|row| row.first().cloned())
            .collect()
    }
}

/// Metadata gathered right after a connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub database: Option<String>,
    pub version: String,
    pub user: String,
}

/// One open connection to a backend.
///
/// Implementations report driver failures as `anyhow` errors; the manager
/// and dispatcher translate them into the gate's error taxonomy.
#[async_trait]
pub trait SqlConnection: Send {
    /// Quotes an identifier (table or database name) for this backend.
    fn quote_ident(&self, name: &str) -> String;

    /// `SELECT 1` round trip.
    async fn ping(&mut self) -> Result<()>;

    /// Runs a row-returning statement and collects every row.
    async fn fetch(&mut self, sql: &str) -> Result<QueryRows>;

    /// Runs a statement inside a transaction, commits, and returns the
    /// number of affected rows.
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    /// Base tables of the current database/schema, sorted by name.
    async fn list_tables(&mut self) -> Result<Vec<String>>;

    /// Column structure of `table`.
    async fn describe_table(&mut self, table: &str) -> Result<QueryRows>;

    /// Current database, server version and current user.
    async fn server_info(&mut self) -> Result<ServerInfo>;

    /// Switches the current database on this same connection. Backends that
    /// cannot do that return an error and the manager reopens instead.
    async fn use_database(&mut self, name: &str) -> Result<()>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens connections for a [`ConnectionConfig`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn SqlConnection>>;
}

/// The production connector, backed by sqlx drivers.
pub struct SqlxConnector;

#[async_trait]
impl Connector for SqlxConnector {
    async fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn SqlConnection>> {
        match config.backend {
            BackendKind::MySql => Ok(Box::new(mysql::MySqlBackend::open(config).await?)),
            BackendKind::Postgres => Ok(Box::new(postgres::PgBackend::open(config).await?)),
        }
    }
}
