//! Per-session connection lifecycle.
//!
//! A [`ConnectionManager`] owns zero or one live connection. Queries go
//! through [`ConnectionManager::ensure_live`], which refuses to run while
//! disconnected and transparently reopens a connection whose transport went
//! stale.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::DatabaseConfig;
use crate::error::{GateError, GateResult};

use super::spinner::Spinner;
use super::{BackendKind, ConnectionConfig, Connector, ServerInfo, SqlConnection};

const SPINNER_INTERVAL: Duration = Duration::from_millis(120);

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected(BackendKind),
    /// The last liveness probe failed; the next query reconnects.
    Stale(BackendKind),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("not connected"),
            Self::Connected(backend) => write!(f, "connected to {backend}"),
            Self::Stale(backend) => write!(f, "stale {backend} connection, reopened on next query"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub connect_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub show_progress: bool,
}

impl From<&DatabaseConfig> for ManagerSettings {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            reconnect_attempts: config.reconnect_attempts,
            reconnect_delay: config.reconnect_delay(),
            show_progress: config.show_progress,
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from(&DatabaseConfig::default())
    }
}

/// An open connection and the parameters that produced it. `config.database`
/// tracks the current database, so a reconnect lands where the session was.
struct Live {
    conn: Box<dyn SqlConnection>,
    config: ConnectionConfig,
}

enum Slot {
    Disconnected,
    Connected(Live),
    Stale(ConnectionConfig),
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    settings: ManagerSettings,
    slot: Slot,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, settings: ManagerSettings) -> Self {
        Self {
            connector,
            settings,
            slot: Slot::Disconnected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        match &self.slot {
            Slot::Disconnected => ConnectionState::Disconnected,
            Slot::Connected(live) => ConnectionState::Connected(live.config.backend),
            Slot::Stale(config) => ConnectionState::Stale(config.backend),
        }
    }

    pub fn current_database(&self) -> Option<&str> {
        match &self.slot {
            Slot::Connected(live) => live.config.database.as_deref(),
            Slot::Stale(config) => config.database.as_deref(),
            Slot::Disconnected => None,
        }
    }

    /// `host:port as user` of the current or stale connection.
    pub fn endpoint(&self) -> Option<String> {
        let config = match &self.slot {
            Slot::Connected(live) => &live.config,
            Slot::Stale(config) => config,
            Slot::Disconnected => return None,
        };
        Some(format!("{}:{} as {}", config.host, config.port(), config.user))
    }

    // ── Connect / disconnect ─────────────────────────────

    /// Opens a new connection, replacing any existing one.
    ///
    /// On failure the manager is left Disconnected.
    pub async fn connect(&mut self, mut config: ConnectionConfig) -> GateResult<String> {
        if !matches!(self.slot, Slot::Disconnected) {
            let closed = self.disconnect().await;
            debug!("Closed previous connection before connect: {closed}");
        }

        info!(
            "Connecting to {} at {}:{} as {}",
            config.backend,
            config.host,
            config.port(),
            config.user
        );

        let spinner = Spinner::start(
            format!("Connecting to {} at {}...", config.backend, config.host),
            self.settings.show_progress,
            SPINNER_INTERVAL,
        );
        let opened = self.open_probed(&config).await;
        spinner.stop().await;

        match opened {
            Ok((conn, server)) => {
                config.database = server.database.clone().or(config.database);
                let report = connect_report(&config, &server);
                info!("Connected to {} at {}", config.backend, config.host);
                self.slot = Slot::Connected(Live { conn, config });
                Ok(report)
            }
            Err(e) => {
                warn!("Connection to {} at {} failed: {e}", config.backend, config.host);
                let err = connection_error(&config, &e);
                config.clear_credentials();
                Err(err)
            }
        }
    }

    /// Closes the connection. Calling it while disconnected is not an error.
    ///
    /// A failure while closing is logged; local state is cleared either way.
    pub async fn disconnect(&mut self) -> String {
        match std::mem::replace(&mut self.slot, Slot::Disconnected) {
            Slot::Disconnected => "Not connected to any database; no action needed".to_string(),
            Slot::Stale(mut config) => {
                config.clear_credentials();
                info!("Dropped stale connection to {} at {}", config.backend, config.host);
                format!("Disconnected from {} at {}", config.backend, config.host)
            }
            Slot::Connected(Live { conn, mut config }) => {
                if let Err(e) = conn.close().await {
                    warn!("Error while closing connection to {}: {e}", config.host);
                }
                config.clear_credentials();
                info!("Disconnected from {} at {}", config.backend, config.host);
                format!("Disconnected from {} at {}", config.backend, config.host)
            }
        }
    }

    // ── Liveness ─────────────────────────────────────────

    /// Returns the live connection, reconnecting first if it went stale.
    pub async fn ensure_live(&mut self) -> GateResult<&mut dyn SqlConnection> {
        let healthy = match &mut self.slot {
            Slot::Disconnected => return Err(GateError::NotConnected),
            Slot::Stale(_) => false,
            Slot::Connected(live) => match live.conn.ping().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Liveness probe to {} failed: {e}", live.config.host);
                    false
                }
            },
        };

        if !healthy {
            self.mark_stale();
            self.reconnect().await?;
        }

        match &mut self.slot {
            Slot::Connected(live) => Ok(live.conn.as_mut()),
            _ => Err(GateError::NotConnected),
        }
    }

    fn mark_stale(&mut self) {
        self.slot = match std::mem::replace(&mut self.slot, Slot::Disconnected) {
            Slot::Connected(live) => Slot::Stale(live.config),
            other => other,
        };
    }

    /// Reopens a stale connection with exponential backoff. Gives up after
    /// the configured number of attempts and leaves the manager Disconnected.
    async fn reconnect(&mut self) -> GateResult<()> {
        let Slot::Stale(mut config) = std::mem::replace(&mut self.slot, Slot::Disconnected) else {
            return Err(GateError::NotConnected);
        };

        let max_attempts = self.settings.reconnect_attempts.max(1);
        let mut backoff = Backoff::for_reconnect(self.settings.reconnect_delay);
        let mut last_error = anyhow!("no reconnect attempt made");

        loop {
            warn!(
                "Reconnecting to {} at {} (attempt {}/{max_attempts})",
                config.backend,
                config.host,
                backoff.attempt + 1
            );
            match self.open_probed(&config).await {
                Ok((conn, _)) => {
                    info!("Reconnected to {} at {}", config.backend, config.host);
                    self.slot = Slot::Connected(Live { conn, config });
                    return Ok(());
                }
                Err(e) => {
                    warn!("Reconnect attempt failed: {e}");
                    last_error = e;
                }
            }

            let delay = backoff.next_delay();
            if backoff.exceeded_max_attempts(max_attempts) {
                break;
            }
            tokio::time::sleep(delay).await;
        }

        let err = connection_error(&config, &last_error);
        config.clear_credentials();
        Err(err)
    }

    // ── Database switching ───────────────────────────────

    /// Makes `name` the current database of the live connection.
    ///
    /// MySQL switches in place; PostgreSQL reopens against the new database
    /// and keeps the old connection if that fails.
    pub async fn switch_database(&mut self, name: &str) -> GateResult<String> {
        let name = name.trim().trim_matches(|c| c == '`' || c == '"' || c == ';');
        let (backend, mut config) = match &self.slot {
            Slot::Connected(live) => (live.config.backend, live.config.clone()),
            _ => return Err(GateError::NotConnected),
        };
        let switch_error = |e: anyhow::Error| GateError::DatabaseSwitchError {
            name: name.to_string(),
            reason: e.to_string(),
        };

        match backend {
            BackendKind::MySql => {
                if let Slot::Connected(live) = &mut self.slot {
                    live.conn.use_database(name).await.map_err(switch_error)?;
                    live.config.database = Some(name.to_string());
                }
            }
            BackendKind::Postgres => {
                config.database = Some(name.to_string());
                let (conn, _) = self.open_probed(&config).await.map_err(switch_error)?;
                let previous = std::mem::replace(&mut self.slot, Slot::Connected(Live { conn, config }));
                if let Slot::Connected(old) = previous {
                    if let Err(e) = old.conn.close().await {
                        debug!("Closing previous PostgreSQL connection failed: {e}");
                    }
                }
            }
        }

        info!("Switched to database {name}");
        Ok(format!("Switched to database: {name}"))
    }

    /// Opens a connection and runs the liveness and metadata probes on it,
    /// all within the connect timeout.
    async fn open_probed(
        &self,
        config: &ConnectionConfig,
    ) -> Result<(Box<dyn SqlConnection>, ServerInfo)> {
        let timeout = self.settings.connect_timeout;
        let probed = async {
            let mut conn = self.connector.open(config).await?;
            conn.ping().await?;
            let server = conn.server_info().await?;
            Ok::<_, anyhow::Error>((conn, server))
        };
        tokio::time::timeout(timeout, probed)
            .await
            .map_err(|_| anyhow!("connection timed out after {} seconds", timeout.as_secs_f32()))?
    }
}

fn connect_report(config: &ConnectionConfig, server: &ServerInfo) -> String {
    format!(
        "Connected to {} at {}:{} as {}\n\
         Database: {}\n\
         Server version: {}\n\
         Current user: {}",
        config.backend,
        config.host,
        config.port(),
        config.user,
        config.database.as_deref().unwrap_or("(none selected)"),
        server.version,
        server.user,
    )
}

fn connection_error(config: &ConnectionConfig, reason: &anyhow::Error) -> GateError {
    GateError::ConnectionError {
        backend: config.backend,
        host: config.host.clone(),
        user: config.user.clone(),
        reason: reason.to_string(),
    }
}
