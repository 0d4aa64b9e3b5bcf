use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Every file operation is confined below this directory
    #[serde(default = "default_sandbox_root")]
    pub root: PathBuf,
    /// Create the sample files on startup
    #[serde(default)]
    pub seed_fixtures: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecConfig {
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,
    /// The only PATH child processes see
    #[serde(default = "default_path")]
    pub path: String,
    /// Interpreter used to verify package installs
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

/// Connection defaults. Explicit CONNECT requests override them per session.
///
/// Fields left out of the file fall back to `DB_*` environment variables
/// (see [`DatabaseConfig::with_env_fallback`]).
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub backend_type: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    /// Supports ${ENV_VAR} substitution
    pub password: Option<String>,
    pub database: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    /// First delay between reconnect attempts; doubles on each failure
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    /// Show a spinner on stderr while a connect is in flight
    #[serde(default = "default_show_progress")]
    pub show_progress: bool,
}

fn default_sandbox_root() -> PathBuf {
    PathBuf::from("./sandbox")
}

fn default_command_timeout() -> u64 {
    10
}

fn default_install_timeout() -> u64 {
    300
}

fn default_path() -> String {
    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string()
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_delay() -> u64 {
    500
}

fn default_show_progress() -> bool {
    true
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: default_sandbox_root(),
            seed_fixtures: false,
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout(),
            install_timeout_secs: default_install_timeout(),
            path: default_path(),
            python: default_python(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend_type: None,
            host: None,
            port: None,
            user: None,
            password: None,
            database: None,
            connect_timeout_secs: default_connect_timeout(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay(),
            show_progress: default_show_progress(),
        }
    }
}

impl ExecConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Fills unset fields from `DB_BACKEND`, `DB_HOST`, `DB_PORT`, `DB_USER`,
    /// `DB_PASSWORD` and `DB_NAME`.
    pub fn with_env_fallback(self) -> Self {
        self.with_fallback(|key| std::env::var(key).ok())
    }

    fn with_fallback(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        self.backend_type = self.backend_type.or_else(|| non_empty("DB_BACKEND"));
        self.host = self.host.or_else(|| non_empty("DB_HOST"));
        self.port = self
            .port
            .or_else(|| non_empty("DB_PORT").and_then(|p| p.trim().parse().ok()));
        self.user = self.user.or_else(|| non_empty("DB_USER"));
        self.password = self.password.or_else(|| lookup("DB_PASSWORD"));
        self.database = self.database.or_else(|| non_empty("DB_NAME"));
        self
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${DB_PASSWORD}
        let expanded = shellexpand::env(content)?;
        let mut config: Config = toml::from_str(&expanded)?;
        config.database = config.database.with_env_fallback();
        Ok(config)
    }

    /// Built-in defaults, with database settings taken from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.database = config.database.with_env_fallback();
        config
    }
}
