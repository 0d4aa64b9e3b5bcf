mod agent;
mod backoff;
mod config;
mod db;
mod error;
mod exec;
mod loops;
mod outcome;
mod rules;
mod sandbox;

use std::path::Path;

use anyhow::Result;
use tokio::io::BufReader;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::agent::mediator::Mediator;
use crate::agent::runtime::AgentRuntime;
use crate::config::Config;
use crate::sandbox::Sandbox;

const DEFAULT_CONFIG_PATH: &str = "config/agent-gate.toml";

fn print_help() {
    println!(
        "\
agent-gate v{}

Runs agent-issued shell commands, SQL statements and batch loops inside a
sandbox, one instruction per line on stdin.

USAGE:
    agent-gate [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: {DEFAULT_CONFIG_PATH}]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG       Log level filter for tracing
                   (e.g. debug, agent_gate=debug,warn)
    DB_BACKEND     Default database backend (mysql, postgresql)
    DB_HOST        Default database host
    DB_PORT        Default database port
    DB_USER        Default database user
    DB_PASSWORD    Default database password
    DB_NAME        Default database name

INPUT:
    EXECUTE: ls -l                     run an allowlisted command
    SQL: SELECT * FROM users           run a statement
    LOOP: FILE:COUNT                   apply an operation to every file
    LOOP: TABLE:SHOW:LIMIT:5           apply an operation to every table
    CONNECT: host=db user=app ...      open a database connection
    DISCONNECT                         close it
    /help                              list all commands

EXAMPLES:
    agent-gate                             # uses {DEFAULT_CONFIG_PATH}
    agent-gate /etc/agent-gate.toml        # custom config path
    RUST_LOG=debug agent-gate              # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

/// Loads the config file. The default path may be absent, in which case the
/// built-in defaults apply; an explicit path must exist.
fn load_config(explicit: Option<String>) -> Result<Config> {
    match explicit {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(&path)
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            info!("Loading configuration from {DEFAULT_CONFIG_PATH}");
            Config::load(DEFAULT_CONFIG_PATH)
        }
        None => {
            warn!("{DEFAULT_CONFIG_PATH} not found, using built-in defaults");
            Ok(Config::from_env())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("agent-gate v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Logs go to stderr so stdout carries only results
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agent_gate=info")),
        )
        .init();

    let config = load_config(std::env::args().nth(1))?;

    let sandbox = Sandbox::open(&config.sandbox.root)?;
    if config.sandbox.seed_fixtures {
        sandbox.seed_fixtures()?;
    }

    info!(
        "Timeouts: {}s per command, {}s per install",
        config.exec.command_timeout_secs, config.exec.install_timeout_secs
    );
    match (&config.database.backend_type, &config.database.host) {
        (Some(backend), Some(host)) => info!("Default database: {backend} at {host}"),
        _ => info!("No default database; use CONNECT with full parameters"),
    }

    let mediator = Mediator::new(&config, sandbox);
    let session_id = Uuid::new_v4().to_string();
    info!("Session {session_id}");
    let runtime = AgentRuntime::new(mediator, session_id);

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    tokio::select! {
        result = runtime.run(stdin, stdout) => {
            if let Err(ref e) = result {
                error!("Runtime error: {e}");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting");
            Ok(())
        }
    }
}
