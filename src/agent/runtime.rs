use std::time::Instant;

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use crate::db::ConnectRequest;

use super::mediator::{Directive, Mediator};
use super::session::{SessionStore, SharedSession};

/// Leading keywords that mark an untagged line as SQL.
const SQL_KEYWORDS: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "SHOW", "DESCRIBE", "DESC", "USE", "CREATE", "DROP",
    "ALTER", "TRUNCATE",
];

/// The line-oriented collaborator.
///
/// Reads one instruction per line, turns tagged lines (`EXECUTE:`, `SQL:`,
/// `LOOP:`, `CONNECT:`, `DISCONNECT`) into directives and writes each result
/// back. Slash commands are answered here and never reach the core.
pub struct AgentRuntime {
    mediator: Mediator,
    sessions: SessionStore,
    session_id: String,
    start_time: Instant,
}

impl AgentRuntime {
    pub fn new(mediator: Mediator, session_id: impl Into<String>) -> Self {
        Self {
            mediator,
            sessions: SessionStore::new(),
            session_id: session_id.into(),
            start_time: Instant::now(),
        }
    }

    fn session(&self) -> SharedSession {
        self.sessions.get_or_create(&self.session_id, || {
            self.mediator.new_session(self.session_id.clone())
        })
    }

    /// Main loop: runs until EOF or `quit`/`exit`.
    pub async fn run<R, W>(&self, input: R, mut output: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!("Gate runtime started, waiting for instructions...");
        let mut lines = input.lines();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if matches!(line.to_ascii_lowercase().as_str(), "quit" | "exit") {
                info!("Quit requested");
                break;
            }

            let response = if line.starts_with('/') {
                self.handle_command(line).await
            } else {
                self.handle_line(line).await
            };

            output.write_all(response.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }

        // Leave no connection open behind us
        if let Some(session) = self.sessions.remove(&self.session_id) {
            session.lock().await.db.disconnect().await;
        }
        Ok(())
    }

    async fn handle_line(&self, line: &str) -> String {
        let directive = match parse_line(line) {
            Ok(directive) => directive,
            Err(e) => {
                warn!("Unparseable line: {e}");
                return format!("Error: {e}");
            }
        };

        let session = self.session();
        let mut session = session.lock().await;
        let result = self.mediator.handle(&mut session, directive).await;
        if result.success {
            result.output
        } else {
            format!("Error: {}", result.output)
        }
    }

    // ── Slash commands ────────────────────────────────────

    async fn handle_command(&self, body: &str) -> String {
        let command = body.split_whitespace().next().unwrap_or(body).to_lowercase();
        info!("Slash command: {command}");

        match command.as_str() {
            "/reset" => self.cmd_reset().await,
            "/status" => self.cmd_status().await,
            "/rules" => self.mediator.registry().describe(),
            "/help" => cmd_help(),
            "/ping" => "pong".to_string(),
            _ => format!("Unknown command: {command}\nType /help for available commands."),
        }
    }

    /// /reset — Disconnect and start a fresh session at the sandbox root
    async fn cmd_reset(&self) -> String {
        if let Some(session) = self.sessions.remove(&self.session_id) {
            session.lock().await.db.disconnect().await;
        }
        "Session reset".to_string()
    }

    /// /status — Uptime, working directory and connection
    async fn cmd_status(&self) -> String {
        let uptime = self.start_time.elapsed();
        let hours = uptime.as_secs() / 3600;
        let minutes = (uptime.as_secs() % 3600) / 60;

        let session = self.session();
        let session = session.lock().await;
        let db = &session.db;
        let connection = match db.endpoint() {
            Some(endpoint) => format!("{} ({endpoint})", db.state()),
            None => db.state().to_string(),
        };
        format!(
            "agent-gate v{} — status\n\
             Uptime: {hours}h {minutes}m\n\
             Sandbox: {}\n\
             Directory: {}\n\
             Connection: {connection}\n\
             Database: {}\n\
             Allowed commands: {}",
            env!("CARGO_PKG_VERSION"),
            self.mediator.sandbox().root().display(),
            session.display_cwd(),
            db.current_database().unwrap_or("none"),
            self.mediator.registry().len(),
        )
    }
}

fn cmd_help() -> String {
    "\
Instructions:\n\
  EXECUTE: <command>          Run an allowlisted command in the sandbox\n\
  SQL: <statement>            Run a statement on the current connection\n\
  LOOP: FILE:<op>             CAT, COUNT, SIZE or a command, per file\n\
  LOOP: TABLE:<op>[:LIMIT:n]  SHOW, COUNT or DESCRIBE, per table\n\
  CONNECT: key=value ...      Open a connection (or a JSON object)\n\
  DISCONNECT                  Close the connection\n\
Commands:\n\
  /status  — Uptime, directory, connection\n\
  /rules   — Allowed commands and flags\n\
  /reset   — Disconnect and start over\n\
  /ping    — Check if the gate is alive\n\
  /help    — This message"
        .to_string()
}

/// Maps one input line onto a directive.
///
/// Untagged lines starting with a SQL keyword are SQL, anything else is a
/// shell instruction.
pub fn parse_line(line: &str) -> std::result::Result<Directive, String> {
    let line = line.trim();
    if line.trim_end_matches(':').eq_ignore_ascii_case("DISCONNECT") {
        return Ok(Directive::Disconnect);
    }

    if let Some((tag, body)) = line.split_once(':') {
        let body = body.trim();
        match tag.trim().to_ascii_uppercase().as_str() {
            "EXECUTE" => return Ok(Directive::Shell(body.to_string())),
            "SQL" => return Ok(Directive::Sql(body.to_string())),
            "LOOP" => return Ok(parse_loop(body)),
            "CONNECT" => return parse_connect(body).map(Directive::Connect),
            _ => {}
        }
    }

    let first = line.split_whitespace().next().unwrap_or("").to_ascii_uppercase();
    if SQL_KEYWORDS.contains(&first.as_str()) {
        Ok(Directive::Sql(line.to_string()))
    } else {
        Ok(Directive::Shell(line.to_string()))
    }
}

/// `FILE:COUNT`, `FILE COUNT`, `TABLE:SHOW:LIMIT:5`, `FILE: wc -l`...
fn parse_loop(body: &str) -> Directive {
    let (collection, operation) = match body.find(|c: char| c == ':' || c.is_whitespace()) {
        Some(idx) => (&body[..idx], body[idx + 1..].trim()),
        None => (body, ""),
    };
    Directive::Loop {
        collection: collection.trim().to_string(),
        operation: operation.to_string(),
    }
}

/// Accepts either a JSON object or `key=value` pairs (shell quoting allowed).
fn parse_connect(body: &str) -> std::result::Result<ConnectRequest, String> {
    if body.starts_with('{') {
        return serde_json::from_str(body).map_err(|e| format!("Invalid CONNECT parameters: {e}"));
    }

    let words = shell_words::split(body).map_err(|e| format!("Invalid CONNECT parameters: {e}"))?;
    let mut request = ConnectRequest::default();
    for word in words {
        let (key, value) = word
            .split_once('=')
            .ok_or_else(|| format!("Invalid CONNECT parameter '{word}': expected key=value"))?;
        let value = value.to_string();
        match key.to_ascii_lowercase().as_str() {
            "backend_type" | "backend" | "type" => request.backend_type = Some(value),
            "host" => request.host = Some(value),
            "port" => {
                let port = value
                    .parse()
                    .map_err(|_| format!("Invalid CONNECT parameter 'port': {value}"))?;
                request.port = Some(port);
            }
            "user" => request.user = Some(value),
            "password" => request.password = Some(value),
            "database" | "db" => request.database = Some(value),
            _ => {
                request.options.insert(key.to_string(), value);
            }
        }
    }
    Ok(request)
}
