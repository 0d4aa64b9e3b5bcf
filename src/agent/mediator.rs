use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{Config, DatabaseConfig, ExecConfig};
use crate::db::{self, ConnectRequest, ConnectionManager, Connector, ManagerSettings, SqlxConnector};
use crate::error::{GateError, GateResult};
use crate::exec::ProcessExecutor;
use crate::loops::LoopEngine;
use crate::outcome::ExecutionResult;
use crate::rules::packages::PackageCommand;
use crate::rules::{CommandValidator, ParsedInstruction, RuleRegistry, Verdict};
use crate::sandbox::Sandbox;

use super::session::Session;

/// A pre-classified instruction. Deciding which kind a raw line is belongs
/// to the collaborator, not to the core.
#[derive(Debug, Clone)]
pub enum Directive {
    Shell(String),
    Sql(String),
    Loop { collection: String, operation: String },
    Connect(ConnectRequest),
    Disconnect,
}

impl Directive {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Shell(_) => "shell",
            Self::Sql(_) => "sql",
            Self::Loop { .. } => "loop",
            Self::Connect(_) => "connect",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Routes directives to the validator, executor, SQL dispatcher and loop
/// engine on behalf of one session at a time.
pub struct Mediator {
    sandbox: Sandbox,
    validator: CommandValidator,
    executor: ProcessExecutor,
    loops: LoopEngine,
    exec: ExecConfig,
    db_defaults: DatabaseConfig,
    connector: Arc<dyn Connector>,
}

impl Mediator {
    pub fn new(config: &Config, sandbox: Sandbox) -> Self {
        Self::with_connector(config, sandbox, Arc::new(SqlxConnector))
    }

    pub fn with_connector(config: &Config, sandbox: Sandbox, connector: Arc<dyn Connector>) -> Self {
        let validator = CommandValidator::new(RuleRegistry::builtin(), sandbox.clone());
        let executor = ProcessExecutor::new(&config.exec, sandbox.root());
        let loops = LoopEngine::new(
            validator.clone(),
            executor.clone(),
            config.exec.command_timeout(),
        );
        Self {
            sandbox,
            validator,
            executor,
            loops,
            exec: config.exec.clone(),
            db_defaults: config.database.clone(),
            connector,
        }
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn registry(&self) -> &RuleRegistry {
        self.validator.registry()
    }

    pub fn new_session(&self, id: impl Into<String>) -> Session {
        let manager = ConnectionManager::new(
            self.connector.clone(),
            ManagerSettings::from(&self.db_defaults),
        );
        Session::new(id, manager)
    }

    /// Resolves one directive completely and reports the outcome. Every
    /// failure comes back as `success = false`.
    pub async fn handle(&self, session: &mut Session, directive: Directive) -> ExecutionResult {
        info!("[{}] {} directive", session.id(), directive.kind());

        let result = match directive {
            Directive::Shell(text) => self.shell(session, &text).await,
            Directive::Sql(statement) => db::dispatch::execute(&mut session.db, &statement).await,
            Directive::Loop {
                collection,
                operation,
            } => {
                let cwd = self.sandbox.absolute(session.cwd());
                self.loops
                    .run(&collection, &operation, &cwd, &mut session.db)
                    .await
            }
            Directive::Connect(request) => {
                match request.with_defaults(&self.db_defaults).into_config() {
                    Ok(config) => session.db.connect(config).await.into(),
                    Err(e) => e.into(),
                }
            }
            Directive::Disconnect => ExecutionResult::ok(session.db.disconnect().await),
        };

        debug!("[{}] success={} output={:?}", session.id(), result.success, result.output);
        result
    }

    // ── Shell ────────────────────────────────────────────

    async fn shell(&self, session: &mut Session, text: &str) -> ExecutionResult {
        let parsed = match ParsedInstruction::parse(text) {
            Ok(parsed) => parsed,
            Err(e) => return e.into(),
        };

        if parsed.executable() == "cd" {
            return self.change_dir(session, &parsed).into();
        }

        let cwd = self.sandbox.absolute(session.cwd());
        match self.validator.validate(&parsed, &cwd) {
            Err(e) => e.into(),
            Ok(Verdict::Package(PackageCommand::Install(packages))) => {
                self.executor
                    .run_install(&parsed, &packages, &cwd, self.exec.install_timeout())
                    .await
            }
            Ok(_) => {
                self.executor
                    .run(&parsed, &cwd, self.exec.command_timeout())
                    .await
            }
        }
    }

    /// `cd [dir]`: moves the session's working directory, never outside the
    /// sandbox. Without an argument it returns to the root.
    fn change_dir(&self, session: &mut Session, parsed: &ParsedInstruction) -> GateResult<String> {
        if !parsed.flags().is_empty() {
            return Err(GateError::DisallowedFlag {
                command: "cd".to_string(),
                flags: parsed.flags().iter().cloned().collect(),
            });
        }

        let target = match parsed.positional_args() {
            [] => self.sandbox.root().to_path_buf(),
            [dir] => {
                let base = self.sandbox.absolute(session.cwd());
                let resolved = self
                    .sandbox
                    .resolve(&base, dir)
                    .ok_or_else(|| GateError::PathEscape(dir.clone()))?;
                if !resolved.is_dir() {
                    return Err(GateError::NotADirectory(dir.clone()));
                }
                resolved
            }
            _ => {
                return Err(GateError::TooManyArguments {
                    command: "cd".to_string(),
                    max: 1,
                })
            }
        };

        session.set_cwd(self.sandbox.relative(&target));
        info!("[{}] cwd is now {}", session.id(), session.display_cwd());
        Ok(format!("Current directory: {}", session.display_cwd()))
    }
}
