//! Failure taxonomy shared by every component of the gate.
//!
//! Each variant is recovered at the boundary of the component that detects
//! it and turned into an [`ExecutionResult`](crate::outcome::ExecutionResult)
//! with `success = false`. The `Display` text is what the caller reads, so it
//! never carries passwords or internal state.

use std::time::Duration;

use crate::db::BackendKind;

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("Empty command")]
    EmptyCommand,

    #[error("Invalid command syntax: {0}")]
    InvalidSyntax(String),

    #[error("Command '{0}' is not allowed")]
    UnknownCommand(String),

    #[error("Invalid flags for '{command}': {}", .flags.join(", "))]
    DisallowedFlag { command: String, flags: Vec<String> },

    #[error("Too many arguments for '{command}'. Maximum allowed: {max}")]
    TooManyArguments { command: String, max: usize },

    #[error("Invalid path: {0}")]
    PathEscape(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Package '{0}' is not in the install allowlist")]
    PackageNotAllowlisted(String),

    #[error("Package manager subcommand '{0}' is not allowed")]
    SubcommandNotAllowed(String),

    #[error("Command timed out after {} seconds", .0.as_secs_f32())]
    TimedOut(Duration),

    #[error("Failed to start '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("Not connected to a database. Use CONNECT first")]
    NotConnected,

    #[error("Failed to connect to {backend} at {host} as {user}: {reason}")]
    ConnectionError {
        backend: BackendKind,
        host: String,
        user: String,
        reason: String,
    },

    #[error("Unsupported database backend '{0}' (supported: mysql, postgresql)")]
    UnsupportedBackend(String),

    #[error("Missing connection parameter: {0}")]
    MissingConnectionParameter(&'static str),

    #[error("Failed to switch to database '{name}': {reason}")]
    DatabaseSwitchError { name: String, reason: String },

    #[error("Database error executing '{statement}': {reason}")]
    DatabaseError { statement: String, reason: String },

    #[error("No {0} found to loop over")]
    EmptyCollection(&'static str),

    #[error("Invalid LIMIT value '{0}': expected a non-negative integer")]
    InvalidLimit(String),

    #[error("Invalid loop operation '{operation}' for {collection} loops")]
    InvalidLoopOperation {
        collection: &'static str,
        operation: String,
    },

    #[error("Invalid loop type '{0}' (expected FILE or TABLE)")]
    InvalidLoopType(String),
}

pub type GateResult<T> = Result<T, GateError>;
