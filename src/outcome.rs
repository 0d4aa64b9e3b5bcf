use std::fmt;

use crate::error::GateError;

/// What every execution path hands back to the collaborator.
///
/// `output` is always filled: on failure it holds the readable error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub output: String,
    pub success: bool,
}

impl ExecutionResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: true,
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: false,
        }
    }
}

impl From<GateError> for ExecutionResult {
    fn from(err: GateError) -> Self {
        Self::failed(err.to_string())
    }
}

impl From<Result<String, GateError>> for ExecutionResult {
    fn from(result: Result<String, GateError>) -> Self {
        match result {
            Ok(output) => Self::ok(output),
            Err(e) => e.into(),
        }
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.output)
    }
}
