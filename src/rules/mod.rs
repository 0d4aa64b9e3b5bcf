pub mod packages;
pub mod registry;
pub mod validator;

use std::collections::BTreeSet;

use crate::error::{GateError, GateResult};

pub use registry::RuleRegistry;
pub use validator::{CommandValidator, Verdict};

/// A shell-style instruction split into executable, flags and positional
/// arguments.
///
/// Tokens starting with `-` (other than a lone `-`) are flags. The original
/// argument order is kept so the process receives exactly what was typed:
/// `find . -name '*.py'` must not become `find -name . *.py`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedInstruction {
    executable: String,
    flags: BTreeSet<String>,
    positional_args: Vec<String>,
    args: Vec<String>,
}

impl ParsedInstruction {
    /// Tokenizes `text` with POSIX shell quoting rules. No expansion,
    /// globbing or operators are interpreted.
    pub fn parse(text: &str) -> GateResult<Self> {
        let mut tokens = shell_words::split(text)
            .map_err(|e| GateError::InvalidSyntax(e.to_string()))?
            .into_iter();
        let executable = tokens.next().ok_or(GateError::EmptyCommand)?;
        Ok(Self::from_parts(executable, tokens.collect()))
    }

    pub fn from_parts(executable: impl Into<String>, args: Vec<String>) -> Self {
        let flags = args.iter().filter(|a| is_flag(a)).cloned().collect();
        let positional_args = args.iter().filter(|a| !is_flag(a)).cloned().collect();
        Self {
            executable: executable.into(),
            flags,
            positional_args,
            args,
        }
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn flags(&self) -> &BTreeSet<String> {
        &self.flags
    }

    pub fn positional_args(&self) -> &[String] {
        &self.positional_args
    }

    /// Arguments after the executable, in their original order.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Copy of this instruction with one more positional argument appended.
    pub fn with_arg(&self, arg: impl Into<String>) -> Self {
        let mut args = self.args.clone();
        args.push(arg.into());
        Self::from_parts(self.executable.clone(), args)
    }

    /// The instruction as a single shell-quoted line, for reports and logs.
    pub fn display(&self) -> String {
        let mut words = vec![self.executable.as_str()];
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }
}

fn is_flag(token: &str) -> bool {
    token.len() > 1 && token.starts_with('-')
}
