use std::path::Path;

use tracing::warn;

use crate::error::{GateError, GateResult};
use crate::sandbox::Sandbox;

use super::packages::{self, PackageCommand};
use super::{ParsedInstruction, RuleRegistry};

/// Interpreters whose inline-code flag skips flag and path checks.
///
/// Inline code cannot be path-validated, so these pairs are let through
/// as-is. Keep this table explicit; nothing else is inferred from it.
pub const INLINE_CODE_FLAGS: &[(&str, &str)] = &[("python3", "-c"), ("python", "-c")];

/// Why an instruction was accepted. The mediator picks the execution path
/// (timeout, post-install verification) from this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Command,
    InlineCode,
    Package(PackageCommand),
}

/// Applies the rule registry and the sandbox to parsed instructions.
///
/// Pure decision function: nothing is executed or touched on disk.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    registry: RuleRegistry,
    sandbox: Sandbox,
}

impl CommandValidator {
    pub fn new(registry: RuleRegistry, sandbox: Sandbox) -> Self {
        Self { registry, sandbox }
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    /// Validates `executable args…` with paths resolved from the sandbox root.
    #[cfg(test)]
    pub fn validate_parts(&self, executable: &str, args: &[&str]) -> GateResult<Verdict> {
        let parsed = ParsedInstruction::from_parts(
            executable,
            args.iter().map(|a| a.to_string()).collect(),
        );
        self.validate(&parsed, self.sandbox.root())
    }

    /// Validates an instruction whose relative paths resolve from `base`.
    pub fn validate(&self, parsed: &ParsedInstruction, base: &Path) -> GateResult<Verdict> {
        let verdict = self.check(parsed, base);
        if let Err(ref e) = verdict {
            warn!("Rejected '{}': {e}", parsed.display());
        }
        verdict
    }

    fn check(&self, parsed: &ParsedInstruction, base: &Path) -> GateResult<Verdict> {
        let command = parsed.executable();
        let rule = self
            .registry
            .get(command)
            .ok_or_else(|| GateError::UnknownCommand(command.to_string()))?;

        if is_inline_code(parsed) {
            return Ok(Verdict::InlineCode);
        }

        if packages::is_package_manager(command) {
            return packages::validate(parsed).map(Verdict::Package);
        }

        let invalid: Vec<String> = parsed
            .flags()
            .iter()
            .filter(|f| !rule.allowed_flags.contains(f.as_str()))
            .cloned()
            .collect();
        if !invalid.is_empty() {
            return Err(GateError::DisallowedFlag {
                command: command.to_string(),
                flags: invalid,
            });
        }

        if parsed.positional_args().len() > rule.max_positional_args {
            return Err(GateError::TooManyArguments {
                command: command.to_string(),
                max: rule.max_positional_args,
            });
        }

        if let Some(escaping) = parsed
            .positional_args()
            .iter()
            .find(|arg| !self.sandbox.is_contained(base, arg))
        {
            return Err(GateError::PathEscape(escaping.clone()));
        }

        Ok(Verdict::Command)
    }
}

fn is_inline_code(parsed: &ParsedInstruction) -> bool {
    let first = parsed.args().first().map(String::as_str);
    INLINE_CODE_FLAGS
        .iter()
        .any(|&(interpreter, flag)| parsed.executable() == interpreter && first == Some(flag))
}
