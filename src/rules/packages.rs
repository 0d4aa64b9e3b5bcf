//! Package install validator.
//!
//! Package-manager invocations bypass the generic flag/argument rules and
//! are judged here instead: only a handful of read-only subcommands plus
//! `install` of allowlisted packages get through.

use crate::error::{GateError, GateResult};

use super::ParsedInstruction;

/// Executables whose invocations are routed through this module.
pub const PACKAGE_MANAGERS: &[&str] = &["pip", "pip3"];

/// A package that may be installed, and the module that proves it loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowedPackage {
    pub name: &'static str,
    pub module: &'static str,
}

const ALLOWED_PACKAGES: &[AllowedPackage] = &[
    AllowedPackage { name: "requests", module: "requests" },
    AllowedPackage { name: "numpy", module: "numpy" },
    AllowedPackage { name: "pandas", module: "pandas" },
    AllowedPackage { name: "matplotlib", module: "matplotlib" },
    AllowedPackage { name: "scipy", module: "scipy" },
    AllowedPackage { name: "flask", module: "flask" },
    AllowedPackage { name: "pytest", module: "pytest" },
    AllowedPackage { name: "beautifulsoup4", module: "bs4" },
    AllowedPackage { name: "pyyaml", module: "yaml" },
    AllowedPackage { name: "python-dateutil", module: "dateutil" },
    AllowedPackage { name: "tabulate", module: "tabulate" },
    AllowedPackage { name: "rich", module: "rich" },
];

const INSTALL_FLAGS: &[&str] = &["-U", "--upgrade", "-q", "--quiet", "--no-cache-dir"];

const VERSION_FLAGS: &[&str] = &["-V", "--version"];

/// What a package-manager invocation was judged to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageCommand {
    Install(Vec<AllowedPackage>),
    List,
    Freeze,
    Version,
}

pub fn is_package_manager(executable: &str) -> bool {
    PACKAGE_MANAGERS.contains(&executable)
}

pub fn lookup(name: &str) -> Option<AllowedPackage> {
    let wanted = normalize(name);
    ALLOWED_PACKAGES.iter().copied().find(|p| p.name == wanted)
}

/// Strips a version specifier or extras: `pandas>=2.0` → `pandas`,
/// `requests[socks]==2.31` → `requests`.
pub fn strip_version(spec: &str) -> &str {
    let end = spec
        .find(|c: char| matches!(c, '=' | '<' | '>' | '!' | '~' | ';' | '[' | '@' | ' '))
        .unwrap_or(spec.len());
    spec[..end].trim()
}

fn normalize(name: &str) -> String {
    strip_version(name).to_ascii_lowercase().replace('_', "-")
}

pub fn validate(parsed: &ParsedInstruction) -> GateResult<PackageCommand> {
    let flags = parsed.flags();
    let positional = parsed.positional_args();

    let Some(subcommand) = positional.first() else {
        if !flags.is_empty() && flags.iter().all(|f| VERSION_FLAGS.contains(&f.as_str())) {
            return Ok(PackageCommand::Version);
        }
        let shown = flags.iter().cloned().collect::<Vec<_>>().join(" ");
        return Err(GateError::SubcommandNotAllowed(if shown.is_empty() {
            "(none)".to_string()
        } else {
            shown
        }));
    };

    match subcommand.as_str() {
        "install" => {
            reject_flags(parsed, INSTALL_FLAGS)?;
            let specs = &positional[1..];
            if specs.is_empty() {
                return Err(GateError::PackageNotAllowlisted("(none given)".to_string()));
            }
            let packages = specs
                .iter()
                .map(|spec| {
                    lookup(spec)
                        .ok_or_else(|| GateError::PackageNotAllowlisted(strip_version(spec).to_string()))
                })
                .collect::<GateResult<Vec<_>>>()?;
            Ok(PackageCommand::Install(packages))
        }
        "list" | "freeze" => {
            reject_flags(parsed, &[])?;
            if positional.len() > 1 {
                return Err(GateError::TooManyArguments {
                    command: format!("{} {subcommand}", parsed.executable()),
                    max: 0,
                });
            }
            Ok(if subcommand == "list" {
                PackageCommand::List
            } else {
                PackageCommand::Freeze
            })
        }
        other => Err(GateError::SubcommandNotAllowed(other.to_string())),
    }
}

fn reject_flags(parsed: &ParsedInstruction, allowed: &[&str]) -> GateResult<()> {
    let invalid: Vec<String> = parsed
        .flags()
        .iter()
        .filter(|f| !allowed.contains(&f.as_str()))
        .cloned()
        .collect();
    if invalid.is_empty() {
        Ok(())
    } else {
        Err(GateError::DisallowedFlag {
            command: parsed.executable().to_string(),
            flags: invalid,
        })
    }
}
