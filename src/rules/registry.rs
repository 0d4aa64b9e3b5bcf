/// Rule registry — the static table of executables an instruction may run.
///
/// Each rule fixes the flags the command accepts and how many positional
/// arguments it may take. The table is built once and never changes.
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRule {
    pub name: &'static str,
    pub allowed_flags: BTreeSet<&'static str>,
    pub max_positional_args: usize,
    pub description: &'static str,
}

/// (name, allowed flags, max positional args, description)
type RuleRow = (&'static str, &'static [&'static str], usize, &'static str);

const BUILTIN_RULES: &[RuleRow] = &[
    (
        "ls",
        &["-l", "-a", "-h", "-r", "--sort", "-S", "-lh", "-lS", "-la", "-lha"],
        2,
        "List directory contents",
    ),
    (
        "grep",
        &["-i", "-v", "-n", "-r", "-l", "--recursive"],
        4,
        "Search for patterns",
    ),
    ("find", &["-type", "-name", "-f"], 4, "Search for files"),
    ("cat", &["-n", "--number"], 2, "Display file contents"),
    ("head", &["-n"], 2, "Output the first part of files"),
    ("tail", &["-n", "-f"], 2, "Output the last part of files"),
    ("wc", &["-l", "-w", "-c"], 2, "Print newline, word, and byte counts"),
    ("sort", &["-r", "-n"], 2, "Sort lines of text files"),
    ("uniq", &["-c", "-d", "-u"], 2, "Report or omit repeated lines"),
    ("echo", &["-n", "-e"], 10, "Display a line of text"),
    ("ps", &["-e", "-f", "-a"], 1, "Report process status"),
    ("df", &["-h", "-i"], 1, "Report file system disk space usage"),
    ("du", &["-h", "-s", "-a"], 2, "Estimate file space usage"),
    ("pwd", &[], 0, "Print the working directory"),
    ("python3", &["-V", "--version"], 1, "Run a Python script or inline code"),
    ("python", &["-V", "--version"], 1, "Run a Python script or inline code"),
    ("pip", &["-V", "--version"], 0, "Install or inspect allowlisted Python packages"),
    ("pip3", &["-V", "--version"], 0, "Install or inspect allowlisted Python packages"),
];

#[derive(Debug, Clone)]
pub struct RuleRegistry {
    rules: BTreeMap<&'static str, CommandRule>,
}

impl RuleRegistry {
    /// The registry of commands the gate ships with.
    pub fn builtin() -> Self {
        Self::from_rows(BUILTIN_RULES)
    }

    fn from_rows(rows: &[RuleRow]) -> Self {
        let mut rules = BTreeMap::new();
        for &(name, flags, max_positional_args, description) in rows {
            let rule = CommandRule {
                name,
                allowed_flags: flags.iter().copied().collect(),
                max_positional_args,
                description,
            };
            // First definition wins; names are unique
            rules.entry(name).or_insert(rule);
        }
        Self { rules }
    }

    pub fn get(&self, name: &str) -> Option<&CommandRule> {
        self.rules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandRule> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// One line per command, for the CLI help output.
    pub fn describe(&self) -> String {
        self.iter()
            .map(|rule| format!("  {:<8} {}", rule.name, rule.description))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
