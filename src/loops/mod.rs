//! Batch loops over files and tables.
//!
//! A loop applies one operation to every member of a collection: the regular
//! files of the session's working directory, or the tables of the connected
//! database. The directive is parsed and checked up front; once iteration
//! starts, a failing member is reported inline and the loop carries on.

use std::path::Path;
use std::time::Duration;

use anyhow::anyhow;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::db::dispatch::plural;
use crate::db::format::render_table;
use crate::db::ConnectionManager;
use crate::error::{GateError, GateResult};
use crate::exec::{ProcessExecutor, TRUNCATION_MARKER};
use crate::outcome::ExecutionResult;
use crate::rules::packages::is_package_manager;
use crate::rules::{CommandValidator, ParsedInstruction, Verdict};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOperation {
    /// Content of each file
    Cat,
    /// Line count of each file
    Count,
    /// Human-readable size of each file
    Size,
    /// An allowlisted command, run once per file with the file name appended
    Command(ParsedInstruction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableOperation {
    Show,
    Count,
    Describe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopDirective {
    Files(FileOperation),
    Tables {
        operation: TableOperation,
        /// Row cap for SHOW; parsed for every operation, applied to SHOW only
        limit: Option<u64>,
    },
}

impl LoopDirective {
    /// Parses a collection name (`FILE`/`TABLE`) and an operation such as
    /// `COUNT`, `wc -l` or `SHOW LIMIT 5` (`SHOW:LIMIT:5` also accepted).
    pub fn parse(collection: &str, operation: &str) -> GateResult<Self> {
        match collection.trim().to_ascii_uppercase().as_str() {
            "FILE" | "FILES" => parse_file_operation(operation).map(Self::Files),
            "TABLE" | "TABLES" => parse_table_operation(operation),
            _ => Err(GateError::InvalidLoopType(collection.trim().to_string())),
        }
    }
}

fn parse_file_operation(operation: &str) -> GateResult<FileOperation> {
    let invalid = || GateError::InvalidLoopOperation {
        collection: "file",
        operation: operation.trim().to_string(),
    };

    match operation.trim().to_ascii_uppercase().as_str() {
        "CAT" | "READ" | "SHOW" => return Ok(FileOperation::Cat),
        "COUNT" | "LINES" => return Ok(FileOperation::Count),
        "SIZE" => return Ok(FileOperation::Size),
        _ => {}
    }

    let parsed = ParsedInstruction::parse(operation).map_err(|_| invalid())?;
    if is_package_manager(parsed.executable()) {
        return Err(invalid());
    }
    Ok(FileOperation::Command(parsed))
}

fn parse_table_operation(operation: &str) -> GateResult<LoopDirective> {
    let normalized = operation.replace(':', " ").to_ascii_uppercase();
    let words: Vec<&str> = normalized.split_whitespace().collect();
    let invalid = || GateError::InvalidLoopOperation {
        collection: "table",
        operation: operation.trim().to_string(),
    };

    let (op, rest) = words.split_first().ok_or_else(invalid)?;
    let operation = match *op {
        "SHOW" | "SELECT" => TableOperation::Show,
        "COUNT" => TableOperation::Count,
        "DESCRIBE" | "DESC" => TableOperation::Describe,
        _ => return Err(invalid()),
    };

    let limit = match rest {
        [] => None,
        ["LIMIT", value] => Some(
            value
                .parse::<u64>()
                .map_err(|_| GateError::InvalidLimit(value.to_string()))?,
        ),
        ["LIMIT", more @ ..] => return Err(GateError::InvalidLimit(more.join(" "))),
        _ => return Err(invalid()),
    };
    if limit.is_some() && operation != TableOperation::Show {
        debug!("LIMIT ignored for {operation:?}");
    }

    Ok(LoopDirective::Tables { operation, limit })
}

/// Runs loop directives against the sandbox and the session's database.
#[derive(Debug, Clone)]
pub struct LoopEngine {
    validator: CommandValidator,
    executor: ProcessExecutor,
    command_timeout: Duration,
}

impl LoopEngine {
    pub fn new(validator: CommandValidator, executor: ProcessExecutor, command_timeout: Duration) -> Self {
        Self {
            validator,
            executor,
            command_timeout,
        }
    }

    /// Parses and runs a loop in one step.
    pub async fn run(
        &self,
        collection: &str,
        operation: &str,
        cwd: &Path,
        db: &mut ConnectionManager,
    ) -> ExecutionResult {
        match LoopDirective::parse(collection, operation) {
            Ok(directive) => self.run_loop(&directive, cwd, db).await,
            Err(e) => e.into(),
        }
    }

    pub async fn run_loop(
        &self,
        directive: &LoopDirective,
        cwd: &Path,
        db: &mut ConnectionManager,
    ) -> ExecutionResult {
        let report = match directive {
            LoopDirective::Files(operation) => self.file_loop(operation, cwd).await,
            LoopDirective::Tables { operation, limit } => table_loop(*operation, *limit, db).await,
        };
        report.into()
    }

    // ── Files ────────────────────────────────────────────

    async fn file_loop(&self, operation: &FileOperation, cwd: &Path) -> GateResult<String> {
        if let FileOperation::Command(ref parsed) = operation {
            if !self.validator.registry().contains(parsed.executable()) {
                return Err(GateError::UnknownCommand(parsed.executable().to_string()));
            }
        }

        let files = list_files(cwd).await?;
        if files.is_empty() {
            return Err(GateError::EmptyCollection("files"));
        }
        info!("File loop over {} files: {operation:?}", files.len());

        let mut lines = Vec::with_capacity(files.len() + 1);
        let mut failed = 0;
        for name in &files {
            match self.file_step(operation, cwd, name).await {
                Ok(line) => lines.push(line),
                Err(reason) => {
                    warn!("Loop step failed for {name}: {reason}");
                    failed += 1;
                    lines.push(format!("{name}: error: {reason}"));
                }
            }
        }
        lines.push(summary(files.len(), "file", failed));
        Ok(lines.join("\n"))
    }

    async fn file_step(&self, operation: &FileOperation, cwd: &Path, name: &str) -> Result<String, String> {
        let path = cwd.join(name);
        match operation {
            FileOperation::Cat => {
                let content = read_head(&path, self.executor.max_output_bytes())
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(format!("=== {name} ===\n{content}"))
            }
            FileOperation::Count => {
                let lines = count_lines(&path).await.map_err(|e| e.to_string())?;
                Ok(format!("{name}: {}", plural(lines, "line")))
            }
            FileOperation::Size => {
                let meta = tokio::fs::metadata(&path).await.map_err(|e| e.to_string())?;
                Ok(format!("{name}: {}", format_size(meta.len())))
            }
            FileOperation::Command(parsed) => {
                let instruction = parsed.with_arg(name);
                match self.validator.validate(&instruction, cwd) {
                    Ok(Verdict::Command) => {}
                    Ok(_) => return Err(format!("'{}' cannot run in a loop", parsed.executable())),
                    Err(e) => return Err(e.to_string()),
                }
                let result = self.executor.run(&instruction, cwd, self.command_timeout).await;
                if result.success {
                    Ok(format!("=== {name} ===\n{}", result.output))
                } else {
                    Err(result.output)
                }
            }
        }
    }
}

/// Up to `cap` bytes of the file as text, invalid UTF-8 replaced, with the
/// truncation marker when the file is longer.
async fn read_head(path: &Path, cap: usize) -> std::io::Result<String> {
    let file = tokio::fs::File::open(path).await?;
    let mut kept = Vec::new();
    file.take(cap as u64 + 1).read_to_end(&mut kept).await?;

    let truncated = kept.len() > cap;
    kept.truncate(cap);
    let mut text = String::from_utf8_lossy(&kept).trim_end().to_string();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    Ok(text)
}

/// Newline count, plus one for an unterminated last line. Works on any
/// encoding and never holds the whole file in memory.
async fn count_lines(path: &Path) -> std::io::Result<usize> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; 8192];
    let mut lines = 0;
    let mut last = b'\n';
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        lines += buf[..n].iter().filter(|&&b| b == b'\n').count();
        last = buf[n - 1];
    }
    if last != b'\n' {
        lines += 1;
    }
    Ok(lines)
}

/// Regular files directly under `dir`, sorted by name. Symlinks and
/// directories are skipped.
async fn list_files(dir: &Path) -> GateResult<Vec<String>> {
    let io_error = |e: std::io::Error| GateError::Spawn {
        command: "list files".to_string(),
        reason: e.to_string(),
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_error)?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
        let file_type = entry.file_type().await.map_err(io_error)?;
        if file_type.is_file() {
            files.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    files.sort();
    Ok(files)
}

// ── Tables ───────────────────────────────────────────────

async fn table_loop(
    operation: TableOperation,
    limit: Option<u64>,
    db: &mut ConnectionManager,
) -> GateResult<String> {
    let conn = db.ensure_live().await?;
    let tables = conn
        .list_tables()
        .await
        .map_err(|e| GateError::DatabaseError {
            statement: "SHOW TABLES".to_string(),
            reason: e.to_string(),
        })?;
    if tables.is_empty() {
        return Err(GateError::EmptyCollection("tables"));
    }
    info!("Table loop over {} tables: {operation:?}", tables.len());

    let mut lines = Vec::with_capacity(tables.len() + 1);
    let mut failed = 0;
    for table in &tables {
        let quoted = conn.quote_ident(table);
        let step = match operation {
            TableOperation::Show => {
                let sql = match limit {
                    Some(n) => format!("SELECT * FROM {quoted} LIMIT {n}"),
                    None => format!("SELECT * FROM {quoted}"),
                };
                conn.fetch(&sql).await.map(|rows| {
                    if rows.is_empty() {
                        format!("=== {table} ===\n(no rows)")
                    } else {
                        format!("=== {table} ===\n{}", render_table(&rows))
                    }
                })
            }
            TableOperation::Count => conn
                .fetch(&format!("SELECT COUNT(*) FROM {quoted}"))
                .await
                .and_then(|rows| {
                    let count = rows.first_column().into_iter().next().unwrap_or_default();
                    let count: usize = count
                        .trim()
                        .parse()
                        .map_err(|_| anyhow!("unexpected row count '{count}'"))?;
                    Ok(format!("{table}: {}", plural(count, "row")))
                }),
            TableOperation::Describe => conn
                .describe_table(table)
                .await
                .map(|rows| format!("=== {table} ===\n{}", render_table(&rows))),
        };

        match step {
            Ok(line) => lines.push(line),
            Err(e) => {
                warn!("Loop step failed for table {table}: {e}");
                failed += 1;
                lines.push(format!("{table}: error: {e}"));
            }
        }
    }
    lines.push(summary(tables.len(), "table", failed));
    Ok(lines.join("\n"))
}

fn summary(total: usize, noun: &str, failed: usize) -> String {
    if failed == 0 {
        format!("Processed {}", plural(total, noun))
    } else {
        format!("Processed {} ({failed} failed)", plural(total, noun))
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes}B")
    } else if bytes < 1024 * 1024 {
        format!("{}KB", bytes / 1024)
    } else {
        format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecConfig;
    use crate::db::fake::{FakeConnector, FakeServer};
    use crate::db::{BackendKind, ConnectionConfig, ManagerSettings};
    use crate::rules::RuleRegistry;
    use crate::sandbox::Sandbox;
    use std::fs;
    use std::sync::Arc;

    fn engine(dir: &Path) -> LoopEngine {
        engine_with(dir, &ExecConfig::default())
    }

    fn engine_with(dir: &Path, config: &ExecConfig) -> LoopEngine {
        let sandbox = Sandbox::open(dir).unwrap();
        let executor = ProcessExecutor::new(config, sandbox.root());
        let validator = CommandValidator::new(RuleRegistry::builtin(), sandbox);
        LoopEngine::new(validator, executor, Duration::from_secs(5))
    }

    fn two_files() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), "1\n2\n3").unwrap();
        fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/c.txt"), "ignored").unwrap();
        dir
    }

    fn manager(server: &Arc<FakeServer>) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(FakeConnector::new(server.clone())),
            ManagerSettings {
                connect_timeout: Duration::from_secs(2),
                reconnect_attempts: 1,
                reconnect_delay: Duration::from_millis(1),
                show_progress: false,
            },
        )
    }

    async fn connected(server: &Arc<FakeServer>) -> ConnectionManager {
        let mut mgr = manager(server);
        mgr.connect(ConnectionConfig {
            backend: BackendKind::MySql,
            host: "db".to_string(),
            port: None,
            user: "root".to_string(),
            password: "x".to_string(),
            database: Some("shop".to_string()),
            options: Default::default(),
        })
        .await
        .unwrap();
        mgr
    }

    // ── Parsing ──────────────────────────────────────────

    #[test]
    fn test_parse_file_operations() {
        assert_eq!(
            LoopDirective::parse("FILE", "count").unwrap(),
            LoopDirective::Files(FileOperation::Count)
        );
        assert_eq!(
            LoopDirective::parse("file", "CAT").unwrap(),
            LoopDirective::Files(FileOperation::Cat)
        );
        match LoopDirective::parse("FILE", "wc -l").unwrap() {
            LoopDirective::Files(FileOperation::Command(parsed)) => {
                assert_eq!(parsed.executable(), "wc");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_table_limit() {
        assert_eq!(
            LoopDirective::parse("TABLE", "SHOW:LIMIT:5").unwrap(),
            LoopDirective::Tables {
                operation: TableOperation::Show,
                limit: Some(5)
            }
        );
        assert_eq!(
            LoopDirective::parse("TABLE", "count limit 3").unwrap(),
            LoopDirective::Tables {
                operation: TableOperation::Count,
                limit: Some(3)
            }
        );
    }

    #[test]
    fn test_parse_rejections() {
        assert!(matches!(
            LoopDirective::parse("TABLE", "SHOW LIMIT abc"),
            Err(GateError::InvalidLimit(ref v)) if v == "ABC"
        ));
        assert!(matches!(
            LoopDirective::parse("TABLE", "SHOW LIMIT -1"),
            Err(GateError::InvalidLimit(_))
        ));
        assert!(matches!(
            LoopDirective::parse("TABLE", "DROP"),
            Err(GateError::InvalidLoopOperation { collection: "table", .. })
        ));
        assert!(matches!(
            LoopDirective::parse("FILE", "pip install numpy"),
            Err(GateError::InvalidLoopOperation { collection: "file", .. })
        ));
        assert!(matches!(
            LoopDirective::parse("FILE", ""),
            Err(GateError::InvalidLoopOperation { .. })
        ));
        assert!(matches!(
            LoopDirective::parse("USERS", "COUNT"),
            Err(GateError::InvalidLoopType(ref t)) if t == "USERS"
        ));
    }

    // ── File loops ───────────────────────────────────────

    #[tokio::test]
    async fn test_file_count_reports_each_file() {
        let dir = two_files();
        let engine = engine(dir.path());
        let mut db = manager(&FakeServer::new());

        let result = engine.run("FILE", "COUNT", dir.path(), &mut db).await;
        assert!(result.success);
        assert_eq!(
            result.output,
            "a.txt: 2 lines\nb.txt: 3 lines\nProcessed 2 files"
        );
    }

    #[tokio::test]
    async fn test_file_count_is_idempotent() {
        let dir = two_files();
        let engine = engine(dir.path());
        let mut db = manager(&FakeServer::new());

        let first = engine.run("FILE", "COUNT", dir.path(), &mut db).await;
        let second = engine.run("FILE", "COUNT", dir.path(), &mut db).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_file_cat_and_size() {
        let dir = two_files();
        let engine = engine(dir.path());
        let mut db = manager(&FakeServer::new());

        let cat = engine.run("FILE", "CAT", dir.path(), &mut db).await;
        assert!(cat.output.starts_with("=== a.txt ===\none\ntwo\n=== b.txt ==="));

        let size = engine.run("FILE", "SIZE", dir.path(), &mut db).await;
        assert!(size.output.contains("a.txt: 8B"));
        assert!(size.output.contains("b.txt: 5B"));
    }

    #[tokio::test]
    async fn test_file_count_and_cat_non_utf8() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("latin1.log"), b"caf\xe9\nna\xefve\n").unwrap();
        let engine = engine(dir.path());
        let mut db = manager(&FakeServer::new());

        let count = engine.run("FILE", "COUNT", dir.path(), &mut db).await;
        assert_eq!(count.output, "latin1.log: 2 lines\nProcessed 1 file");

        let cat = engine.run("FILE", "CAT", dir.path(), &mut db).await;
        assert_eq!(
            cat.output,
            "=== latin1.log ===\ncaf\u{FFFD}\nna\u{FFFD}ve\nProcessed 1 file"
        );
    }

    #[tokio::test]
    async fn test_file_cat_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("big.txt"), "x".repeat(10_000)).unwrap();
        let config = ExecConfig {
            max_output_bytes: 100,
            ..ExecConfig::default()
        };
        let mut db = manager(&FakeServer::new());

        let result = engine_with(dir.path(), &config)
            .run("FILE", "CAT", dir.path(), &mut db)
            .await;
        assert!(result.success);
        let body = result.output.lines().nth(1).unwrap();
        assert_eq!(body, "x".repeat(100));
        assert!(result.output.contains("[output truncated]"));
    }

    #[tokio::test]
    async fn test_count_lines_edge_cases() {
        let dir = tempfile::tempdir().unwrap();
        for (name, content, expected) in [
            ("empty", "", 0),
            ("one-terminated", "a\n", 1),
            ("one-open", "a", 1),
            ("blank-lines", "\n\n\n", 3),
        ] {
            let path = dir.path().join(name);
            fs::write(&path, content).unwrap();
            assert_eq!(count_lines(&path).await.unwrap(), expected, "{name}");
        }
    }

    #[tokio::test]
    async fn test_file_command_runs_per_file() {
        let dir = two_files();
        let engine = engine(dir.path());
        let mut db = manager(&FakeServer::new());

        let result = engine.run("FILE", "head -n 1", dir.path(), &mut db).await;
        assert!(result.success, "{}", result.output);
        assert!(result.output.contains("=== a.txt ===\none"));
        assert!(result.output.contains("=== b.txt ===\n1"));
    }

    #[tokio::test]
    async fn test_file_command_failures_are_inline() {
        let dir = two_files();
        let engine = engine(dir.path());
        let mut db = manager(&FakeServer::new());

        let result = engine.run("FILE", "cat -A", dir.path(), &mut db).await;
        assert!(result.success);
        assert!(result.output.contains("a.txt: error: Invalid flags for 'cat': -A"));
        assert!(result.output.ends_with("Processed 2 files (2 failed)"));
    }

    #[tokio::test]
    async fn test_file_command_unknown_rejected_up_front() {
        let dir = two_files();
        let engine = engine(dir.path());
        let mut db = manager(&FakeServer::new());

        let result = engine.run("FILE", "rm", dir.path(), &mut db).await;
        assert!(!result.success);
        assert_eq!(result.output, "Command 'rm' is not allowed");
        assert!(dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let mut db = manager(&FakeServer::new());

        let result = engine.run("FILE", "COUNT", dir.path(), &mut db).await;
        assert!(!result.success);
        assert_eq!(result.output, "No files found to loop over");
    }

    // ── Table loops ──────────────────────────────────────

    #[tokio::test]
    async fn test_table_count() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeServer::new();
        server.add_table("orders", &["id"], &[&["1"]]);
        server.add_table("users", &["id", "name"], &[&["1", "alice"], &["2", "bob"]]);
        let mut db = connected(&server).await;

        let result = engine(dir.path()).run("TABLE", "COUNT", dir.path(), &mut db).await;
        assert!(result.success, "{}", result.output);
        assert_eq!(
            result.output,
            "orders: 1 row\nusers: 2 rows\nProcessed 2 tables"
        );
    }

    #[tokio::test]
    async fn test_table_count_unreadable_is_inline_error() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeServer::new();
        server.add_table("users", &["id"], &[&["1"]]);
        server.add_table("weird", &["id"], &[]);
        server.set_count_override("weird", "n/a");
        let mut db = connected(&server).await;

        let result = engine(dir.path()).run("TABLE", "COUNT", dir.path(), &mut db).await;
        assert!(result.success);
        assert_eq!(
            result.output,
            "users: 1 row\nweird: error: unexpected row count 'n/a'\nProcessed 2 tables (1 failed)"
        );
    }

    #[tokio::test]
    async fn test_table_show_applies_limit() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeServer::new();
        server.add_table("users", &["id", "name"], &[&["1", "alice"], &["2", "bob"]]);
        let mut db = connected(&server).await;

        let result = engine(dir.path())
            .run("TABLE", "SHOW LIMIT 1", dir.path(), &mut db)
            .await;
        assert!(result.success);
        assert!(result.output.contains("alice"));
        assert!(!result.output.contains("bob"));
    }

    #[tokio::test]
    async fn test_table_describe() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeServer::new();
        server.add_table("users", &["id", "name"], &[]);
        let mut db = connected(&server).await;

        let result = engine(dir.path()).run("TABLE", "DESCRIBE", dir.path(), &mut db).await;
        assert!(result.output.starts_with("=== users ===\nField | Type"));
    }

    #[tokio::test]
    async fn test_table_loop_requires_connection() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = manager(&FakeServer::new());

        let result = engine(dir.path()).run("TABLE", "COUNT", dir.path(), &mut db).await;
        assert!(!result.success);
        assert_eq!(result.output, GateError::NotConnected.to_string());
    }

    #[tokio::test]
    async fn test_no_tables() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeServer::new();
        let mut db = connected(&server).await;

        let result = engine(dir.path()).run("TABLE", "SHOW", dir.path(), &mut db).await;
        assert!(!result.success);
        assert_eq!(result.output, "No tables found to loop over");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(500), "500B");
        assert_eq!(format_size(2048), "2KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0MB");
    }
}
