//! Process executor.
//!
//! Runs one validated instruction as one child process: argument vector
//! passed as-is (no shell), cleared environment, fixed working directory
//! and a hard wall-clock timeout after which the child is killed.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ExecConfig;
use crate::error::{GateError, GateResult};
use crate::outcome::ExecutionResult;
use crate::rules::packages::AllowedPackage;
use crate::rules::ParsedInstruction;

pub(crate) const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Raw outcome of a finished child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Trimmed stdout on success, trimmed stderr otherwise.
    pub fn into_result(self) -> ExecutionResult {
        if self.success() {
            return ExecutionResult::ok(self.stdout.trim());
        }
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            match self.exit_code {
                Some(code) => ExecutionResult::failed(format!("Command exited with status {code}")),
                None => ExecutionResult::failed("Command was terminated by a signal"),
            }
        } else {
            ExecutionResult::failed(stderr)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    path: String,
    home: PathBuf,
    python: String,
    max_output_bytes: usize,
    verify_timeout: Duration,
}

impl ProcessExecutor {
    /// `home` is exported as HOME so tools that insist on one stay inside
    /// the sandbox.
    pub fn new(config: &ExecConfig, home: &Path) -> Self {
        Self {
            path: config.path.clone(),
            home: home.to_path_buf(),
            python: config.python.clone(),
            max_output_bytes: config.max_output_bytes,
            verify_timeout: config.command_timeout(),
        }
    }

    /// Runs `parsed` in `cwd` and maps the exit status onto a result.
    pub async fn run(
        &self,
        parsed: &ParsedInstruction,
        cwd: &Path,
        timeout: Duration,
    ) -> ExecutionResult {
        match self.spawn(parsed, cwd, timeout).await {
            Ok(output) => output.into_result(),
            Err(e) => e.into(),
        }
    }

    /// Runs a package install, then proves each package imports.
    ///
    /// A failed verification turns the result into a failure but leaves the
    /// install in place.
    pub async fn run_install(
        &self,
        parsed: &ParsedInstruction,
        packages: &[AllowedPackage],
        cwd: &Path,
        timeout: Duration,
    ) -> ExecutionResult {
        let installed = self.run(parsed, cwd, timeout).await;
        if !installed.success {
            return installed;
        }

        let mut report = installed.output;
        for package in packages {
            match self.verify_package(package, cwd).await {
                Ok(version) => {
                    info!("Verified {} {version}", package.name);
                    report.push_str(&format!("\nVerified {} {version}", package.name));
                }
                Err(reason) => {
                    warn!("Verification of {} failed: {reason}", package.name);
                    report.push_str(&format!(
                        "\nInstalled but failed to verify {}: {reason}",
                        package.name
                    ));
                    return ExecutionResult::failed(report);
                }
            }
        }
        ExecutionResult::ok(report)
    }

    /// Imports the package's module and returns its reported version.
    pub async fn verify_package(&self, package: &AllowedPackage, cwd: &Path) -> GateResult<String> {
        let script = format!(
            "import {m}; print(getattr({m}, '__version__', 'unknown'))",
            m = package.module
        );
        let parsed =
            ParsedInstruction::from_parts(self.python.clone(), vec!["-c".to_string(), script]);
        let output = self.spawn(&parsed, cwd, self.verify_timeout).await?;
        if output.success() {
            Ok(output.stdout.trim().to_string())
        } else {
            Err(GateError::Spawn {
                command: format!("import {}", package.module),
                reason: output.stderr.trim().to_string(),
            })
        }
    }

    /// Spawns exactly one child and waits for it, killing it on timeout.
    ///
    /// The child leads its own process group. Waiting for it and draining
    /// its pipes share one deadline. The whole group is killed once the
    /// child exits or the deadline passes.
    pub async fn spawn(
        &self,
        parsed: &ParsedInstruction,
        cwd: &Path,
        timeout: Duration,
    ) -> GateResult<ProcessOutput> {
        info!("Executing: {} (in {})", parsed.display(), cwd.display());

        let mut command = Command::new(parsed.executable());
        command
            .args(parsed.args())
            .current_dir(cwd)
            .env_clear()
            .env("PATH", &self.path)
            .env("HOME", &self.home)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| GateError::Spawn {
            command: parsed.executable().to_string(),
            reason: e.to_string(),
        })?;
        let group = child.id();

        let cap = self.max_output_bytes;
        let mut stdout_task = child.stdout.take().map(|s| tokio::spawn(read_capped(s, cap)));
        let mut stderr_task = child.stderr.take().map(|s| tokio::spawn(read_capped(s, cap)));

        let collected = tokio::time::timeout(timeout, async {
            let status = child.wait().await?;
            kill_process_group(group);
            let stdout = join_reader(&mut stdout_task).await;
            let stderr = join_reader(&mut stderr_task).await;
            Ok::<_, std::io::Error>((status, stdout, stderr))
        })
        .await;

        match collected {
            Ok(Ok((status, stdout, stderr))) => {
                debug!("exit={:?} stdout={stdout:?} stderr={stderr:?}", status.code());
                Ok(ProcessOutput {
                    stdout,
                    stderr,
                    exit_code: status.code(),
                })
            }
            Ok(Err(e)) => {
                kill_process_group(group);
                Err(GateError::Spawn {
                    command: parsed.executable().to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!(
                    "'{}' exceeded {}s, killing it",
                    parsed.display(),
                    timeout.as_secs_f32()
                );
                kill_process_group(group);
                if let Err(e) = child.kill().await {
                    debug!("Killing timed-out child: {e}");
                }
                for task in [stdout_task, stderr_task].into_iter().flatten() {
                    task.abort();
                }
                Err(GateError::TimedOut(timeout))
            }
        }
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }
}

async fn join_reader(task: &mut Option<JoinHandle<String>>) -> String {
    match task {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}

/// SIGKILLs every process left in the group led by `pgid`.
#[cfg(unix)]
fn kill_process_group(pgid: Option<u32>) {
    let Some(pgid) = pgid else { return };
    let Ok(pgid) = libc::pid_t::try_from(pgid) else { return };
    // SAFETY: killpg only sends a signal to the group created for this child
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            debug!("killpg({pgid}) failed: {err}");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: Option<u32>) {}

/// Reads a pipe to EOF, keeping at most `cap` bytes. The rest is drained so
/// the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> String {
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];
    let mut truncated = false;

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
            Err(e) => {
                debug!("pipe read error: {e}");
                break;
            }
        }
    }

    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(dir: &Path) -> ProcessExecutor {
        ProcessExecutor::new(&ExecConfig::default(), dir)
    }

    fn parse(line: &str) -> ParsedInstruction {
        ParsedInstruction::parse(line).unwrap()
    }

    #[tokio::test]
    async fn test_zero_exit_returns_trimmed_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let result = executor(dir.path())
            .run(&parse("echo '  hello  '"), dir.path(), Duration::from_secs(5))
            .await;
        assert!(result.success);
        assert_eq!(result.output, "hello");
    }

    #[tokio::test]
    async fn test_non_zero_exit_returns_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let output = exec
            .spawn(&parse("ls no-such-file"), dir.path(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!output.success());
        assert_ne!(output.exit_code, Some(0));

        let result = output.into_result();
        assert!(!result.success);
        assert!(result.output.contains("no-such-file"));
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        let result = executor(dir.path())
            .run(&parse("sleep 5"), dir.path(), Duration::from_millis(300))
            .await;
        assert!(!result.success);
        assert!(result.output.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_timeout_is_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = executor(dir.path())
            .spawn(&parse("sleep 5"), dir.path(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::TimedOut(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_grandchild_does_not_outlive_command() {
        let dir = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        let result = executor(dir.path())
            .run(
                &parse("python3 -c \"import subprocess; subprocess.Popen(['sleep', '6'])\""),
                dir.path(),
                Duration::from_secs(1),
            )
            .await;
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
        assert!(result.success, "{}", result.output);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_bounds_output_collection() {
        let dir = tempfile::tempdir().unwrap();
        // The child keeps running past the deadline while holding the pipes
        let started = std::time::Instant::now();
        let err = executor(dir.path())
            .spawn(
                &parse("python3 -c \"import subprocess, time; subprocess.Popen(['sleep', '6']); time.sleep(6)\""),
                dir.path(),
                Duration::from_millis(500),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn test_runs_in_given_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let result = executor(dir.path())
            .run(&parse("ls"), dir.path(), Duration::from_secs(5))
            .await;
        assert!(result.success);
        assert!(result.output.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_environment_is_minimal() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("AGENT_GATE_TEST_SECRET", "hunter2");
        let result = executor(dir.path())
            .run(&parse("env"), dir.path(), Duration::from_secs(5))
            .await;
        assert!(result.success);
        assert!(!result.output.contains("hunter2"));
        assert!(result.output.contains("PATH="));
    }

    #[tokio::test]
    async fn test_arguments_are_not_shell_interpreted() {
        let dir = tempfile::tempdir().unwrap();
        let result = executor(dir.path())
            .run(&parse("echo '$(whoami)' ';' ls"), dir.path(), Duration::from_secs(5))
            .await;
        assert_eq!(result.output, "$(whoami) ; ls");
    }

    #[tokio::test]
    async fn test_missing_executable_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = executor(dir.path())
            .spawn(&parse("no-such-binary-xyz"), dir.path(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(10_000)).unwrap();
        let config = ExecConfig {
            max_output_bytes: 100,
            ..ExecConfig::default()
        };
        let result = ProcessExecutor::new(&config, dir.path())
            .run(&parse("cat big.txt"), dir.path(), Duration::from_secs(5))
            .await;
        assert!(result.success);
        assert!(result.output.ends_with("[output truncated]"));
        assert!(result.output.len() < 200);
    }

    #[tokio::test]
    async fn test_verification_failure_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExecConfig {
            python: "no-such-python-xyz".to_string(),
            ..ExecConfig::default()
        };
        let exec = ProcessExecutor::new(&config, dir.path());
        let package = AllowedPackage { name: "rich", module: "rich" };
        assert!(exec.verify_package(&package, dir.path()).await.is_err());

        // The install step itself succeeds (echo stands in for pip)
        let result = exec
            .run_install(&parse("echo installed"), &[package], dir.path(), Duration::from_secs(5))
            .await;
        assert!(!result.success);
        assert!(result.output.starts_with("installed"));
        assert!(result.output.contains("failed to verify rich"));
    }
}
