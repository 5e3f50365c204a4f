//! External command execution.
//!
//! All heavy lifting in this pipeline (make, apk, tar, xorriso) is done by
//! external tools. `Cmd` is a thin builder over `std::process::Command`
//! that captures output, attaches a human-readable error message, and
//! rewrites known resource-exhaustion failures into actionable errors.

use anyhow::{bail, Context, Result};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Captured output of a successful command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Known build-failure substrings and the actionable hint for each.
///
/// Build tools bury these in megabytes of output; scanning for them turns
/// a generic "make failed" into a specific remediation.
const EXHAUSTION_PATTERNS: &[(&str, &str)] = &[
    (
        "No space left on device",
        "disk full - free space in the working directory or point --workdir at a larger volume",
    ),
    (
        "Cannot allocate memory",
        "out of memory - re-run with --use-swap or lower --jobs",
    ),
    (
        "virtual memory exhausted",
        "out of memory - re-run with --use-swap or lower --jobs",
    ),
    (
        "internal compiler error: Killed",
        "compiler killed (likely OOM) - re-run with --use-swap or lower --jobs",
    ),
    (
        "Killed signal terminated program",
        "compiler killed (likely OOM) - re-run with --use-swap or lower --jobs",
    ),
];

/// Scan command output for known resource-exhaustion signatures.
///
/// Returns the remediation hint for the first matching pattern.
pub fn classify_failure_output(output: &str) -> Option<&'static str> {
    EXHAUSTION_PATTERNS
        .iter()
        .find(|(needle, _)| output.contains(needle))
        .map(|(_, hint)| *hint)
}

/// Builder for external command invocations.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
    error_msg: Option<String>,
    stdin_data: Option<Vec<u8>>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            envs: Vec::new(),
            error_msg: None,
            stdin_data: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Message used when the command fails. Should name the remedy
    /// (missing package, expected precondition).
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Bytes written to the child's stdin.
    ///
    /// The channel for anything that must not appear in the argv or pass
    /// through a shell, such as credentials.
    pub fn stdin_bytes(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin_data = Some(data.into());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd
    }

    fn describe(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    /// Run the command, capturing stdout/stderr.
    pub fn run(self) -> Result<CmdOutput> {
        let output = match &self.stdin_data {
            None => self
                .command()
                .output()
                .with_context(|| format!("failed to spawn '{}'", self.describe()))?,
            Some(data) => {
                let mut child = self
                    .command()
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()
                    .with_context(|| format!("failed to spawn '{}'", self.describe()))?;
                {
                    let mut stdin = child
                        .stdin
                        .take()
                        .with_context(|| format!("opening stdin of '{}'", self.program))?;
                    stdin
                        .write_all(data)
                        .with_context(|| format!("writing stdin of '{}'", self.program))?;
                }
                child
                    .wait_with_output()
                    .with_context(|| format!("collecting output of '{}'", self.describe()))?
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() {
            return Ok(CmdOutput { stdout, stderr });
        }

        Err(self.failure_error(&stdout, &stderr, output.status.code()))
    }

    /// Run the command with inherited stdio.
    ///
    /// Used for long-running builds where the user should see progress.
    /// Output cannot be scanned in this mode; callers that need the
    /// exhaustion classifier should use `run()`.
    pub fn run_interactive(self) -> Result<()> {
        let status = self
            .command()
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| format!("failed to spawn '{}'", self.describe()))?;

        if status.success() {
            return Ok(());
        }

        let msg = self
            .error_msg
            .clone()
            .unwrap_or_else(|| format!("command failed: {}", self.describe()));
        bail!("{} (exit code {:?})", msg, status.code());
    }

    /// Run the command with a wall-clock timeout.
    ///
    /// Only the upstream release probe uses this; every other external
    /// command runs to completion or fails outright. Both pipes are
    /// drained in the background so a child that writes more than the
    /// pipe buffer cannot wedge before the deadline check sees it exit.
    pub fn run_with_timeout(self, timeout: Duration) -> Result<CmdOutput> {
        let mut child = self
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", self.describe()))?;

        let stdout_drain = child.stdout.take().map(drain_pipe);
        let stderr_drain = child.stderr.take().map(drain_pipe);

        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait()? {
                Some(status) => {
                    let stdout = collect_drained(stdout_drain);
                    let stderr = collect_drained(stderr_drain);
                    if status.success() {
                        return Ok(CmdOutput { stdout, stderr });
                    }
                    return Err(self.failure_error(&stdout, &stderr, status.code()));
                }
                None => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        bail!(
                            "'{}' timed out after {}s",
                            self.describe(),
                            timeout.as_secs()
                        );
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    fn failure_error(&self, stdout: &str, stderr: &str, code: Option<i32>) -> anyhow::Error {
        let msg = self
            .error_msg
            .clone()
            .unwrap_or_else(|| format!("command failed: {}", self.describe()));

        let combined = format!("{}\n{}", stdout, stderr);
        if let Some(hint) = classify_failure_output(&combined) {
            return anyhow::anyhow!("{}\n  Detected: {}", msg, hint);
        }

        let tail: Vec<&str> = stderr.lines().rev().take(10).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        anyhow::anyhow!(
            "{} (exit code {:?})\n{}",
            msg,
            code,
            tail.join("\n")
        )
    }
}

/// Read a child pipe to completion on a background thread.
fn drain_pipe<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn collect_drained(handle: Option<std::thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// Fail with a clear message when an expected path is missing.
pub fn ensure_exists(path: &Path, label: &str) -> Result<()> {
    if !path.exists() {
        bail!("{} not found at {}", label, path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_captures_stdout() {
        let out = Cmd::new("echo").arg("hello").run().unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn run_reports_error_msg_on_failure() {
        let err = Cmd::new("false")
            .error_msg("sentinel failed")
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("sentinel failed"));
    }

    #[test]
    fn classify_detects_oom() {
        let hint = classify_failure_output("cc1: internal compiler error: Killed");
        assert!(hint.unwrap().contains("OOM"));
        assert!(classify_failure_output("ordinary error").is_none());
    }

    #[test]
    fn classify_detects_disk_full() {
        let hint = classify_failure_output("write: No space left on device");
        assert!(hint.unwrap().contains("disk full"));
    }

    #[test]
    fn timeout_kills_slow_command() {
        let err = Cmd::new("sleep")
            .arg("5")
            .run_with_timeout(Duration::from_millis(100))
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn stdin_bytes_reach_child_verbatim() {
        // Quotes and shell metacharacters must survive untouched; stdin
        // is the channel for credentials precisely because no shell or
        // argv ever sees them.
        let payload = "root:it's;$(reboot)|&\n";
        let out = Cmd::new("cat").stdin_bytes(payload).run().unwrap();
        assert_eq!(out.stdout, payload);
    }

    #[test]
    fn timeout_survives_output_larger_than_pipe_buffer() {
        // 200 KB exceeds the default 64 KB pipe buffer; without a
        // background drain the child blocks on write and the run is
        // misreported as a timeout.
        let out = Cmd::new("sh")
            .args(["-c", "yes x | head -c 200000"])
            .run_with_timeout(Duration::from_secs(10))
            .unwrap();
        assert_eq!(out.stdout.len(), 200000);
    }

    #[test]
    fn ensure_exists_rejects_missing() {
        assert!(ensure_exists(Path::new("/definitely/not/here"), "thing").is_err());
    }
}
