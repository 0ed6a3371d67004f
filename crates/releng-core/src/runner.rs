//! External command execution with output classification and timeouts.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::matcher::ErrorMatcher;
use crate::obs;
use crate::severity::Severity;

/// Exit-code sentinel for a command that could not be started.
pub const SPAWN_FAILED_CODE: i32 = -1001;

/// Exit-code sentinel for a command killed after its output timeout.
pub const TIMED_OUT_CODE: i32 = -1002;

/// A command to run.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Overlay on the ambient environment; overlay wins on conflict.
    pub env: BTreeMap<String, String>,
    pub rules: ErrorMatcher,
    /// Kill the command if no output arrives for this long.
    pub output_timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.env.insert(k.into(), v.into());
        }
        self
    }

    pub fn rules(mut self, rules: ErrorMatcher) -> Self {
        self.rules = rules;
        self
    }

    pub fn output_timeout_secs(mut self, secs: u64) -> Self {
        self.output_timeout = if secs > 0 {
            Some(Duration::from_secs(secs))
        } else {
            None
        };
        self
    }

    /// Shell-ish rendering for logs.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// An output line that a rule classified at some severity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineMatch {
    pub stream: OutputStream,
    pub line: String,
    pub severity: Severity,
}

/// How a command ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandStatus {
    Exited { code: i32 },
    /// Nothing ran because the runner is in noop mode.
    Noop,
    TimedOut { after_secs: u64 },
    SpawnFailed { reason: String },
}

impl CommandStatus {
    /// Whether the caller should treat the command as successful.
    pub fn success(&self) -> bool {
        matches!(self, CommandStatus::Exited { code: 0 } | CommandStatus::Noop)
    }

    /// Numeric form. Noop reports `0`; failures to run report a sentinel.
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandStatus::Exited { code } => *code,
            CommandStatus::Noop => 0,
            CommandStatus::TimedOut { .. } => TIMED_OUT_CODE,
            CommandStatus::SpawnFailed { .. } => SPAWN_FAILED_CODE,
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandStatus::Exited { code } => write!(f, "exited with code {code}"),
            CommandStatus::Noop => f.write_str("skipped (noop)"),
            CommandStatus::TimedOut { after_secs } => {
                write!(f, "timed out after {after_secs}s without output")
            }
            CommandStatus::SpawnFailed { reason } => write!(f, "failed to start: {reason}"),
        }
    }
}

/// Result of [`CommandRunner::run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub command: String,
    pub status: CommandStatus,
    pub duration_ms: u64,
    /// Lines escalated by the command's rules, in arrival order.
    pub matches: Vec<LineMatch>,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    /// Worst severity seen in classified output. Advisory only.
    pub fn worst(&self) -> Option<Severity> {
        self.matches.iter().map(|m| m.severity).max()
    }
}

/// Result of [`CommandRunner::capture_output`].
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub status: CommandStatus,
    pub text: String,
}

/// Runs external commands, or pretends to when in noop mode.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    noop: bool,
}

impl CommandRunner {
    pub fn new(noop: bool) -> Self {
        Self { noop }
    }

    /// Run a command, classifying each output line against its rules.
    ///
    /// Never fails: spawn failures and timeouts are reported in the
    /// returned status and logged at error.
    pub async fn run(&self, spec: &CommandSpec) -> CommandOutcome {
        let command = spec.display();
        if self.noop {
            debug!(command = %command, cwd = ?spec.cwd, "noop: would run command");
            return CommandOutcome {
                command,
                status: CommandStatus::Noop,
                duration_ms: 0,
                matches: Vec::new(),
            };
        }

        let start = Instant::now();
        let mut matches = Vec::new();
        let status = execute(spec, |stream, line| {
            match spec.rules.classify(&line).and_then(|level| level.severity()) {
                Some(severity) => {
                    obs::emit_line_matched(&command, severity, &line);
                    matches.push(LineMatch {
                        stream,
                        line,
                        severity,
                    });
                }
                None => debug!(command = %command, "{}", line),
            }
        })
        .await;

        log_failure(&command, &status);
        CommandOutcome {
            command,
            status,
            duration_ms: start.elapsed().as_millis() as u64,
            matches,
        }
    }

    /// Run a command and return its stdout. Rules are not applied.
    ///
    /// On a nonzero exit the stderr text is logged at error and whatever
    /// stdout was produced is still returned.
    pub async fn capture_output(&self, spec: &CommandSpec) -> CapturedOutput {
        let command = spec.display();
        if self.noop {
            debug!(command = %command, cwd = ?spec.cwd, "noop: would capture command output");
            return CapturedOutput {
                status: CommandStatus::Noop,
                text: String::new(),
            };
        }

        let mut stdout = String::new();
        let mut stderr = String::new();
        let status = execute(spec, |stream, line| {
            let buf = match stream {
                OutputStream::Stdout => &mut stdout,
                OutputStream::Stderr => &mut stderr,
            };
            buf.push_str(&line);
            buf.push('\n');
        })
        .await;

        log_failure(&command, &status);
        if matches!(status, CommandStatus::Exited { code } if code != 0) && !stderr.is_empty() {
            error!(command = %command, stderr = %stderr.trim_end(), "Command wrote to stderr");
        }
        CapturedOutput {
            status,
            text: stdout,
        }
    }
}

fn log_failure(command: &str, status: &CommandStatus) {
    match status {
        CommandStatus::SpawnFailed { .. } | CommandStatus::TimedOut { .. } => {
            error!(command = %command, status = %status, "Command did not complete");
        }
        CommandStatus::Exited { code } if *code != 0 => {
            warn!(command = %command, exit_code = code, "Command exited nonzero");
        }
        _ => {}
    }
}

/// Spawn the command and feed every line to `on_line` in arrival order.
async fn execute<F>(spec: &CommandSpec, mut on_line: F) -> CommandStatus
where
    F: FnMut(OutputStream, String),
{
    let Some((exe, args)) = spec.argv.split_first() else {
        return CommandStatus::SpawnFailed {
            reason: "empty command".to_string(),
        };
    };

    let mut cmd = Command::new(exe);
    cmd.args(args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        if !cwd.is_dir() {
            return CommandStatus::SpawnFailed {
                reason: format!("working directory {} does not exist", cwd.display()),
            };
        }
        cmd.current_dir(cwd);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return CommandStatus::SpawnFailed {
                reason: format!("{exe}: {e}"),
            }
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(forward_lines(stdout, OutputStream::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(forward_lines(stderr, OutputStream::Stderr, tx.clone()));
    }
    drop(tx);

    loop {
        let next = match spec.output_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx.recv()).await {
                Ok(next) => next,
                Err(_) => return kill_after_timeout(&mut child, readers, limit).await,
            },
            None => rx.recv().await,
        };
        match next {
            Some((stream, line)) => on_line(stream, line),
            None => break,
        }
    }

    let waited = match spec.output_timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(waited) => waited,
            Err(_) => return kill_after_timeout(&mut child, readers, limit).await,
        },
        None => child.wait().await,
    };

    match waited {
        Ok(status) => CommandStatus::Exited {
            code: status.code().unwrap_or(-1),
        },
        Err(e) => CommandStatus::SpawnFailed {
            reason: format!("wait failed: {e}"),
        },
    }
}

fn forward_lines<R>(
    pipe: R,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<(OutputStream, String)>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send((stream, decode_line(&buf))).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read command output");
                    break;
                }
            }
        }
    })
}

/// Decode one raw line, replacing invalid UTF-8 and dropping the terminator.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

async fn kill_after_timeout(
    child: &mut tokio::process::Child,
    readers: Vec<JoinHandle<()>>,
    limit: Duration,
) -> CommandStatus {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill timed-out command");
    }
    for reader in readers {
        reader.abort();
    }
    CommandStatus::TimedOut {
        after_secs: limit.as_secs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::ErrorRule;
    use crate::severity::RuleLevel;

    #[test]
    fn test_status_success_and_codes() {
        assert!(CommandStatus::Exited { code: 0 }.success());
        assert!(CommandStatus::Noop.success());
        assert!(!CommandStatus::Exited { code: 3 }.success());
        assert_eq!(CommandStatus::Exited { code: 3 }.exit_code(), 3);
        assert_eq!(
            CommandStatus::TimedOut { after_secs: 1 }.exit_code(),
            TIMED_OUT_CODE
        );
        assert_eq!(
            CommandStatus::SpawnFailed {
                reason: "x".into()
            }
            .exit_code(),
            SPAWN_FAILED_CODE
        );
        assert_ne!(TIMED_OUT_CODE, SPAWN_FAILED_CODE);
    }

    #[test]
    fn test_decode_line_is_lossy() {
        assert_eq!(decode_line(b"caf\xe9\n"), "caf\u{fffd}");
        assert_eq!(decode_line(b"crlf\r\n"), "crlf");
        assert_eq!(decode_line(b"no newline"), "no newline");
    }

    #[test]
    fn test_zero_timeout_means_none() {
        let spec = CommandSpec::new(["true"]).output_timeout_secs(0);
        assert!(spec.output_timeout.is_none());
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let runner = CommandRunner::new(false);
        let outcome = runner.run(&CommandSpec::new(["echo", "hello"])).await;
        assert!(outcome.success());
        assert_eq!(outcome.exit_code(), 0);
        assert!(outcome.matches.is_empty());
    }

    #[tokio::test]
    async fn test_execute_failing_command() {
        let runner = CommandRunner::new(false);
        let outcome = runner.run(&CommandSpec::new(["false"])).await;
        assert!(!outcome.success());
        assert_ne!(outcome.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_empty_command_is_spawn_failure() {
        let runner = CommandRunner::new(false);
        let outcome = runner.run(&CommandSpec::default()).await;
        assert!(matches!(outcome.status, CommandStatus::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn test_rules_classify_output() {
        let runner = CommandRunner::new(false);
        let rules = ErrorMatcher::empty()
            .with_rule(ErrorRule::substr("ignore me", RuleLevel::Ignore))
            .with_rule(ErrorRule::substr("oops", RuleLevel::Error));
        let spec = CommandSpec::new(["sh", "-c", "echo fine; echo oops; echo 'oops ignore me'"])
            .rules(rules);
        let outcome = runner.run(&spec).await;
        assert!(outcome.success());
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].line, "oops");
        assert_eq!(outcome.worst(), Some(Severity::Error));
    }

    #[tokio::test]
    async fn test_capture_output_returns_stdout() {
        let runner = CommandRunner::new(false);
        let captured = runner
            .capture_output(&CommandSpec::new(["sh", "-c", "echo one; echo two >&2"]))
            .await;
        assert!(captured.status.success());
        assert_eq!(captured.text, "one\n");
    }

    #[tokio::test]
    async fn test_noop_capture_returns_empty_success() {
        let runner = CommandRunner::new(true);
        let captured = runner.capture_output(&CommandSpec::new(["cat", "/etc/hostname"])).await;
        assert!(captured.status.success());
        assert!(captured.text.is_empty());
    }
}
