//! External command execution
//!
//! Every account-management call, permission change and hook goes through the
//! [`CommandRunner`] trait so the reconciliation and session logic can be
//! driven against a scripted fake in tests.

use async_trait::async_trait;
use heron_core::{HeronError, Result};
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Default upper bound for a single external command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// A program invocation.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Written to the child's stdin, then stdin is closed.
    pub stdin: Option<String>,
    /// Turn a non-zero exit code into [`HeronError::Command`].
    pub fail_fast: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            fail_fast: true,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Report non-zero exits as a normal [`CommandOutput`] instead of an error.
    #[must_use]
    pub fn tolerant(mut self) -> Self {
        self.fail_fast = false;
        self
    }

    /// Program and arguments joined by spaces, for logs and assertions.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// stdin may carry credentials
impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .field("fail_fast", &self.fail_fast)
            .finish()
    }
}

/// Exit code plus stdout and stderr merged into one string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn new(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn trimmed(&self) -> &str {
        self.output.trim()
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the program to completion. Implementations report non-zero exits
    /// as `Ok`; [`CommandRunner::run`] applies the fail-fast policy.
    async fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        match self.execute(&spec).await {
            Ok(output) if spec.fail_fast && !output.success() => Err(HeronError::Command {
                program: spec.program.clone(),
                code: output.exit_code,
                output: output.output,
            }),
            Ok(output) => Ok(output),
            Err(e) if !spec.fail_fast && e.is_command_failure() => {
                debug!(command = %spec.command_line(), error = %e, "Tolerated command failure");
                Ok(CommandOutput::new(1, e.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

/// Runs real OS processes with a bounded wait.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec.command_line(), "Running command");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| HeronError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let stdin = child.stdin.take();
        let completion = async move {
            if let (Some(input), Some(mut stdin)) = (spec.stdin.as_ref(), stdin) {
                stdin.write_all(input.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            child.wait_with_output().await
        };

        // A child that never drains stdin counts against the timeout too.
        // Dropping the future on timeout drops the child, which kills it.
        let output = tokio::time::timeout(self.timeout, completion)
            .await
            .map_err(|_| {
                warn!(command = %spec.command_line(), "Command timed out");
                HeronError::Timeout {
                    program: spec.program.clone(),
                    secs: self.timeout.as_secs(),
                }
            })??;

        let mut merged = String::from_utf8_lossy(&output.stdout).into_owned();
        merged.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            output: merged.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line() {
        let spec = CommandSpec::new("usermod").args(["-a", "-G", "staff"]).arg("alice");
        assert_eq!(spec.command_line(), "usermod -a -G staff alice");
        assert!(spec.fail_fast);
        assert!(!spec.clone().tolerant().fail_fast);
    }

    #[test]
    fn test_debug_hides_stdin() {
        let spec = CommandSpec::new("chpasswd").stdin("alice:secret\n");
        assert!(!format!("{spec:?}").contains("secret"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_merges_output() {
        let runner = ProcessRunner::default();
        let output = runner
            .run(CommandSpec::new("sh").args(["-c", "echo out; echo err 1>&2"]))
            .await
            .unwrap();
        assert!(output.success());
        assert!(output.output.contains("out"));
        assert!(output.output.contains("err"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fail_fast_and_tolerant() {
        let runner = ProcessRunner::default();
        let err = runner
            .run(CommandSpec::new("sh").args(["-c", "exit 3"]))
            .await
            .unwrap_err();
        assert!(matches!(err, HeronError::Command { code: 3, .. }));

        let output = runner
            .run(CommandSpec::new("sh").args(["-c", "exit 3"]).tolerant())
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_is_delivered() {
        let runner = ProcessRunner::default();
        let output = runner
            .run(CommandSpec::new("cat").stdin("hello"))
            .await
            .unwrap();
        assert_eq!(output.trimmed(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_failure() {
        let runner = ProcessRunner::new(Duration::from_millis(100));
        let err = runner
            .run(CommandSpec::new("sleep").arg("5"))
            .await
            .unwrap_err();
        assert!(matches!(err, HeronError::Timeout { .. }));

        let tolerated = runner
            .run(CommandSpec::new("sleep").arg("5").tolerant())
            .await
            .unwrap();
        assert_eq!(tolerated.exit_code, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unread_stdin_is_bounded_by_timeout() {
        let runner = ProcessRunner::new(Duration::from_millis(100));
        let input = "x".repeat(4 * 1024 * 1024);
        let err = runner
            .run(CommandSpec::new("sleep").arg("5").stdin(input))
            .await
            .unwrap_err();
        assert!(matches!(err, HeronError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_program_tolerated() {
        let runner = ProcessRunner::default();
        let output = runner
            .run(CommandSpec::new("/nonexistent/heron-test-binary").tolerant())
            .await
            .unwrap();
        assert_eq!(output.exit_code, 1);

        let err = runner
            .run(CommandSpec::new("/nonexistent/heron-test-binary"))
            .await
            .unwrap_err();
        assert!(matches!(err, HeronError::Spawn { .. }));
    }
}
