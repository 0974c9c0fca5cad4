//! SSH daemon process boundary
//!
//! The supervisor talks to the daemon only through [`DaemonLauncher`] and
//! [`DaemonProcess`]. [`SshdLauncher`] runs the real binary in its own process
//! group so stopping it also takes down the per-connection children.

use async_trait::async_trait;
use heron_core::{HeronError, Result};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, trace};

/// Line prefix of the daemon's log entry for connections that never speak SSH
/// (port scanners, TCP health checks).
pub const NO_IDENTIFICATION_PREFIX: &str = "Did not receive identification string from";

/// How to start the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl LaunchSpec {
    /// Foreground (`-D`) with logs on stderr (`-e`), reading `config`.
    pub fn sshd(binary: impl Into<PathBuf>, config: impl Into<PathBuf>) -> Self {
        let config: PathBuf = config.into();
        Self {
            program: binary.into(),
            args: vec![
                "-D".to_string(),
                "-e".to_string(),
                "-f".to_string(),
                config.to_string_lossy().into_owned(),
            ],
        }
    }
}

/// Which daemon output lines reach the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputFilter {
    pub ignore_no_identification_string: bool,
}

impl OutputFilter {
    pub fn accepts(&self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return false;
        }
        !(self.ignore_no_identification_string && line.starts_with(NO_IDENTIFICATION_PREFIX))
    }
}

#[async_trait]
pub trait DaemonProcess: Send {
    /// Wait for the process to exit. Returns the exit code, `None` when it
    /// was terminated by a signal or could not be waited on.
    async fn wait(&mut self) -> Option<i32>;

    /// Kill the process and everything it spawned, then reap it.
    async fn kill_tree(&mut self) -> Result<()>;

    fn id(&self) -> Option<u32>;
}

#[async_trait]
pub trait DaemonLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec, filter: OutputFilter) -> Result<Box<dyn DaemonProcess>>;
}

/// Launches the real `sshd`.
#[derive(Debug, Clone, Default)]
pub struct SshdLauncher;

fn forward_output<R>(reader: R, filter: OutputFilter)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if filter.accepts(&line) {
                trace!(target: "sshd", "sshd - {}", line.trim());
            }
        }
    });
}

#[async_trait]
impl DaemonLauncher for SshdLauncher {
    async fn launch(&self, spec: &LaunchSpec, filter: OutputFilter) -> Result<Box<dyn DaemonProcess>> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HeronError::Spawn {
                program: spec.program.to_string_lossy().into_owned(),
                source,
            })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, filter);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, filter);
        }

        debug!(pid = child.id(), "Spawned '{}'", spec.program.display());
        Ok(Box::new(SshdProcess { child }))
    }
}

pub struct SshdProcess {
    child: Child,
}

#[async_trait]
impl DaemonProcess for SshdProcess {
    async fn wait(&mut self) -> Option<i32> {
        self.child.wait().await.ok().and_then(|status| status.code())
    }

    async fn kill_tree(&mut self) -> Result<()> {
        if let Some(pid) = self.child.id() {
            let group = i32::try_from(pid)
                .map_err(|_| HeronError::Daemon(format!("Process id {pid} out of range")))?;
            match killpg(Pid::from_raw(group), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    return Err(HeronError::Daemon(format!(
                        "Failed to kill process group {group}: {e}"
                    )));
                }
            }
        }
        // Reaps the leader; a no-op when it already exited.
        self.child.wait().await?;
        Ok(())
    }

    fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_drops_blank_lines() {
        let filter = OutputFilter::default();
        assert!(!filter.accepts("   "));
        assert!(filter.accepts("Server listening on 0.0.0.0 port 22."));
        assert!(filter.accepts("Did not receive identification string from 10.0.0.1 port 4242"));
    }

    #[test]
    fn test_filter_drops_identification_noise() {
        let filter = OutputFilter {
            ignore_no_identification_string: true,
        };
        assert!(!filter.accepts("  Did not receive identification string from 10.0.0.1 port 4242"));
        assert!(filter.accepts("Accepted publickey for alice"));
    }

    #[test]
    fn test_sshd_launch_spec() {
        let spec = LaunchSpec::sshd("/usr/sbin/sshd", "/etc/ssh/sshd_config");
        assert_eq!(spec.args, vec!["-D", "-e", "-f", "/etc/ssh/sshd_config"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_tree_stops_process_group() {
        let spec = LaunchSpec {
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), "sleep 30 & sleep 30".into()],
        };
        let mut process = SshdLauncher.launch(&spec, OutputFilter::default()).await.unwrap();
        assert!(process.id().is_some());
        process.kill_tree().await.unwrap();
        assert!(process.id().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_reports_exit_code() {
        let spec = LaunchSpec {
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), "exit 7".into()],
        };
        let mut process = SshdLauncher.launch(&spec, OutputFilter::default()).await.unwrap();
        assert_eq!(process.wait().await, Some(7));
    }
}
