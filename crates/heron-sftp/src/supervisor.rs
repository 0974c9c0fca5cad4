//! Daemon supervision
//!
//! NIST 800-53: CP-10 (System Recovery and Reconstitution), CM-6 (Configuration Settings)
//! Implementation: Exactly one daemon process is owned at a time. Every start
//! refreshes host keys and rewrites the daemon configuration from the current
//! desired state. A monitor task per spawned process reports unexpected exits
//! through the apply queue; each spawn gets a new epoch so exits of processes
//! that were already replaced or stopped are ignored.

use async_trait::async_trait;
use heron_core::{DesiredState, HeronError, Result};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::apply::{ApplyQueue, ApplyRequest};
use crate::daemon::{DaemonLauncher, DaemonProcess, LaunchSpec, OutputFilter};
use crate::events::{Event, EventBus, EventHandler};
use crate::executor::{CommandOutput, CommandRunner, CommandSpec};
use crate::host_keys::HostKeyManager;
use crate::sshd_config::{RenderContext, render};
use crate::store::ConfigurationStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    Restarting,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DaemonState::Stopped => "stopped",
            DaemonState::Starting => "starting",
            DaemonState::Running => "running",
            DaemonState::Restarting => "restarting",
        };
        f.write_str(name)
    }
}

/// Exit codes of the system-wide kill utility that count as success.
///
/// `killall` exits 1 when nothing matched. Any other code is tolerated only
/// when the tool printed nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillPolicy {
    pub accepted_exit_codes: Vec<i32>,
}

impl Default for KillPolicy {
    fn default() -> Self {
        Self {
            accepted_exit_codes: vec![0, 1],
        }
    }
}

impl KillPolicy {
    pub fn evaluate(&self, output: &CommandOutput) -> Result<()> {
        if self.accepted_exit_codes.contains(&output.exit_code) {
            return Ok(());
        }
        if output.trimmed().is_empty() {
            warn!(code = output.exit_code, "Kill utility exited with an unexpected code");
            return Ok(());
        }
        Err(HeronError::Daemon(format!(
            "Could not stop existing sshd processes: {}",
            output.trimmed()
        )))
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub config_path: PathBuf,
    pub launch: LaunchSpec,
    pub home_base: PathBuf,
    pub kill_policy: KillPolicy,
}

struct Monitor {
    epoch: u64,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

#[derive(Default)]
struct Inner {
    epoch: u64,
    first_start: bool,
    monitor: Option<Monitor>,
}

pub struct Supervisor {
    runner: Arc<dyn CommandRunner>,
    launcher: Arc<dyn DaemonLauncher>,
    host_keys: HostKeyManager,
    store: Arc<ConfigurationStore>,
    bus: Arc<EventBus>,
    queue: ApplyQueue,
    options: SupervisorOptions,
    inner: Mutex<Inner>,
    state: watch::Sender<DaemonState>,
}

impl Supervisor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        launcher: Arc<dyn DaemonLauncher>,
        host_keys: HostKeyManager,
        store: Arc<ConfigurationStore>,
        bus: Arc<EventBus>,
        queue: ApplyQueue,
        options: SupervisorOptions,
    ) -> Self {
        let (state, _) = watch::channel(DaemonState::Stopped);
        Self {
            runner,
            launcher,
            host_keys,
            store,
            bus,
            queue,
            options,
            inner: Mutex::new(Inner {
                first_start: true,
                ..Inner::default()
            }),
            state,
        }
    }

    pub fn state(&self) -> DaemonState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DaemonState> {
        self.state.subscribe()
    }

    /// Number of processes spawned so far.
    pub async fn epoch(&self) -> u64 {
        self.inner.lock().await.epoch
    }

    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.monitor.is_some() {
            debug!("Daemon already running");
            return Ok(());
        }
        self.state.send_replace(DaemonState::Starting);
        self.start_locked(&mut inner).await
    }

    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let result = self.stop_locked(&mut inner).await;
        self.state.send_replace(DaemonState::Stopped);
        result
    }

    /// Restart with the current desired state.
    pub async fn on_configuration_changed(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.state.send_replace(DaemonState::Restarting);
        if let Err(e) = self.stop_locked(&mut inner).await {
            self.state.send_replace(DaemonState::Stopped);
            return Err(e);
        }
        self.start_locked(&mut inner).await
    }

    /// Restart after the process spawned under `epoch` exited on its own.
    pub async fn on_daemon_exited(&self, epoch: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let current = inner.monitor.as_ref().map(|m| m.epoch);
        if current != Some(epoch) {
            debug!(epoch, ?current, "Ignoring exit of a daemon that is no longer owned");
            return Ok(());
        }

        warn!(epoch, "'sshd' process has stopped. Restarting process.");
        self.state.send_replace(DaemonState::Restarting);
        if let Some(monitor) = inner.monitor.take() {
            Self::join_monitor(monitor.task).await?;
        }
        self.start_locked(&mut inner).await
    }

    async fn start_locked(&self, inner: &mut Inner) -> Result<()> {
        match self.launch_locked(inner).await {
            Ok(()) => {
                self.state.send_replace(DaemonState::Running);
                if let Err(e) = self.bus.publish(&Event::ServerStartup).await {
                    warn!(error = %e, "Server startup handlers failed");
                }
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to start 'sshd'");
                self.state.send_replace(DaemonState::Stopped);
                Err(e)
            }
        }
    }

    async fn launch_locked(&self, inner: &mut Inner) -> Result<()> {
        if inner.first_start {
            self.kill_existing().await?;
            inner.first_start = false;
        }

        let state = self.store.get();
        self.host_keys.refresh(&state.global.host_keys).await?;
        self.write_config(&state).await?;

        info!("Starting 'sshd' process");
        let filter = OutputFilter {
            ignore_no_identification_string: state.global.logging.ignore_no_identification_string,
        };
        let process = self.launcher.launch(&self.options.launch, filter).await?;

        inner.epoch += 1;
        let epoch = inner.epoch;
        info!(epoch, pid = process.id(), event = "daemon_started", "Started 'sshd' process");
        inner.monitor = Some(self.spawn_monitor(epoch, process));
        Ok(())
    }

    async fn stop_locked(&self, inner: &mut Inner) -> Result<()> {
        let Some(monitor) = inner.monitor.take() else {
            return Ok(());
        };
        let Monitor { epoch, stop, task } = monitor;
        debug!(epoch, "Stopping 'sshd' process");
        // Fails only when the process already exited; the join still reaps.
        let _ = stop.send(());
        Self::join_monitor(task).await?;
        info!(event = "daemon_stopped", "Stopped 'sshd' process");
        Ok(())
    }

    async fn join_monitor(task: JoinHandle<Result<()>>) -> Result<()> {
        task.await
            .map_err(|e| HeronError::Daemon(format!("Daemon monitor failed: {e}")))?
    }

    fn spawn_monitor(&self, epoch: u64, mut process: Box<dyn DaemonProcess>) -> Monitor {
        let (stop, stop_rx) = oneshot::channel();
        let queue = self.queue.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                code = process.wait() => {
                    warn!(epoch, ?code, "'sshd' process exited");
                    queue.submit(ApplyRequest::DaemonExited { epoch });
                    Ok(())
                }
                _ = stop_rx => process.kill_tree().await,
            }
        });
        Monitor { epoch, stop, task }
    }

    async fn kill_existing(&self) -> Result<()> {
        let name = self
            .options
            .launch
            .program
            .file_name()
            .map_or_else(|| "sshd".to_string(), |n| n.to_string_lossy().into_owned());
        debug!(process = %name, "Stopping pre-existing daemon processes");
        // Straight to execute: a missing kill utility must not look like
        // "nothing to kill".
        let output = self
            .runner
            .execute(&CommandSpec::new("killall").args(["-q", "-w", name.as_str()]).tolerant())
            .await?;
        self.options.kill_policy.evaluate(&output)
    }

    async fn write_config(&self, state: &DesiredState) -> Result<()> {
        let context = RenderContext {
            host_key_dir: self.host_keys.live_dir().to_path_buf(),
            home_base: self.options.home_base.clone(),
        };
        let rendered = render(state, &context);
        if let Some(parent) = self.options.config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.options.config_path, rendered).await?;
        debug!("Wrote '{}'", self.options.config_path.display());
        Ok(())
    }
}

#[async_trait]
impl EventHandler for Supervisor {
    fn name(&self) -> &'static str {
        "daemon-supervisor"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        if let Event::ConfigurationChanged { .. } = event {
            self.on_configuration_changed().await?;
        }
        Ok(())
    }
}
