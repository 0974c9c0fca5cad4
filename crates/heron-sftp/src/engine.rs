//! Engine wiring
//!
//! Builds every component around one store, one event bus and one apply
//! queue, and owns the startup and shutdown order.

use chrono::{DateTime, Utc};
use heron_core::{DesiredState, Result, SftpDocument};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::apply::{Applied, ApplyQueue, ApplyWorker};
use crate::config::Config;
use crate::daemon::{DaemonLauncher, LaunchSpec};
use crate::events::{EventBus, EventKind};
use crate::executor::CommandRunner;
use crate::hooks::HookRunner;
use crate::host_keys::HostKeyManager;
use crate::ledger::PasswordLedger;
use crate::pam::PamHookInstaller;
use crate::reconciler::AccountReconciler;
use crate::session::{PamEvent, SessionService};
use crate::store::ConfigurationStore;
use crate::supervisor::{DaemonState, KillPolicy, Supervisor, SupervisorOptions};

/// Snapshot of the engine for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub generation: u64,
    pub daemon_state: DaemonState,
    pub users: usize,
    pub last_applied_at: Option<DateTime<Utc>>,
}

pub struct Engine {
    store: Arc<ConfigurationStore>,
    supervisor: Arc<Supervisor>,
    reconciler: Arc<AccountReconciler>,
    sessions: Arc<SessionService>,
    pam: Option<PamHookInstaller>,
    applied: Arc<watch::Sender<Option<Applied>>>,
    worker: Mutex<Option<ApplyWorker>>,
    worker_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Engine {
    pub async fn build(
        config: &Config,
        initial: DesiredState,
        runner: Arc<dyn CommandRunner>,
        launcher: Arc<dyn DaemonLauncher>,
    ) -> Self {
        let paths = &config.paths;
        let (queue, rx) = ApplyQueue::channel();
        let store = Arc::new(ConfigurationStore::new(initial, queue.clone()));
        let bus = Arc::new(EventBus::new());

        let host_keys = HostKeyManager::new(
            runner.clone(),
            paths.keys_import_dir.clone(),
            paths.ssh_dir.clone(),
        );
        let supervisor = Arc::new(Supervisor::new(
            runner.clone(),
            launcher,
            host_keys,
            store.clone(),
            bus.clone(),
            queue,
            SupervisorOptions {
                config_path: paths.sshd_config.clone(),
                launch: LaunchSpec::sshd(&paths.sshd_binary, &paths.sshd_config),
                home_base: paths.home_base.clone(),
                kill_policy: KillPolicy {
                    accepted_exit_codes: config.commands.kill_accepted_exit_codes.clone(),
                },
            },
        ));
        let reconciler = Arc::new(AccountReconciler::new(
            runner.clone(),
            store.clone(),
            paths.home_base.clone(),
            PasswordLedger::open(&paths.state_dir).await,
        ));
        let sessions = Arc::new(SessionService::new(
            runner.clone(),
            store.clone(),
            bus.clone(),
            paths.home_base.clone(),
        ));
        let hooks = Arc::new(HookRunner::new(runner.clone(), store.clone()));

        // Accounts converge before the daemon restarts with the new config.
        bus.subscribe(EventKind::ConfigurationChanged, reconciler.clone()).await;
        bus.subscribe(EventKind::ConfigurationChanged, supervisor.clone()).await;
        bus.subscribe(EventKind::ServerStartup, hooks.clone()).await;
        bus.subscribe(EventKind::SessionChanged, hooks).await;

        let pam = config.pam.install_hook.then(|| {
            PamHookInstaller::new(runner, paths.pam_dir.clone(), config.pam.event_url.clone())
        });

        let (applied, _) = watch::channel(None);
        let applied = Arc::new(applied);
        let worker = ApplyWorker::new(rx, store.clone(), bus, supervisor.clone(), applied.clone());

        Self {
            store,
            supervisor,
            reconciler,
            sessions,
            pam,
            applied,
            worker: Mutex::new(Some(worker)),
            worker_task: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Install the PAM hook, converge accounts, start the daemon, then begin
    /// processing queued changes. Any error leaves the daemon stopped.
    pub async fn start(&self) -> Result<()> {
        info!("Starting engine");
        if let Some(pam) = &self.pam {
            pam.install().await?;
        }
        let generation = self.store.generation();
        self.reconciler.startup().await?;
        self.supervisor.start().await?;
        self.applied.send_replace(Some(Applied::now(generation)));

        if let Some(worker) = self.worker.lock().await.take() {
            let shutdown = self.shutdown.clone();
            *self.worker_task.lock().await = Some(tokio::spawn(worker.run(shutdown)));
        }
        info!(generation, event = "engine_started", "Engine started");
        Ok(())
    }

    /// Stop processing changes, then stop the daemon.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Stopping engine");
        self.shutdown.cancel();
        if let Some(task) = self.worker_task.lock().await.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Apply worker terminated abnormally");
            }
        }
        self.supervisor.stop().await?;
        info!(event = "engine_stopped", "Engine stopped");
        Ok(())
    }

    /// Publish a new desired-state document. Returns the generation in effect.
    pub fn reload(&self, document: SftpDocument) -> u64 {
        self.store.publish(document)
    }

    pub async fn handle_session(&self, event: PamEvent) -> bool {
        self.sessions.handle(event).await
    }

    pub fn store(&self) -> &Arc<ConfigurationStore> {
        &self.store
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn status(&self) -> EngineStatus {
        let snapshot = self.store.snapshot();
        EngineStatus {
            generation: snapshot.generation,
            daemon_state: self.supervisor.state(),
            users: snapshot.state.users.len(),
            last_applied_at: (*self.applied.borrow()).map(|applied| applied.at),
        }
    }
}
