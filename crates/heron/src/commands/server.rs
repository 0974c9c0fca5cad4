use anyhow::{Context, Result};
use heron_core::SftpDocument;
use heron_http::HttpServer;
use heron_sftp::config::LogFormat;
use heron_sftp::{Config, Engine, ProcessRunner, SshdLauncher};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::Interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{config, logging};

/// Command-line settings that take precedence over the settings file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub bind: Option<String>,
    pub log_format: Option<LogFormat>,
    pub log_file: Option<PathBuf>,
    pub verbose: bool,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.http.bind = bind;
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        if let Some(file) = self.log_file {
            config.logging.file = Some(file);
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}

pub async fn init_config(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    config::save_config(config_path, &Config::default()).await?;
    println!("Configuration file created at: {}", config_path.display());
    println!("\nPlease review and edit the configuration before starting the service.");
    Ok(())
}

/// Start heron and block until SIGINT or SIGTERM
///
/// NIST Controls:
/// - CM-6: Configuration Settings (load settings and desired state)
/// - AU-3: Content of Audit Records (log lifecycle events)
/// - AC-2: Account Management (reconcile before serving)
pub async fn run(config_path: &Path, overrides: Overrides) -> Result<()> {
    let mut config = config::load_config(config_path)
        .await
        .context("Failed to load configuration")?;
    overrides.apply(&mut config);

    let _log_guard = logging::init(&config.logging);

    info!(
        event = "server_starting",
        version = env!("CARGO_PKG_VERSION"),
        "Starting heron"
    );
    info!(
        event = "server_configuration",
        desired_state = ?config.desired_state_path,
        bind = %config.http.bind,
        sshd_config = ?config.paths.sshd_config,
        home_base = ?config.paths.home_base,
        log_format = ?config.logging.format,
        "Engine configuration"
    );

    let bind: SocketAddr = config
        .http
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", config.http.bind))?;

    let document = SftpDocument::from_file(&config.desired_state_path).with_context(|| {
        format!(
            "Failed to load desired state from {}",
            config.desired_state_path.display()
        )
    })?;
    let initial = document.validate();
    info!(users = initial.users.len(), groups = initial.groups.len(), "Desired state loaded");

    let runner = Arc::new(ProcessRunner::new(config.commands.timeout()));
    let engine = Arc::new(Engine::build(&config, initial, runner, Arc::new(SshdLauncher)).await);
    engine.start().await.context("Failed to start engine")?;

    let shutdown = CancellationToken::new();

    let http_server = HttpServer::new(engine.clone(), bind);
    let http_shutdown = shutdown.clone();
    let mut http_handle = tokio::spawn(async move { http_server.run(http_shutdown).await });

    let watcher_handle = tokio::spawn(watch_document(
        engine.clone(),
        config.desired_state_path.clone(),
        config.reload_poll_secs,
        shutdown.clone(),
    ));

    info!(event = "server_running", "heron is running. Press Ctrl+C to stop.");

    let outcome = tokio::select! {
        signal = shutdown_signal() => signal,
        served = &mut http_handle => match served {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::Error::from(e).context("HTTP server failed")),
            Err(e) => Err(anyhow::Error::from(e).context("HTTP server task failed")),
        },
    };
    info!(event = "server_stopping", "Shutting down...");

    shutdown.cancel();
    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "Failed to stop engine cleanly");
    }
    if !http_handle.is_finished() {
        if let Err(e) = http_handle.await {
            warn!(error = %e, "HTTP server task ended abnormally");
        }
    }
    if let Err(e) = watcher_handle.await {
        warn!(error = %e, "Reload watcher ended abnormally");
    }

    info!(event = "server_shutdown", "heron shutdown complete");
    outcome
}

async fn shutdown_signal() -> Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl+C")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

async fn modified(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Republish the document on SIGHUP or when its modification time changes.
async fn watch_document(engine: Arc<Engine>, path: PathBuf, poll_secs: u64, shutdown: CancellationToken) {
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => Some(hangup),
        Err(e) => {
            warn!(error = %e, "Failed to install SIGHUP handler, reload on signal disabled");
            None
        }
    };
    let mut interval = (poll_secs > 0).then(|| tokio::time::interval(Duration::from_secs(poll_secs)));
    let mut last_modified = modified(&path).await;

    loop {
        let trigger = tokio::select! {
            _ = shutdown.cancelled() => return,
            Some(()) = async {
                match hangup.as_mut() {
                    Some(hangup) => hangup.recv().await,
                    None => std::future::pending().await,
                }
            } => "signal",
            _ = tick(&mut interval) => {
                let current = modified(&path).await;
                if current == last_modified {
                    continue;
                }
                "modified"
            }
        };

        last_modified = modified(&path).await;
        reload(&engine, &path, trigger);
    }
}

fn reload(engine: &Engine, path: &Path, trigger: &str) {
    match SftpDocument::from_file(path) {
        Ok(document) => {
            let generation = engine.reload(document);
            info!(trigger, generation, event = "configuration_reloaded", "Desired state reloaded");
        }
        Err(e) => {
            warn!(
                trigger,
                error = %e,
                event = "configuration_reload_failed",
                "Failed to reload desired state, keeping previous configuration"
            );
        }
    }
}
