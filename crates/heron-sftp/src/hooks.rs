//! External hook scripts
//!
//! Hooks are diagnostics-only extension points: their exit codes and output
//! are logged, never acted on.

use async_trait::async_trait;
use heron_core::Result;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::events::{Event, EventHandler};
use crate::executor::{CommandRunner, CommandSpec};
use crate::store::ConfigurationStore;

pub struct HookRunner {
    runner: Arc<dyn CommandRunner>,
    store: Arc<ConfigurationStore>,
}

impl HookRunner {
    pub fn new(runner: Arc<dyn CommandRunner>, store: Arc<ConfigurationStore>) -> Self {
        Self { runner, store }
    }

    /// Run every hook in `hooks` with `args`. Never fails.
    pub async fn run_all(&self, hooks: &[String], args: &[&str]) {
        for hook in hooks {
            if let Err(e) = self.run_hook(Path::new(hook), args).await {
                warn!(hook = %hook, error = %e, "Hook could not be run");
            }
        }
    }

    async fn run_hook(&self, hook: &Path, args: &[&str]) -> Result<()> {
        let metadata = match tokio::fs::metadata(hook).await {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => {
                info!("Hook '{}' does not exist", hook.display());
                return Ok(());
            }
        };

        let hook_arg = hook.to_string_lossy().into_owned();
        if metadata.permissions().mode() & 0o111 == 0 {
            debug!("Marking hook '{}' executable", hook.display());
            self.runner
                .run(CommandSpec::new("chmod").args(["+x", hook_arg.as_str()]))
                .await?;
        }

        debug!("Executing hook '{}'", hook.display());
        let output = self
            .runner
            .run(CommandSpec::new(hook_arg.as_str()).args(args.iter().copied()).tolerant())
            .await?;

        if output.trimmed().is_empty() {
            debug!(code = output.exit_code, "Hook '{}' completed", hook.display());
        } else {
            debug!(
                code = output.exit_code,
                output = %output.trimmed(),
                "Hook '{}' completed",
                hook.display()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for HookRunner {
    fn name(&self) -> &'static str {
        "hook-runner"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let state = self.store.get();
        match event {
            Event::ServerStartup => {
                self.run_all(&state.global.hooks.on_server_startup, &[]).await;
            }
            Event::SessionChanged { username, state: session_state } => {
                self.run_all(
                    &state.global.hooks.on_session_change,
                    &[session_state.as_str(), username.as_str()],
                )
                .await;
            }
            Event::ConfigurationChanged { .. } => {}
        }
        Ok(())
    }
}
