//! PAM session hook installation
//!
//! Session preparation is driven by PAM: a `pam_exec` rule included from
//! `common-session` runs a small script that reports every session event to
//! the HTTP endpoint. Without it no session signal ever arrives, so any
//! failure here is fatal to startup.

use heron_core::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::executor::{CommandRunner, CommandSpec};

pub const HOOK_NAME: &str = "sftp-hook";
pub const SCRIPT_NAME: &str = "sftp-pam-event.sh";
pub const DEFAULT_EVENT_URL: &str = "http://localhost:25080/api/events/pam/generic";

pub fn event_script(event_url: &str) -> String {
    format!(
        "#!/bin/sh\ncurl -fsS \"{event_url}?username=$PAM_USER&type=$PAM_TYPE&service=$PAM_SERVICE\"\n"
    )
}

pub fn hook_rule(script: &Path) -> String {
    format!(
        "# This file is used to signal the SFTP service on user events.\nsession required pam_exec.so {}\n",
        script.display()
    )
}

pub struct PamHookInstaller {
    runner: Arc<dyn CommandRunner>,
    pam_dir: PathBuf,
    event_url: String,
}

impl PamHookInstaller {
    pub fn new(runner: Arc<dyn CommandRunner>, pam_dir: PathBuf, event_url: impl Into<String>) -> Self {
        Self {
            runner,
            pam_dir,
            event_url: event_url.into(),
        }
    }

    pub fn script_path(&self) -> PathBuf {
        self.pam_dir.join("scripts").join(SCRIPT_NAME)
    }

    pub async fn install(&self) -> Result<()> {
        debug!("Installing PAM hook");
        let script = self.script_path();
        if let Some(scripts_dir) = script.parent() {
            tokio::fs::create_dir_all(scripts_dir).await?;
        }
        tokio::fs::write(&script, event_script(&self.event_url)).await?;
        self.secure(&script, "+x").await?;

        let hook = self.pam_dir.join(HOOK_NAME);
        tokio::fs::write(&hook, hook_rule(&script)).await?;
        self.secure(&hook, "644").await?;

        let common_session = self.pam_dir.join("common-session");
        let include = format!("@include {HOOK_NAME}");
        let existing = match tokio::fs::read_to_string(&common_session).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        if !existing.lines().any(|line| line.trim() == include) {
            let mut updated = existing;
            if !updated.is_empty() && !updated.ends_with('\n') {
                updated.push('\n');
            }
            updated.push_str(&include);
            updated.push('\n');
            tokio::fs::write(&common_session, updated).await?;
            debug!("Added '{}' to '{}'", include, common_session.display());
        }

        info!(url = %self.event_url, "PAM hook installed");
        Ok(())
    }

    async fn secure(&self, path: &Path, mode: &str) -> Result<()> {
        let path_arg = path.to_string_lossy().into_owned();
        self.runner
            .run(CommandSpec::new("chown").args(["root:root", path_arg.as_str()]))
            .await?;
        self.runner
            .run(CommandSpec::new("chmod").args([mode, path_arg.as_str()]))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_script_carries_pam_variables() {
        let script = event_script(DEFAULT_EVENT_URL);
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains(
            "http://localhost:25080/api/events/pam/generic?username=$PAM_USER&type=$PAM_TYPE&service=$PAM_SERVICE"
        ));
    }

    #[test]
    fn test_hook_rule() {
        let rule = hook_rule(Path::new("/etc/pam.d/scripts/sftp-pam-event.sh"));
        assert!(rule.contains("session required pam_exec.so /etc/pam.d/scripts/sftp-pam-event.sh\n"));
    }
}
