//! OS account and group primitives
//!
//! NIST 800-53: AC-2 (Account Management)
//! Implementation: Thin wrappers over the shadow-utils tool set. Queries that
//! find nothing return `false` / empty lists instead of errors.

use anyhow::anyhow;
use heron_core::{HeronError, Result};
use std::path::Path;
use std::sync::Arc;

use crate::executor::{CommandOutput, CommandRunner, CommandSpec};

/// Shell assigned to managed accounts.
pub const NO_LOGIN_SHELL: &str = "/usr/sbin/nologin";

#[derive(Clone)]
pub struct AccountDirectory {
    runner: Arc<dyn CommandRunner>,
}

fn parse_id(program: &str, output: &CommandOutput, field: Option<usize>) -> Result<u32> {
    let text = output.trimmed();
    let raw = match field {
        Some(index) => text.split(':').nth(index).unwrap_or_default(),
        None => text,
    };
    raw.trim().parse::<u32>().map_err(|_| {
        HeronError::Other(anyhow!("Unexpected output from '{}': '{}'", program, text))
    })
}

impl AccountDirectory {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub async fn user_exists(&self, username: &str) -> Result<bool> {
        let output = self
            .runner
            .run(CommandSpec::new("getent").args(["passwd", username]).tolerant())
            .await?;
        Ok(output.success() && !output.trimmed().is_empty())
    }

    /// Create `username` with `home` as the passwd home directory. The
    /// directory itself is left to the caller.
    pub async fn user_create(&self, username: &str, home: &Path, gid: Option<u32>) -> Result<()> {
        let mut spec = CommandSpec::new("useradd")
            .args(["--comment", username])
            .arg("-d")
            .arg(home.to_string_lossy())
            .args(["-s", NO_LOGIN_SHELL]);
        if let Some(gid) = gid {
            spec = spec.arg("-g").arg(gid.to_string());
        }
        self.runner.run(spec.arg(username)).await?;
        Ok(())
    }

    pub async fn user_delete(&self, username: &str, fail_fast: bool) -> Result<CommandOutput> {
        let mut spec = CommandSpec::new("userdel").arg(username);
        spec.fail_fast = fail_fast;
        self.runner.run(spec).await
    }

    /// Set the password, or lock password login when `password` is `None`.
    /// The secret travels over stdin, never argv.
    pub async fn user_set_password(
        &self,
        username: &str,
        password: Option<&str>,
        is_encrypted: bool,
    ) -> Result<()> {
        let spec = match password {
            None => CommandSpec::new("usermod").args(["-p", "*", username]),
            Some(password) => {
                let mut spec = CommandSpec::new("chpasswd");
                if is_encrypted {
                    spec = spec.arg("-e");
                }
                spec.stdin(format!("{username}:{password}\n"))
            }
        };
        self.runner.run(spec).await?;
        Ok(())
    }

    /// Password field of the shadow entry, `None` when there is no entry.
    pub async fn user_password_hash(&self, username: &str) -> Result<Option<String>> {
        let output = self
            .runner
            .run(CommandSpec::new("getent").args(["shadow", username]).tolerant())
            .await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(output.trimmed().split(':').nth(1).map(str::to_string))
    }

    pub async fn user_get_id(&self, username: &str) -> Result<u32> {
        let output = self
            .runner
            .run(CommandSpec::new("id").args(["-u", username]))
            .await?;
        parse_id("id", &output, None)
    }

    /// Reassign the UID. Processes still running under the old UID are
    /// killed first, otherwise `usermod` refuses.
    pub async fn user_set_id(&self, username: &str, uid: u32) -> Result<()> {
        let current = self.user_get_id(username).await?;
        self.runner
            .run(CommandSpec::new("pkill").arg("-U").arg(current.to_string()).tolerant())
            .await?;
        self.runner
            .run(
                CommandSpec::new("usermod")
                    .args(["--non-unique", "--uid"])
                    .arg(uid.to_string())
                    .arg(username),
            )
            .await?;
        Ok(())
    }

    pub async fn group_exists(&self, group: &str) -> Result<bool> {
        let output = self
            .runner
            .run(CommandSpec::new("getent").args(["group", group]).tolerant())
            .await?;
        Ok(output.success() && !output.trimmed().is_empty())
    }

    /// `groupadd -f`; a requested GID may be shared with other groups.
    pub async fn group_create(&self, group: &str, gid: Option<u32>) -> Result<()> {
        let mut spec = CommandSpec::new("groupadd").arg("-f");
        if let Some(gid) = gid {
            spec = spec.arg("-g").arg(gid.to_string()).arg("-o");
        }
        self.runner.run(spec.arg(group)).await?;
        Ok(())
    }

    pub async fn group_add_user(&self, group: &str, username: &str) -> Result<()> {
        self.runner
            .run(CommandSpec::new("usermod").args(["-a", "-G", group, username]))
            .await?;
        Ok(())
    }

    pub async fn group_remove_user(&self, group: &str, username: &str) -> Result<()> {
        self.runner
            .run(CommandSpec::new("gpasswd").args(["-d", username, group]))
            .await?;
        Ok(())
    }

    /// Supplementary members of `group`, sorted. A missing group has no members.
    pub async fn group_list_users(&self, group: &str) -> Result<Vec<String>> {
        let output = self
            .runner
            .run(CommandSpec::new("getent").args(["group", group]).tolerant())
            .await?;
        if !output.success() {
            // getent exits 2 for "not found"
            if output.exit_code == 2 || output.trimmed().is_empty() {
                return Ok(Vec::new());
            }
            return Err(HeronError::Command {
                program: "getent".to_string(),
                code: output.exit_code,
                output: output.output,
            });
        }

        let mut members: Vec<String> = output
            .trimmed()
            .split(':')
            .nth(3)
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect();
        members.sort();
        Ok(members)
    }

    pub async fn group_get_id(&self, group: &str) -> Result<u32> {
        let output = self
            .runner
            .run(CommandSpec::new("getent").args(["group", group]))
            .await?;
        parse_id("getent", &output, Some(2))
    }

    pub async fn group_set_id(&self, group: &str, gid: u32) -> Result<()> {
        self.runner
            .run(CommandSpec::new("groupmod").arg("-g").arg(gid.to_string()).arg(group))
            .await?;
        Ok(())
    }
}
