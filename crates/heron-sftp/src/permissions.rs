//! Directory creation, chroot template expansion and ownership chains.

use heron_core::Result;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::executor::{CommandRunner, CommandSpec};

fn substitute(template: &str, token: &str, value: &str, escape_as: &str) -> String {
    let escaped = format!("%{token}");
    template
        .split(escaped.as_str())
        .map(|part| part.replace(token, value))
        .collect::<Vec<_>>()
        .join(escape_as)
}

/// Expand a chroot template into a filesystem path.
///
/// `%h` becomes `home` and `%u` becomes `username`. The doubled forms `%%h`
/// and `%%u` are escapes and come out as the literal text `%h` / `%u`, the
/// same way the daemon reads them.
pub fn resolve_chroot_template(template: &str, home: &str, username: &str) -> String {
    let with_home = substitute(template, "%h", home, "%h");
    substitute(&with_home, "%u", username, "%u")
}

/// Expand a chroot template for one user but keep the escapes, producing text
/// that is still valid as a daemon `ChrootDirectory` argument.
pub fn expand_chroot_directive(template: &str, home: &str, username: &str) -> String {
    let with_home = substitute(template, "%h", home, "%%h");
    substitute(&with_home, "%u", username, "%%u")
}

/// Lexically resolve `.` and `..` without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if normalized.file_name().is_some() {
                    normalized.pop();
                } else if !normalized.has_root() {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// True when `path` lies strictly below `root`.
pub fn is_descendant_of(path: &Path, root: &Path) -> bool {
    let path = normalize_path(path);
    let root = normalize_path(root);
    path != root && path.starts_with(&root)
}

/// Owner, group and octal permission bits of a path as `stat` reports them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStatus {
    pub owner: String,
    pub group: String,
    pub mode: String,
}

impl PathStatus {
    /// Parse `stat -c '%U:%G %a'` output.
    pub fn parse(text: &str) -> Option<Self> {
        let (ownership, mode) = text.trim().split_once(' ')?;
        let (owner, group) = ownership.split_once(':')?;
        let mode = mode.trim();
        if owner.is_empty() || group.is_empty() || mode.is_empty() || !mode.chars().all(|c| c.is_digit(8)) {
            return None;
        }
        Some(Self {
            owner: owner.to_string(),
            group: group.to_string(),
            mode: mode.to_string(),
        })
    }
}

/// Filesystem side of provisioning. Ownership and mode changes go through the
/// command runner so they share its timeout and logging.
#[derive(Clone)]
pub struct DirectoryManager {
    runner: Arc<dyn CommandRunner>,
}

impl DirectoryManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Create `path` and its parents. Returns whether anything was created.
    pub async fn ensure_directory(&self, path: &Path) -> Result<bool> {
        if tokio::fs::try_exists(path).await? {
            return Ok(false);
        }
        debug!("Creating directory '{}'", path.display());
        tokio::fs::create_dir_all(path).await?;
        Ok(true)
    }

    /// Current ownership and mode of `path`, `None` when it cannot be read.
    pub async fn status(&self, path: &Path) -> Result<Option<PathStatus>> {
        let output = self
            .runner
            .run(
                CommandSpec::new("stat")
                    .args(["-c", "%U:%G %a"])
                    .arg(path.to_string_lossy())
                    .tolerant(),
            )
            .await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(PathStatus::parse(output.trimmed()))
    }

    pub async fn chown(&self, path: &Path, owner: &str) -> Result<()> {
        self.runner
            .run(CommandSpec::new("chown").arg(owner).arg(path.to_string_lossy()))
            .await?;
        Ok(())
    }

    pub async fn chmod(&self, path: &Path, mode: &str) -> Result<()> {
        self.runner
            .run(CommandSpec::new("chmod").arg(mode).arg(path.to_string_lossy()))
            .await?;
        Ok(())
    }

    /// Give `owner` every directory from `leaf` up to, but not including,
    /// `stop_at`. `leaf` must be a descendant of `stop_at`.
    pub async fn chown_chain(&self, leaf: &Path, stop_at: &Path, owner: &str) -> Result<()> {
        let stop_at = normalize_path(stop_at);
        let mut current = normalize_path(leaf);
        while current != stop_at && current.starts_with(&stop_at) {
            self.chown(&current, owner).await?;
            if !current.pop() {
                break;
            }
        }
        Ok(())
    }
}
