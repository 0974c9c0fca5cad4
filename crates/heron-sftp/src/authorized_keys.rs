//! Authorized keys management
//!
//! NIST 800-53: AC-2 (Account Management), IA-2 (Identification and Authentication)
//! Implementation: A user's `authorized_keys` is regenerated from scratch out
//! of the files dropped into `~/.ssh/keys` plus the literal keys declared in
//! the desired state. The result is owned by the user and read-only.

use heron_core::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::executor::{CommandRunner, CommandSpec};

/// Locations of one user's key material below their home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPaths {
    pub ssh_dir: PathBuf,
    pub keys_dir: PathBuf,
    pub authorized_keys: PathBuf,
}

impl KeyPaths {
    pub fn for_home(home: &Path) -> Self {
        let ssh_dir = home.join(".ssh");
        Self {
            keys_dir: ssh_dir.join("keys"),
            authorized_keys: ssh_dir.join("authorized_keys"),
            ssh_dir,
        }
    }
}

/// Number of entries in authorized_keys text, ignoring blanks and comments.
pub fn count_keys(content: &str) -> usize {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .count()
}

#[derive(Clone)]
pub struct AuthorizedKeys {
    runner: Arc<dyn CommandRunner>,
}

impl AuthorizedKeys {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Build the file content: imported key files in name order, then the
    /// literal keys. A missing import directory contributes nothing.
    pub async fn collect(keys_dir: &Path, public_keys: &[String]) -> Result<String> {
        let mut files = Vec::new();
        if tokio::fs::try_exists(keys_dir).await? {
            let mut entries = tokio::fs::read_dir(keys_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_file() {
                    files.push(entry.path());
                }
            }
        }
        files.sort();

        let mut content = String::new();
        for file in &files {
            debug!("Adding public key '{}'", file.display());
            let key = tokio::fs::read_to_string(file).await?;
            content.push_str(key.trim_end());
            content.push('\n');
        }
        for key in public_keys {
            content.push_str(key.trim());
            content.push('\n');
        }
        Ok(content)
    }

    /// Replace `path` with `content`, then hand it to `username` as mode 400.
    pub async fn write(&self, username: &str, path: &Path, content: &str) -> Result<()> {
        // The previous file is mode 400; remove instead of truncating.
        if tokio::fs::try_exists(path).await? {
            tokio::fs::remove_file(path).await?;
        }
        tokio::fs::write(path, content).await?;

        let path_arg = path.to_string_lossy().into_owned();
        self.runner
            .run(CommandSpec::new("chown").args([username, path_arg.as_str()]))
            .await?;
        self.runner
            .run(CommandSpec::new("chmod").args(["400", path_arg.as_str()]))
            .await?;

        info!(user = %username, keys = count_keys(content), "Authorized keys updated");
        Ok(())
    }

    /// Regenerate the authorized keys file below `home`.
    pub async fn rewrite(&self, username: &str, home: &Path, public_keys: &[String]) -> Result<()> {
        let paths = KeyPaths::for_home(home);
        tokio::fs::create_dir_all(&paths.keys_dir).await?;
        let content = Self::collect(&paths.keys_dir, public_keys).await?;
        self.write(username, &paths.authorized_keys, &content).await
    }
}
