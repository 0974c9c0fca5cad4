//! Password ledger
//!
//! NIST 800-53: IA-5 (Authenticator Management)
//! Implementation: A clear-text password cannot be compared with the shadow
//! hash it produced, so every clear-text password set here is recorded as a
//! salted digest together with the shadow hash that resulted. A later pass
//! treats the password as current only while both still match. The ledger is
//! a root-only JSON file and survives restarts.

use heron_core::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// File name of the ledger inside the state directory.
pub const LEDGER_FILE: &str = "passwords.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordStamp {
    /// Digest of the clear-text password that was set.
    pub digest: String,
    /// Shadow password field right after it was set.
    pub shadow: String,
}

/// Digest of `password` salted with `username`.
pub fn password_digest(username: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update([0u8]);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct PasswordLedger {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, PasswordStamp>>,
}

impl PasswordLedger {
    /// Open the ledger below `state_dir`. A missing or unreadable file starts
    /// an empty ledger, which only costs one extra password update per user.
    pub async fn open(state_dir: &Path) -> Self {
        let path = state_dir.join(LEDGER_FILE);
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable password ledger");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `password` is what was last set for `username` and the shadow
    /// entry has not changed since.
    pub async fn is_current(&self, username: &str, password: &str, shadow: Option<&str>) -> bool {
        let entries = self.entries.lock().await;
        match (entries.get(username), shadow) {
            (Some(stamp), Some(shadow)) => {
                stamp.shadow == shadow && stamp.digest == password_digest(username, password)
            }
            _ => false,
        }
    }

    pub async fn record(&self, username: &str, password: &str, shadow: &str) -> Result<()> {
        let stamp = PasswordStamp {
            digest: password_digest(username, password),
            shadow: shadow.to_string(),
        };
        let mut entries = self.entries.lock().await;
        entries.insert(username.to_string(), stamp);
        self.save(&entries).await
    }

    /// Drop `username`. Nothing is written when it was not recorded.
    pub async fn forget(&self, username: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.remove(username).is_some() {
            self.save(&entries).await?;
        }
        Ok(())
    }

    async fn save(&self, entries: &BTreeMap<String, PasswordStamp>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_vec_pretty(entries)?).await?;
        tokio::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600)).await?;
        debug!(path = %self.path.display(), users = entries.len(), "Password ledger saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_digest_is_salted_by_username() {
        assert_eq!(password_digest("alice", "secret"), password_digest("alice", "secret"));
        assert_ne!(password_digest("alice", "secret"), password_digest("bob", "secret"));
    }

    #[tokio::test]
    async fn test_recorded_password_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let ledger = PasswordLedger::open(dir.path()).await;
        ledger.record("alice", "secret", "$6$salt$hash").await.unwrap();

        let reopened = PasswordLedger::open(dir.path()).await;
        assert!(reopened.is_current("alice", "secret", Some("$6$salt$hash")).await);
        assert!(!reopened.is_current("alice", "other", Some("$6$salt$hash")).await);
        assert!(!reopened.is_current("alice", "secret", Some("$6$salt$changed")).await);
        assert!(!reopened.is_current("alice", "secret", None).await);

        let mode = std::fs::metadata(reopened.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_forget_and_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let ledger = PasswordLedger::open(dir.path()).await;
        ledger.record("alice", "secret", "x").await.unwrap();
        ledger.forget("alice").await.unwrap();
        assert!(!ledger.is_current("alice", "secret", Some("x")).await);

        std::fs::write(dir.path().join(LEDGER_FILE), "not json").unwrap();
        let reopened = PasswordLedger::open(dir.path()).await;
        assert!(!reopened.is_current("alice", "secret", Some("x")).await);
    }
}
