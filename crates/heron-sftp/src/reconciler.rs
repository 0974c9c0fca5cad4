//! Account reconciliation
//!
//! NIST 800-53: AC-2 (Account Management)
//! Implementation: Converges OS users, groups and home directories towards
//! the desired state. The inventory group records which accounts are
//! managed here, so accounts that leave the desired state can be removed
//! without touching anything else on the host.
//!
//! Every step compares against what the host currently reports (passwd and
//! shadow entries, group entries, ownership and mode, key file content) and
//! only issues a command on a difference. A re-run on converged state, in
//! this process or a new one, is free of mutating commands.

use async_trait::async_trait;
use heron_core::{DesiredState, GroupAccount, Result, UserAccount};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::accounts::AccountDirectory;
use crate::authorized_keys::{AuthorizedKeys, KeyPaths};
use crate::events::{Event, EventHandler};
use crate::executor::CommandRunner;
use crate::ledger::PasswordLedger;
use crate::permissions::DirectoryManager;
use crate::store::ConfigurationStore;

/// Sentinel group listing every account this engine manages.
pub const INVENTORY_GROUP: &str = "sftp-user-inventory";

/// Name of the group synthesized for a user's requested primary GID.
pub fn virtual_group_name(gid: u32) -> String {
    format!("sftp-gid-{gid}")
}

/// Outcome counters of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub users_created: usize,
    pub users_deleted: usize,
    pub users_provisioned: usize,
    pub users_unchanged: usize,
    pub groups_created: usize,
    pub failures: usize,
}

pub struct AccountReconciler {
    accounts: AccountDirectory,
    directories: DirectoryManager,
    keys: AuthorizedKeys,
    store: Arc<ConfigurationStore>,
    home_base: PathBuf,
    passwords: PasswordLedger,
}

impl AccountReconciler {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        store: Arc<ConfigurationStore>,
        home_base: PathBuf,
        passwords: PasswordLedger,
    ) -> Self {
        Self {
            accounts: AccountDirectory::new(runner.clone()),
            directories: DirectoryManager::new(runner.clone()),
            keys: AuthorizedKeys::new(runner),
            store,
            home_base,
            passwords,
        }
    }

    pub fn home_of(&self, username: &str) -> PathBuf {
        self.home_base.join(username)
    }

    /// Prepare the home base and run the first pass.
    pub async fn startup(&self) -> Result<SyncReport> {
        debug!(
            "Ensuring '{}' directory exists and has correct permissions",
            self.home_base.display()
        );
        self.directories.ensure_directory(&self.home_base).await?;
        self.directories.chown(&self.home_base, "root:root").await?;
        self.sync(&self.store.get()).await
    }

    /// One full convergence pass over `state`.
    pub async fn sync(&self, state: &DesiredState) -> Result<SyncReport> {
        info!(users = state.users.len(), groups = state.groups.len(), "Synchronizing users and groups");
        let mut report = SyncReport::default();

        if !self.accounts.group_exists(INVENTORY_GROUP).await? {
            info!(group = INVENTORY_GROUP, "Creating inventory group");
            self.accounts.group_create(INVENTORY_GROUP, None).await?;
            report.groups_created += 1;
        }

        self.remove_stale_users(state, &mut report).await?;

        for gid in state.requested_gids() {
            let group = virtual_group_name(gid);
            match self.ensure_group(&group, Some(gid)).await {
                Ok(true) => report.groups_created += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(group = %group, error = %e, "Failed to create GID group");
                    report.failures += 1;
                }
            }
        }

        for user in &state.users {
            if let Err(e) = self.sync_user(user, &mut report).await {
                warn!(user = %user.username, error = %e, "Failed to synchronize user");
                report.failures += 1;
            }
        }

        for group in &state.groups {
            if let Err(e) = self.sync_group(group, &mut report).await {
                warn!(group = %group.name, error = %e, "Failed to synchronize group");
                report.failures += 1;
            }
        }

        info!(?report, "Synchronization complete");
        Ok(report)
    }

    async fn remove_stale_users(&self, state: &DesiredState, report: &mut SyncReport) -> Result<()> {
        let managed = self.accounts.group_list_users(INVENTORY_GROUP).await?;
        for username in managed {
            if state.user(&username).is_some() {
                continue;
            }
            debug!(user = %username, "Removing user");
            let output = self.accounts.user_delete(&username, false).await?;
            if output.success() {
                report.users_deleted += 1;
            } else {
                warn!(user = %username, output = %output.trimmed(), "Failed to remove user");
                report.failures += 1;
            }
            if let Err(e) = self.passwords.forget(&username).await {
                warn!(user = %username, error = %e, "Failed to update password ledger");
            }
        }
        Ok(())
    }

    /// Returns whether the group had to be created.
    async fn ensure_group(&self, group: &str, gid: Option<u32>) -> Result<bool> {
        if self.accounts.group_exists(group).await? {
            return Ok(false);
        }
        debug!(group = %group, ?gid, "Creating group");
        self.accounts.group_create(group, gid).await?;
        Ok(true)
    }

    async fn sync_user(&self, user: &UserAccount, report: &mut SyncReport) -> Result<()> {
        let username = user.username.as_str();
        debug!(user = %username, "Processing user");
        let home = self.home_of(username);

        let mut changed = false;
        if !self.accounts.user_exists(username).await? {
            debug!(user = %username, "Creating user");
            self.accounts.user_create(username, &home, user.gid).await?;
            self.accounts.group_add_user(INVENTORY_GROUP, username).await?;
            report.users_created += 1;
            changed = true;
        }

        changed |= self.sync_password(user).await?;

        if let Some(uid) = user.uid {
            if self.accounts.user_get_id(username).await? != uid {
                debug!(user = %username, uid, "Updating UID");
                self.accounts.user_set_id(username, uid).await?;
                changed = true;
            }
        }

        changed |= self.directories.ensure_directory(&home).await?;
        changed |= self.secure_home(&home).await?;

        let paths = KeyPaths::for_home(&home);
        self.directories.ensure_directory(&paths.keys_dir).await?;
        changed |= self.sync_authorized_keys(user, &paths).await?;

        if changed {
            report.users_provisioned += 1;
        } else {
            debug!(user = %username, "User is up to date");
            report.users_unchanged += 1;
        }
        Ok(())
    }

    /// Returns whether the password had to be set.
    async fn sync_password(&self, user: &UserAccount) -> Result<bool> {
        let username = user.username.as_str();
        let shadow = self.accounts.user_password_hash(username).await?;
        let current = match user.password.as_deref() {
            None => shadow.as_deref() == Some("*"),
            Some(hash) if user.password_is_encrypted => shadow.as_deref() == Some(hash),
            Some(password) => {
                self.passwords
                    .is_current(username, password, shadow.as_deref())
                    .await
            }
        };
        if current {
            return Ok(false);
        }

        debug!(user = %username, "Updating the password");
        self.accounts
            .user_set_password(username, user.password.as_deref(), user.password_is_encrypted)
            .await?;

        match user.password.as_deref() {
            Some(password) if !user.password_is_encrypted => {
                let shadow = self.accounts.user_password_hash(username).await?;
                self.passwords
                    .record(username, password, shadow.as_deref().unwrap_or_default())
                    .await?;
            }
            _ => self.passwords.forget(username).await?,
        }
        Ok(true)
    }

    /// Returns whether ownership or mode had to be corrected.
    async fn secure_home(&self, home: &Path) -> Result<bool> {
        let status = self.directories.status(home).await?;
        let mut changed = false;
        if !status
            .as_ref()
            .is_some_and(|s| s.owner == "root" && s.group == "root")
        {
            self.directories.chown(home, "root:root").await?;
            changed = true;
        }
        if !status.as_ref().is_some_and(|s| s.mode == "711") {
            self.directories.chmod(home, "711").await?;
            changed = true;
        }
        Ok(changed)
    }

    /// Returns whether the authorized keys file had to be rewritten.
    async fn sync_authorized_keys(&self, user: &UserAccount, paths: &KeyPaths) -> Result<bool> {
        let username = user.username.as_str();
        let desired = AuthorizedKeys::collect(&paths.keys_dir, &user.public_keys).await?;
        let existing = tokio::fs::read_to_string(&paths.authorized_keys).await.ok();
        if existing.as_deref() == Some(desired.as_str()) {
            let status = self.directories.status(&paths.authorized_keys).await?;
            if status.is_some_and(|s| s.owner == username && s.mode == "400") {
                return Ok(false);
            }
        }
        self.keys
            .write(username, &paths.authorized_keys, &desired)
            .await?;
        Ok(true)
    }

    async fn sync_group(&self, group: &GroupAccount, report: &mut SyncReport) -> Result<()> {
        debug!(group = %group.name, "Processing group");
        if self.ensure_group(&group.name, group.gid).await? {
            report.groups_created += 1;
        }

        if let Some(gid) = group.gid {
            if self.accounts.group_get_id(&group.name).await? != gid {
                debug!(group = %group.name, gid, "Updating GID");
                self.accounts.group_set_id(&group.name, gid).await?;
            }
        }

        let members = self.accounts.group_list_users(&group.name).await?;
        for username in group.members.iter().filter(|m| !members.contains(m)) {
            if !self.accounts.user_exists(username).await? {
                debug!(group = %group.name, user = %username, "Skipping unknown member");
                continue;
            }
            debug!(group = %group.name, user = %username, "Adding member");
            self.accounts.group_add_user(&group.name, username).await?;
        }
        for username in members.iter().filter(|m| !group.members.contains(m)) {
            debug!(group = %group.name, user = %username, "Removing member");
            self.accounts.group_remove_user(&group.name, username).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for AccountReconciler {
    fn name(&self) -> &'static str {
        "account-reconciler"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        if let Event::ConfigurationChanged { .. } = event {
            self.sync(&self.store.get()).await?;
        }
        Ok(())
    }
}
