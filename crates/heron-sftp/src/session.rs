//! Session preparation
//!
//! NIST 800-53: AC-3 (Access Enforcement), AC-6 (Least Privilege)
//! Implementation: When the PAM hook reports an opened session, the user's
//! chroot tree is (re)built on demand: the chroot root is root-owned, the
//! configured directories inside it are owned by the user. Users that are not
//! declared in the desired state (authenticated elsewhere) get the global
//! policy.

use heron_core::{HeronError, Result, UserAccount};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::authorized_keys::AuthorizedKeys;
use crate::events::{Event, EventBus};
use crate::executor::CommandRunner;
use crate::permissions::{
    DirectoryManager, is_descendant_of, normalize_path, resolve_chroot_template,
};
use crate::reconciler::INVENTORY_GROUP;
use crate::store::ConfigurationStore;

/// PAM `type` value that triggers preparation.
pub const OPEN_SESSION: &str = "open_session";

/// A notification from the PAM exec hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PamEvent {
    pub username: String,
    pub event_type: String,
    pub service: Option<String>,
}

impl PamEvent {
    pub fn new(username: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            event_type: event_type.into(),
            service: None,
        }
    }
}

pub struct SessionService {
    store: Arc<ConfigurationStore>,
    bus: Arc<EventBus>,
    directories: DirectoryManager,
    keys: AuthorizedKeys,
    home_base: PathBuf,
}

impl SessionService {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        store: Arc<ConfigurationStore>,
        bus: Arc<EventBus>,
        home_base: PathBuf,
    ) -> Self {
        Self {
            store,
            bus,
            directories: DirectoryManager::new(runner.clone()),
            keys: AuthorizedKeys::new(runner),
            home_base,
        }
    }

    /// Handle one PAM event. The return value is the acknowledgment sent back
    /// to the hook; `false` means the session should not be trusted.
    pub async fn handle(&self, event: PamEvent) -> bool {
        let username = event.username.trim();
        if username.is_empty() {
            warn!(event_type = %event.event_type, "Session event without a username");
            return false;
        }
        debug!(
            user = %username,
            event_type = %event.event_type,
            service = event.service.as_deref().unwrap_or_default(),
            "Received session event"
        );

        if event.event_type == OPEN_SESSION {
            if let Err(e) = self.prepare(username).await {
                error!(user = %username, error = %e, "Failed to prepare session");
                return false;
            }
        }

        let changed = Event::SessionChanged {
            username: username.to_string(),
            state: event.event_type.clone(),
        };
        if let Err(e) = self.bus.publish(&changed).await {
            warn!(user = %username, error = %e, "Session change handlers failed");
        }
        true
    }

    /// Build the chroot tree and authorized keys for `username`.
    pub async fn prepare(&self, username: &str) -> Result<PathBuf> {
        debug!(user = %username, "Configuring session");
        let state = self.store.get();
        let synthetic;
        let user = match state.user(username) {
            Some(user) => user,
            None => {
                synthetic = UserAccount::synthetic(username);
                &synthetic
            }
        };

        let home = self.home_base.join(username);
        let chroot = user.effective_chroot(&state.global);
        let chroot_root = normalize_path(Path::new(&resolve_chroot_template(
            &chroot.directory,
            &home.to_string_lossy(),
            username,
        )));
        if !chroot_root.is_absolute() {
            return Err(HeronError::Config(format!(
                "Chroot directory '{}' for user '{}' is not absolute",
                chroot_root.display(),
                username
            )));
        }

        self.directories.ensure_directory(&chroot_root).await?;
        self.directories.chown(&chroot_root, "root:root").await?;
        self.directories.chmod(&chroot_root, "755").await?;

        let owner = format!("{username}:{INVENTORY_GROUP}");
        let directories: BTreeSet<&str> = state
            .global
            .directories
            .iter()
            .chain(user.directories.iter())
            .map(String::as_str)
            .collect();
        for directory in directories {
            // An absolute entry replaces the chroot root and ends up outside it.
            let target = normalize_path(&chroot_root.join(directory));
            if let Err(e) = self.prepare_directory(&target, &chroot_root, &owner).await {
                warn!(
                    user = %username,
                    error = %e,
                    "Exception occurred while setting permissions for '{}'",
                    target.display()
                );
            }
        }

        self.keys.rewrite(username, &home, &user.public_keys).await?;
        info!(user = %username, "Session ready");
        Ok(chroot_root)
    }

    async fn prepare_directory(&self, target: &Path, chroot_root: &Path, owner: &str) -> Result<()> {
        if self.directories.ensure_directory(target).await? {
            debug!("Created directory '{}'", target.display());
        }
        if is_descendant_of(target, chroot_root) {
            self.directories.chown_chain(target, chroot_root, owner).await
        } else {
            warn!(
                "Directory '{}' is not within chroot path '{}'. Setting direct permissions.",
                target.display(),
                chroot_root.display()
            );
            self.directories.chown(target, owner).await
        }
    }
}
