use serde::Serialize;
use std::fmt;

/// Chroot directory template used when neither the document nor the user sets one.
pub const DEFAULT_CHROOT_DIRECTORY: &str = "%h";

/// Chroot confinement for a session.
///
/// `directory` is a template: `%h` expands to the user's home and `%u` to the
/// username, while `%%h` / `%%u` stay literal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChrootPolicy {
    pub directory: String,
    pub start_path: Option<String>,
}

impl Default for ChrootPolicy {
    fn default() -> Self {
        Self {
            directory: DEFAULT_CHROOT_DIRECTORY.to_string(),
            start_path: None,
        }
    }
}

/// Literal host key material supplied by the document, keyed by algorithm.
#[derive(Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostKeyMaterial {
    pub ed25519: Option<String>,
    pub rsa: Option<String>,
}

impl fmt::Debug for HostKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostKeyMaterial")
            .field("ed25519", &self.ed25519.as_ref().map(|_| "<redacted>"))
            .field("rsa", &self.rsa.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoggingFilters {
    /// Drop the daemon's "Did not receive identification string" noise.
    pub ignore_no_identification_string: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HookLists {
    pub on_server_startup: Vec<String>,
    pub on_session_change: Vec<String>,
}

/// Algorithm list overrides written verbatim into the daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CryptoOverrides {
    pub ciphers: Option<String>,
    pub host_key_algorithms: Option<String>,
    pub kex_algorithms: Option<String>,
    pub macs: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GlobalPolicy {
    pub chroot: ChrootPolicy,
    pub directories: Vec<String>,
    pub host_keys: HostKeyMaterial,
    pub logging: LoggingFilters,
    pub hooks: HookLists,
    pub crypto: CryptoOverrides,
    /// Require both public key and password authentication.
    pub pki_and_password: bool,
}

#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct UserAccount {
    pub username: String,
    pub password: Option<String>,
    pub password_is_encrypted: bool,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub allowed_hosts: Vec<String>,
    /// `None` means the global chroot policy applies.
    pub chroot: Option<ChrootPolicy>,
    pub directories: Vec<String>,
    pub public_keys: Vec<String>,
}

impl UserAccount {
    /// A record for an account that is not declared in the document, e.g. a
    /// user authenticated by an external directory service.
    pub fn synthetic(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: None,
            password_is_encrypted: false,
            uid: None,
            gid: None,
            allowed_hosts: Vec::new(),
            chroot: None,
            directories: Vec::new(),
            public_keys: Vec::new(),
        }
    }

    pub fn effective_chroot<'a>(&'a self, global: &'a GlobalPolicy) -> &'a ChrootPolicy {
        self.chroot.as_ref().unwrap_or(&global.chroot)
    }

    /// Entry for the daemon's `AllowUsers` directive.
    pub fn allow_pattern(&self) -> String {
        if self.allowed_hosts.is_empty() {
            self.username.clone()
        } else {
            format!("{}@{}", self.username, self.allowed_hosts.join(","))
        }
    }
}

impl fmt::Debug for UserAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserAccount")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("password_is_encrypted", &self.password_is_encrypted)
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("allowed_hosts", &self.allowed_hosts)
            .field("chroot", &self.chroot)
            .field("directories", &self.directories)
            .field("public_keys", &self.public_keys.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupAccount {
    pub name: String,
    pub gid: Option<u32>,
    pub members: Vec<String>,
}

/// The validated, immutable snapshot the whole engine converges towards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DesiredState {
    pub global: GlobalPolicy,
    pub users: Vec<UserAccount>,
    pub groups: Vec<GroupAccount>,
}

impl DesiredState {
    pub fn user(&self, username: &str) -> Option<&UserAccount> {
        self.users.iter().find(|u| u.username == username)
    }

    pub fn usernames(&self) -> impl Iterator<Item = &str> {
        self.users.iter().map(|u| u.username.as_str())
    }

    /// Distinct primary GIDs requested by users, in first-seen order.
    pub fn requested_gids(&self) -> Vec<u32> {
        let mut gids = Vec::new();
        for gid in self.users.iter().filter_map(|u| u.gid) {
            if !gids.contains(&gid) {
                gids.push(gid);
            }
        }
        gids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_pattern() {
        let mut user = UserAccount::synthetic("alice");
        assert_eq!(user.allow_pattern(), "alice");

        user.allowed_hosts = vec!["10.0.0.1".into(), "example.org".into()];
        assert_eq!(user.allow_pattern(), "alice@10.0.0.1,example.org");
    }

    #[test]
    fn test_effective_chroot_inherits_global() {
        let global = GlobalPolicy::default();
        let mut user = UserAccount::synthetic("bob");
        assert_eq!(user.effective_chroot(&global).directory, "%h");

        user.chroot = Some(ChrootPolicy {
            directory: "/srv/%u".into(),
            start_path: Some("data".into()),
        });
        assert_eq!(user.effective_chroot(&global).directory, "/srv/%u");
    }

    #[test]
    fn test_requested_gids_deduplicated() {
        let mut state = DesiredState::default();
        for (name, gid) in [("a", Some(2000)), ("b", None), ("c", Some(2000)), ("d", Some(3000))] {
            let mut user = UserAccount::synthetic(name);
            user.gid = gid;
            state.users.push(user);
        }
        assert_eq!(state.requested_gids(), vec![2000, 3000]);
    }

    #[test]
    fn test_debug_redacts_password() {
        let mut user = UserAccount::synthetic("alice");
        user.password = Some("hunter2".into());
        let rendered = format!("{user:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
