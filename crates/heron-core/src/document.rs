//! Raw desired-state document as written by operators (`sftp.json`).
//!
//! Every field is optional. [`SftpDocument::validate`] fills the gaps and
//! produces the immutable [`DesiredState`]; it never fails.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

use crate::error::{HeronError, Result};
use crate::types::{
    ChrootPolicy, CryptoOverrides, DesiredState, GlobalPolicy, GroupAccount, HookLists,
    HostKeyMaterial, LoggingFilters, UserAccount, DEFAULT_CHROOT_DIRECTORY,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SftpDocument {
    pub global: Option<GlobalDocument>,
    pub users: Option<Vec<UserDocument>>,
    pub groups: Option<Vec<GroupDocument>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GlobalDocument {
    pub chroot: Option<ChrootDocument>,
    pub directories: Option<Vec<String>>,
    pub logging: Option<LoggingDocument>,
    pub host_keys: Option<HostKeysDocument>,
    pub hooks: Option<HooksDocument>,
    #[serde(rename = "PKIandPassword")]
    pub pki_and_password: Option<FlagValue>,
    pub ciphers: Option<String>,
    pub host_key_algorithms: Option<String>,
    pub kex_algorithms: Option<String>,
    #[serde(rename = "MACs")]
    pub macs: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ChrootDocument {
    pub directory: Option<String>,
    pub start_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LoggingDocument {
    pub ignore_no_identification_string: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HostKeysDocument {
    pub ed25519: Option<String>,
    pub rsa: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HooksDocument {
    pub on_server_startup: Option<Vec<String>>,
    pub on_session_change: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UserDocument {
    pub username: Option<String>,
    pub password: Option<String>,
    pub password_is_encrypted: bool,
    pub allowed_hosts: Option<Vec<String>>,
    #[serde(rename = "UID")]
    pub uid: Option<u32>,
    #[serde(rename = "GID")]
    pub gid: Option<u32>,
    pub chroot: Option<ChrootDocument>,
    pub directories: Option<Vec<String>>,
    pub public_keys: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GroupDocument {
    pub name: Option<String>,
    #[serde(rename = "GID")]
    pub gid: Option<u32>,
    pub users: Option<Vec<String>>,
}

/// A switch that older documents wrote as the string `"true"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Text(String),
}

impl FlagValue {
    pub fn is_enabled(&self) -> bool {
        match self {
            FlagValue::Bool(value) => *value,
            FlagValue::Text(text) => text.trim().eq_ignore_ascii_case("true"),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn clean_list(values: Option<Vec<String>>) -> Vec<String> {
    values
        .unwrap_or_default()
        .into_iter()
        .filter(|v| !v.trim().is_empty())
        .collect()
}

impl SftpDocument {
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HeronError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Apply defaults and normalisation rules, producing the snapshot the
    /// engine works from.
    pub fn validate(self) -> DesiredState {
        let global_doc = self.global.unwrap_or_default();
        let chroot_doc = global_doc.chroot.unwrap_or_default();

        let global_chroot = ChrootPolicy {
            directory: non_blank(chroot_doc.directory)
                .unwrap_or_else(|| DEFAULT_CHROOT_DIRECTORY.to_string()),
            start_path: non_blank(chroot_doc.start_path),
        };

        let host_keys = global_doc.host_keys.unwrap_or_default();
        let hooks = global_doc.hooks.unwrap_or_default();

        let global = GlobalPolicy {
            chroot: global_chroot,
            directories: clean_list(global_doc.directories),
            host_keys: HostKeyMaterial {
                ed25519: non_blank(host_keys.ed25519),
                rsa: non_blank(host_keys.rsa),
            },
            logging: LoggingFilters {
                ignore_no_identification_string: global_doc
                    .logging
                    .map(|l| l.ignore_no_identification_string)
                    .unwrap_or(false),
            },
            hooks: HookLists {
                on_server_startup: clean_list(hooks.on_server_startup),
                on_session_change: clean_list(hooks.on_session_change),
            },
            crypto: CryptoOverrides {
                ciphers: non_blank(global_doc.ciphers),
                host_key_algorithms: non_blank(global_doc.host_key_algorithms),
                kex_algorithms: non_blank(global_doc.kex_algorithms),
                macs: non_blank(global_doc.macs),
            },
            pki_and_password: global_doc
                .pki_and_password
                .map(|flag| flag.is_enabled())
                .unwrap_or(false),
        };

        let mut seen = HashSet::new();
        let mut users = Vec::new();
        for (index, user) in self.users.unwrap_or_default().into_iter().enumerate() {
            let Some(username) = non_blank(user.username).map(|u| u.trim().to_string()) else {
                warn!("Users[{}] has a null or whitespace username. Skipping user.", index);
                continue;
            };
            if !seen.insert(username.clone()) {
                warn!("Users[{}] duplicates username '{}'. Skipping user.", index, username);
                continue;
            }

            let chroot = user.chroot.unwrap_or_default();
            let resolved = ChrootPolicy {
                directory: non_blank(chroot.directory)
                    .unwrap_or_else(|| global.chroot.directory.clone()),
                start_path: non_blank(chroot.start_path).or_else(|| global.chroot.start_path.clone()),
            };
            let chroot = (resolved != global.chroot).then_some(resolved);

            users.push(UserAccount {
                username,
                password: user.password.filter(|p| !p.is_empty()),
                password_is_encrypted: user.password_is_encrypted,
                uid: user.uid,
                gid: user.gid,
                allowed_hosts: clean_list(user.allowed_hosts),
                chroot,
                directories: clean_list(user.directories),
                public_keys: clean_list(user.public_keys),
            });
        }

        let mut groups = Vec::new();
        for (index, group) in self.groups.unwrap_or_default().into_iter().enumerate() {
            let Some(name) = non_blank(group.name).map(|n| n.trim().to_string()) else {
                warn!("Groups[{}] has a null or whitespace name. Skipping group.", index);
                continue;
            };
            groups.push(GroupAccount {
                name,
                gid: group.gid,
                members: clean_list(group.users),
            });
        }

        info!("Configuration contains '{}' user(s)", users.len());

        DesiredState {
            global,
            users,
            groups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_defaults() {
        let state = SftpDocument::from_json("{}").unwrap().validate();
        assert_eq!(state.global.chroot.directory, "%h");
        assert_eq!(state.global.chroot.start_path, None);
        assert!(state.users.is_empty());
        assert!(state.groups.is_empty());
        assert!(!state.global.pki_and_password);
    }

    #[test]
    fn test_null_sections_are_defaulted() {
        let json = r#"{ "Global": null, "Users": null, "Groups": null }"#;
        let state = SftpDocument::from_json(json).unwrap().validate();
        assert_eq!(state.global.chroot.directory, "%h");
    }

    #[test]
    fn test_blank_start_path_becomes_none() {
        let json = r#"{ "Global": { "Chroot": { "Directory": "/srv/%u", "StartPath": "  " } } }"#;
        let state = SftpDocument::from_json(json).unwrap().validate();
        assert_eq!(state.global.chroot.directory, "/srv/%u");
        assert_eq!(state.global.chroot.start_path, None);
    }

    #[test]
    fn test_blank_usernames_dropped() {
        let json = r#"{ "Users": [ { "Username": " " }, { "Username": "alice" }, {} ] }"#;
        let state = SftpDocument::from_json(json).unwrap().validate();
        assert_eq!(state.usernames().collect::<Vec<_>>(), vec!["alice"]);
    }

    #[test]
    fn test_duplicate_usernames_keep_first() {
        let json = r#"{ "Users": [
            { "Username": "alice", "UID": 1001 },
            { "Username": "alice", "UID": 2002 }
        ] }"#;
        let state = SftpDocument::from_json(json).unwrap().validate();
        assert_eq!(state.users.len(), 1);
        assert_eq!(state.users[0].uid, Some(1001));
    }

    #[test]
    fn test_user_chroot_equal_to_global_collapses() {
        let json = r#"{
            "Global": { "Chroot": { "Directory": "%h", "StartPath": "sftp" } },
            "Users": [
                { "Username": "same", "Chroot": { "Directory": "%h" } },
                { "Username": "unset" },
                { "Username": "start", "Chroot": { "StartPath": "other" } },
                { "Username": "dir", "Chroot": { "Directory": "/alt/%u" } }
            ]
        }"#;
        let state = SftpDocument::from_json(json).unwrap().validate();
        assert!(state.user("same").unwrap().chroot.is_none());
        assert!(state.user("unset").unwrap().chroot.is_none());

        let start = state.user("start").unwrap().chroot.clone().unwrap();
        assert_eq!(start.directory, "%h");
        assert_eq!(start.start_path.as_deref(), Some("other"));

        let dir = state.user("dir").unwrap().chroot.clone().unwrap();
        assert_eq!(dir.directory, "/alt/%u");
        assert_eq!(dir.start_path.as_deref(), Some("sftp"));
    }

    #[test]
    fn test_pki_and_password_accepts_string_or_bool() {
        let text = r#"{ "Global": { "PKIandPassword": "true" } }"#;
        assert!(SftpDocument::from_json(text).unwrap().validate().global.pki_and_password);

        let boolean = r#"{ "Global": { "PKIandPassword": true } }"#;
        assert!(SftpDocument::from_json(boolean).unwrap().validate().global.pki_and_password);

        let other = r#"{ "Global": { "PKIandPassword": "yes" } }"#;
        assert!(!SftpDocument::from_json(other).unwrap().validate().global.pki_and_password);
    }

    #[test]
    fn test_full_user_fields() {
        let json = r#"{ "Users": [ {
            "Username": "alice",
            "Password": "$6$hash",
            "PasswordIsEncrypted": true,
            "UID": 1500,
            "GID": 2500,
            "AllowedHosts": ["10.0.0.0/8"],
            "Directories": ["inbox", ""],
            "PublicKeys": ["ssh-ed25519 AAAA alice@laptop"]
        } ],
        "Groups": [ { "Name": "staff", "GID": 3000, "Users": ["alice"] }, { "Name": "" } ] }"#;
        let state = SftpDocument::from_json(json).unwrap().validate();
        let alice = state.user("alice").unwrap();
        assert_eq!(alice.password.as_deref(), Some("$6$hash"));
        assert!(alice.password_is_encrypted);
        assert_eq!(alice.uid, Some(1500));
        assert_eq!(alice.gid, Some(2500));
        assert_eq!(alice.directories, vec!["inbox"]);
        assert_eq!(alice.public_keys.len(), 1);

        assert_eq!(state.groups.len(), 1);
        assert_eq!(state.groups[0].members, vec!["alice"]);
    }

    #[test]
    fn test_empty_password_is_cleared() {
        let json = r#"{ "Users": [ { "Username": "alice", "Password": "" } ] }"#;
        let state = SftpDocument::from_json(json).unwrap().validate();
        assert!(state.user("alice").unwrap().password.is_none());
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(SftpDocument::from_json("{ not json").is_err());
    }
}
