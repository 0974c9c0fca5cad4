//! sshd configuration rendering
//!
//! Pure translation of a [`DesiredState`] into `sshd_config` text. The daemon
//! applies the last `Match` block that matches a session, so per-user blocks
//! are written first, in document order, followed by the catch-all block.

use heron_core::{ChrootPolicy, DesiredState};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::host_keys::HOST_KEY_TYPES;
use crate::permissions::expand_chroot_directive;

const STANDARD_DECLARATIONS: [&str; 2] = ["X11Forwarding no", "AllowTcpForwarding no"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchCriteria {
    All,
    User,
    Group,
}

impl fmt::Display for MatchCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchCriteria::All => write!(f, "All"),
            MatchCriteria::User => write!(f, "User"),
            MatchCriteria::Group => write!(f, "Group"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchBlock {
    pub criteria: MatchCriteria,
    pub patterns: Vec<String>,
    pub excepts: Vec<String>,
    pub declarations: Vec<String>,
}

impl MatchBlock {
    pub fn user(pattern: impl Into<String>) -> Self {
        Self {
            criteria: MatchCriteria::User,
            patterns: vec![pattern.into()],
            excepts: Vec::new(),
            declarations: Vec::new(),
        }
    }

    /// Standard SFTP-only declarations confined to `chroot_directory`.
    #[must_use]
    pub fn with_chroot(mut self, chroot_directory: &str, start_path: Option<&str>) -> Self {
        self.declarations
            .extend(STANDARD_DECLARATIONS.iter().map(|d| (*d).to_string()));
        self.declarations
            .push(format!("ChrootDirectory {chroot_directory}"));
        self.declarations.push(match start_path {
            Some(start) => format!("ForceCommand internal-sftp -d {start}"),
            None => "ForceCommand internal-sftp".to_string(),
        });
        self
    }

    fn pattern_list(&self) -> String {
        let mut seen = Vec::new();
        let includes = self.patterns.iter().map(|p| p.trim().to_string());
        let excludes = self.excepts.iter().map(|p| format!("!{}", p.trim()));
        for pattern in includes.chain(excludes) {
            if pattern.trim_start_matches('!').is_empty() || seen.contains(&pattern) {
                continue;
            }
            seen.push(pattern);
        }
        seen.join(",")
    }
}

impl fmt::Display for MatchBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.criteria {
            MatchCriteria::All => writeln!(f, "Match All")?,
            criteria => writeln!(f, "Match {} {}", criteria, self.pattern_list())?,
        }
        for declaration in self.declarations.iter().filter(|d| !d.trim().is_empty()) {
            writeln!(f, "    {}", declaration.trim())?;
        }
        Ok(())
    }
}

/// Filesystem locations the rendered text refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderContext {
    /// Directory holding the live host keys.
    pub host_key_dir: PathBuf,
    /// Parent of every user's home directory.
    pub home_base: PathBuf,
}

impl Default for RenderContext {
    fn default() -> Self {
        Self {
            host_key_dir: PathBuf::from("/etc/ssh"),
            home_base: PathBuf::from("/home"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshdConfig {
    pub host_keys: Vec<PathBuf>,
    pub ciphers: Option<String>,
    pub host_key_algorithms: Option<String>,
    pub kex_algorithms: Option<String>,
    pub macs: Option<String>,
    pub allow_users: Vec<String>,
    pub pki_and_password: bool,
    pub match_blocks: Vec<MatchBlock>,
}

fn chroot_block(pattern: &str, directory: &str, chroot: &ChrootPolicy) -> MatchBlock {
    MatchBlock::user(pattern).with_chroot(directory, chroot.start_path.as_deref())
}

impl SshdConfig {
    pub fn from_state(state: &DesiredState, context: &RenderContext) -> Self {
        let global = &state.global;

        let mut match_blocks: Vec<MatchBlock> = state
            .users
            .iter()
            .filter_map(|user| {
                let chroot = user.chroot.as_ref()?;
                let home = home_of(&context.home_base, &user.username);
                let directory = expand_chroot_directive(
                    &chroot.directory,
                    &home.to_string_lossy(),
                    &user.username,
                );
                Some(chroot_block(&user.username, &directory, chroot))
            })
            .collect();
        match_blocks.push(chroot_block("*", &global.chroot.directory, &global.chroot));

        Self {
            host_keys: HOST_KEY_TYPES
                .iter()
                .map(|key| context.host_key_dir.join(key.file_name))
                .collect(),
            ciphers: global.crypto.ciphers.clone(),
            host_key_algorithms: global.crypto.host_key_algorithms.clone(),
            kex_algorithms: global.crypto.kex_algorithms.clone(),
            macs: global.crypto.macs.clone(),
            allow_users: state.users.iter().map(|u| u.allow_pattern()).collect(),
            pki_and_password: global.pki_and_password,
            match_blocks,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl fmt::Display for SshdConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# Managed by heron. Local changes are overwritten.")?;
        writeln!(f, "UsePAM yes")?;
        writeln!(f)?;
        writeln!(f, "# SSH Protocol")?;
        writeln!(f, "Protocol 2")?;
        writeln!(f)?;
        writeln!(f, "# Host Keys")?;
        for key in &self.host_keys {
            writeln!(f, "HostKey {}", key.display())?;
        }
        writeln!(f)?;
        writeln!(f, "# Cryptographic policy")?;
        let overrides = [
            ("Ciphers", &self.ciphers),
            ("HostKeyAlgorithms", &self.host_key_algorithms),
            ("KexAlgorithms", &self.kex_algorithms),
            ("MACs", &self.macs),
        ];
        for (keyword, value) in overrides {
            if let Some(value) = non_empty(value) {
                writeln!(f, "{keyword} {value}")?;
            }
        }
        writeln!(f)?;
        writeln!(f, "# Disable DNS for fast connections")?;
        writeln!(f, "UseDNS no")?;
        writeln!(f)?;
        writeln!(f, "# Logging")?;
        writeln!(f, "LogLevel INFO")?;
        writeln!(f)?;
        writeln!(f, "# Subsystem")?;
        writeln!(f, "Subsystem sftp internal-sftp")?;
        writeln!(f)?;
        writeln!(f, "# Allowed users")?;
        // sshd rejects an AllowUsers line without arguments
        if !self.allow_users.is_empty() {
            writeln!(f, "AllowUsers {}", self.allow_users.join(" "))?;
        }
        writeln!(f)?;
        if self.pki_and_password {
            writeln!(f, "AuthenticationMethods \"publickey,password\"")?;
            writeln!(f)?;
        }
        writeln!(f, "# Match blocks")?;
        for block in &self.match_blocks {
            write!(f, "{block}")?;
            writeln!(f)?;
        }
        Ok(())
    }
}

pub fn home_of(home_base: &Path, username: &str) -> PathBuf {
    home_base.join(username)
}

/// Render the daemon configuration for `state`.
pub fn render(state: &DesiredState, context: &RenderContext) -> String {
    SshdConfig::from_state(state, context).to_string()
}
