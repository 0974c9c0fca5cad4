//! Host key provisioning
//!
//! NIST 800-53: SC-12 (Cryptographic Key Establishment and Management)
//! Implementation: Keys live in an import directory that survives restarts.
//! Missing keys are written from literal material or generated, then every
//! file in the import directory is installed into the daemon's key directory,
//! root-owned and owner-only.

use heron_core::{HeronError, HostKeyMaterial, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::executor::{CommandRunner, CommandSpec};

/// One host key algorithm the daemon is configured with.
pub struct HostKeyType {
    pub name: &'static str,
    pub file_name: &'static str,
    /// `ssh-keygen` arguments preceding `-f <path> -N ""`.
    pub keygen_args: &'static [&'static str],
    pub material: fn(&HostKeyMaterial) -> Option<&str>,
}

fn ed25519_material(keys: &HostKeyMaterial) -> Option<&str> {
    keys.ed25519.as_deref()
}

fn rsa_material(keys: &HostKeyMaterial) -> Option<&str> {
    keys.rsa.as_deref()
}

/// Required key types, in the order the daemon configuration lists them.
pub const HOST_KEY_TYPES: [HostKeyType; 2] = [
    HostKeyType {
        name: "ed25519",
        file_name: "ssh_host_ed25519_key",
        keygen_args: &["-t", "ed25519"],
        material: ed25519_material,
    },
    HostKeyType {
        name: "rsa",
        file_name: "ssh_host_rsa_key",
        keygen_args: &["-t", "rsa", "-b", "4096"],
        material: rsa_material,
    },
];

fn host_key_error(action: &str, path: &Path, error: impl std::fmt::Display) -> HeronError {
    HeronError::HostKey(format!("{} '{}': {}", action, path.display(), error))
}

#[derive(Clone)]
pub struct HostKeyManager {
    runner: Arc<dyn CommandRunner>,
    import_dir: PathBuf,
    live_dir: PathBuf,
}

impl HostKeyManager {
    pub fn new(runner: Arc<dyn CommandRunner>, import_dir: PathBuf, live_dir: PathBuf) -> Self {
        Self {
            runner,
            import_dir,
            live_dir,
        }
    }

    pub fn live_dir(&self) -> &Path {
        &self.live_dir
    }

    /// Make sure every required key exists in the import directory and
    /// install the directory's contents. Any failure is fatal to the caller.
    pub async fn refresh(&self, material: &HostKeyMaterial) -> Result<()> {
        debug!("Updating host key files");
        tokio::fs::create_dir_all(&self.import_dir)
            .await
            .map_err(|e| host_key_error("Cannot create", &self.import_dir, e))?;

        for key_type in &HOST_KEY_TYPES {
            self.ensure_key(key_type, material).await?;
        }
        self.install().await
    }

    async fn ensure_key(&self, key_type: &HostKeyType, material: &HostKeyMaterial) -> Result<()> {
        let path = self.import_dir.join(key_type.file_name);
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| host_key_error("Cannot inspect", &path, e))?
        {
            return Ok(());
        }

        match (key_type.material)(material).map(str::trim).filter(|m| !m.is_empty()) {
            Some(literal) => {
                debug!(key = key_type.name, "Writing host key file '{}' from config", path.display());
                tokio::fs::write(&path, format!("{literal}\n"))
                    .await
                    .map_err(|e| host_key_error("Cannot write", &path, e))?;
            }
            None => {
                debug!(key = key_type.name, "Generating host key file '{}'", path.display());
                self.runner
                    .run(
                        CommandSpec::new("ssh-keygen")
                            .args(key_type.keygen_args.iter().copied())
                            .arg("-f")
                            .arg(path.to_string_lossy())
                            .args(["-N", ""]),
                    )
                    .await
                    .map_err(|e| host_key_error("Cannot generate", &path, e))?;
            }
        }
        Ok(())
    }

    async fn install(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.import_dir)
            .await
            .map_err(|e| host_key_error("Cannot list", &self.import_dir, e))?;

        let mut sources = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| host_key_error("Cannot list", &self.import_dir, e))?
        {
            if entry.file_type().await.is_ok_and(|t| t.is_file()) {
                sources.push(entry.path());
            }
        }
        sources.sort();

        tokio::fs::create_dir_all(&self.live_dir)
            .await
            .map_err(|e| host_key_error("Cannot create", &self.live_dir, e))?;

        for source in &sources {
            let Some(file_name) = source.file_name() else {
                continue;
            };
            let target = self.live_dir.join(file_name);
            debug!("Copying '{}' to '{}'", source.display(), target.display());
            tokio::fs::copy(source, &target)
                .await
                .map_err(|e| host_key_error("Cannot copy", &target, e))?;

            let target_arg = target.to_string_lossy().into_owned();
            for spec in [
                CommandSpec::new("chown").args(["root:root", target_arg.as_str()]),
                CommandSpec::new("chmod").args(["700", target_arg.as_str()]),
            ] {
                self.runner
                    .run(spec)
                    .await
                    .map_err(|e| host_key_error("Cannot secure", &target, e))?;
            }
        }

        info!(count = sources.len(), "Host keys installed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_table_order_and_material() {
        let material = HostKeyMaterial {
            ed25519: Some("ed-key".into()),
            rsa: None,
        };
        assert_eq!(HOST_KEY_TYPES[0].file_name, "ssh_host_ed25519_key");
        assert_eq!(HOST_KEY_TYPES[1].file_name, "ssh_host_rsa_key");
        assert_eq!((HOST_KEY_TYPES[0].material)(&material), Some("ed-key"));
        assert_eq!((HOST_KEY_TYPES[1].material)(&material), None);
        assert!(HOST_KEY_TYPES[1].keygen_args.contains(&"4096"));
    }
}
