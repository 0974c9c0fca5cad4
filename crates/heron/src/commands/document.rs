use anyhow::{Context, Result};
use heron_core::{DesiredState, SftpDocument};
use heron_sftp::sshd_config::{self, RenderContext};
use std::path::{Path, PathBuf};

use crate::config;

async fn load_document(config_path: &Path, document: Option<PathBuf>) -> Result<(heron_sftp::Config, DesiredState)> {
    let config = config::load_config(config_path).await?;
    let path = document.unwrap_or_else(|| config.desired_state_path.clone());
    let state = SftpDocument::from_file(&path)
        .with_context(|| format!("Failed to load desired state from {}", path.display()))?
        .validate();
    Ok((config, state))
}

/// Print the daemon configuration a document would produce.
pub async fn render(config_path: &Path, document: Option<PathBuf>) -> Result<()> {
    let (config, state) = load_document(config_path, document).await?;
    let context = RenderContext {
        host_key_dir: config.paths.ssh_dir.clone(),
        home_base: config.paths.home_base.clone(),
    };
    print!("{}", sshd_config::render(&state, &context));
    Ok(())
}

pub async fn check(config_path: &Path, document: Option<PathBuf>) -> Result<()> {
    let (_, state) = load_document(config_path, document).await?;
    println!(
        "Document OK: {} user(s), {} group(s)",
        state.users.len(),
        state.groups.len()
    );
    for user in &state.users {
        let chroot = user.effective_chroot(&state.global);
        println!("  {} -> {}", user.username, chroot.directory);
    }
    Ok(())
}
