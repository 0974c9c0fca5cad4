use anyhow::{Context, Result};
use heron_sftp::Config;
use std::path::Path;
use tokio::fs;

/// Load engine settings. A missing file means all defaults.
pub async fn load_config(path: &Path) -> Result<Config> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Ok(Config::default());
    }

    let contents = fs::read_to_string(path)
        .await
        .context("Failed to read configuration file")?;

    let config = Config::from_toml(&contents).context("Failed to parse configuration file")?;
    config.validate().context("Invalid configuration")?;

    Ok(config)
}

pub async fn save_config(path: &Path, config: &Config) -> Result<()> {
    // Create parent directory if it doesn't exist
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let contents = config.to_toml().context("Failed to serialize configuration")?;

    fs::write(path, contents)
        .await
        .context("Failed to write configuration file")?;

    Ok(())
}
