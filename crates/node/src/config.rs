use std::path::Path;

use anyhow::{Context, Result};
use relay_protocol::config::RelayConfig;

/// Load configuration from a TOML file at the given path. If the file
/// doesn't exist, falls back to defaults (§10.4 — a partial or absent file
/// is always valid).
pub(crate) fn load_config(path: &Path) -> Result<RelayConfig> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(RelayConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: RelayConfig = toml::from_str(&contents).context("failed to parse config TOML")?;
    tracing::info!(path = %path.display(), "loaded config");
    Ok(config)
}
