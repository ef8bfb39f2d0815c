//! Initialize the configuration directory: create ~/.forwarder, a default config and an empty rule file.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{self, Config};
use crate::rules::{ForwardingRule, RuleFile};

/// Ensure the configuration directory has been initialized (config file exists).
pub fn require_initialized(config_path: &Path) -> Result<()> {
    if !config_path.exists() {
        anyhow::bail!(
            "configuration not initialized; run `forwarder init` first (config file not found: {})",
            config_path.display()
        );
    }
    Ok(())
}

/// Create the config directory and default files if they do not exist.
/// - Creates the config directory (parent of config file path).
/// - Writes `config.json` with every default spelled out if missing.
/// - Writes the rule file with a disabled, targetless rule if missing.
pub async fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        let default_config = serde_json::to_string_pretty(&Config::default())
            .context("serializing default config")?;
        std::fs::write(config_path, default_config)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    }

    let (config, _) = config::load_config(Some(config_path.to_path_buf()))?;
    let rule_file = RuleFile::new(config::resolve_rule_path(&config, config_path));
    if !rule_file.path().exists() {
        rule_file
            .save(&ForwardingRule::default())
            .await
            .with_context(|| format!("writing rule file {}", rule_file.path().display()))?;
        log::info!("created rule file at {}", rule_file.path().display());
    } else {
        log::debug!(
            "rule file already exists at {}, skipping",
            rule_file.path().display()
        );
    }

    Ok(config_dir.to_path_buf())
}
