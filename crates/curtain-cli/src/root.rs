use anyhow::Context;
use curtain_core::config::{Config, WarnLevel};
use curtain_core::paths::{find_config, CONFIG_FILE};
use curtain_core::CurtainError;
use std::path::{Path, PathBuf};

/// Resolve the config file.
///
/// Priority:
/// 1. `--config` flag / `CURTAIN_CONFIG` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `curtain.yaml`
pub fn resolve_config(explicit: Option<&Path>) -> Result<PathBuf, CurtainError> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_config(&cwd).ok_or_else(|| CurtainError::ConfigNotFound(cwd.join(CONFIG_FILE)))
}

pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let path = resolve_config(explicit)?;
    Config::load(&path).with_context(|| format!("failed to load config {}", path.display()))
}

/// Load the config and refuse it when validation finds any error-level problem.
pub fn load_valid_config(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let config = load_config(explicit)?;
    let errors: Vec<String> = config
        .validate()
        .into_iter()
        .filter(|w| w.level == WarnLevel::Error)
        .map(|w| w.message)
        .collect();
    if !errors.is_empty() {
        anyhow::bail!(
            "invalid config ({} error(s); see `curtain config validate`):\n  {}",
            errors.len(),
            errors.join("\n  ")
        );
    }
    Ok(config)
}
