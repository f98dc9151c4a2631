use crate::output::print_json;
use crate::root::{load_config, resolve_config};
use clap::Subcommand;
use curtain_core::config::WarnLevel;
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Validate the config for dangling references and risky settings
    Validate,

    /// Print the path of the config file that would be used
    Path,
}

pub fn run(config_path: Option<&Path>, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Validate => validate(config_path, json),
        ConfigSubcommand::Path => {
            let path = resolve_config(config_path)?;
            if json {
                print_json(&serde_json::json!({ "path": path }))?;
            } else {
                println!("{}", path.display());
            }
            Ok(())
        }
    }
}

fn validate(config_path: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let warnings = config.validate();

    if json {
        let value = serde_json::json!({
            "warnings": warnings,
        });
        print_json(&value)?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}
