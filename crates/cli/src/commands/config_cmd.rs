//! `axon config`: show the effective configuration.

use axon_config::AppConfig;
use std::path::{Path, PathBuf};

pub fn run(
    explicit: Option<&Path>,
    config: &AppConfig,
    path_only: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path(explicit);
    if path_only {
        println!("{}", path.display());
        return Ok(());
    }

    let source = if path.exists() { "file + environment" } else { "defaults + environment" };
    println!("# {} ({source})", path.display());
    if !config.has_api_key() {
        println!("# No API key set (api_key, AXON_API_KEY or ANTHROPIC_API_KEY)");
    }
    print!("{}", config.to_redacted_toml()?);
    Ok(())
}

fn config_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"))
}
