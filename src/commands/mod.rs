pub mod clear;
pub mod invalidate;
pub mod list;
pub mod run;
pub mod show;

use anyhow::{Context, Result};
use std::path::Path;

use crate::cli::CommonConfigArgs;
use crate::client::Incant;
use crate::config::IncantConfig;

const DEFAULT_CONFIG_FILE: &str = "incant.toml";

/// Load configuration from the explicit path, the working directory's
/// `incant.toml`, or defaults, then apply CLI overrides.
pub fn load_config(common: &CommonConfigArgs) -> Result<IncantConfig> {
    let mut config = if let Some(path) = &common.config {
        IncantConfig::from_file(path)?
    } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
        IncantConfig::from_file(DEFAULT_CONFIG_FILE)?
    } else {
        IncantConfig::default()
    };

    if let Some(dir) = &common.config_store_dir {
        config.store.dir = dir.clone();
    }
    if let Some(url) = &common.config_generator_url {
        config.generator.url = Some(url.clone());
    }

    Ok(config)
}

pub fn build_client(common: &CommonConfigArgs) -> Result<Incant> {
    let config = load_config(common)?;
    Incant::new(config).context("Failed to initialize incant")
}
