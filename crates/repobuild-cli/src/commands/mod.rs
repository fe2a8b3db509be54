//! CLI command implementations.

pub mod build;
pub mod gc;

use anyhow::{Context, Result};
use repobuild_config::{SystemConfig, load_system_config};
use repobuild_core::BuildName;
use std::path::Path;
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "repobuild.kdl";

/// Load the configuration file, falling back to defaults when no path was
/// given and the default file does not exist.
pub fn load_config(path: Option<&Path>) -> Result<SystemConfig> {
    let path = match path {
        Some(path) => path,
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if !default.exists() {
                debug!("No configuration file, using defaults");
                return Ok(SystemConfig::default());
            }
            default
        }
    };
    load_system_config(path)
        .with_context(|| format!("Failed to load configuration: {}", path.display()))
}

pub fn name(repo: &str, git_ref: &str) {
    println!("{}", BuildName::new(repo, git_ref));
}

pub fn validate(path: &Path) -> Result<()> {
    let config = load_system_config(path)
        .with_context(|| format!("Configuration error in {}", path.display()))?;
    println!("Configuration is valid");
    println!("  namespace:      {}", config.cluster.namespace);
    println!("  build image:    {}", config.cluster.build_image);
    println!("  sticky builds:  {}", config.cluster.sticky_builds);
    println!("  gc max age:     {}s", config.gc.max_age.as_secs());
    Ok(())
}
