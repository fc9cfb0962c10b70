//! Configuration module for Hybrid-BLAST
//!
//! Handles loading and validating settings from YAML files and environment variables.

mod settings;

pub use settings::*;

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable naming an explicit settings file
pub const SETTINGS_PATH_ENV: &str = "HYBRID_BLAST_SETTINGS_PATH";

/// Default settings locations, in lookup order
pub fn default_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("hybrid-blast.yml"),
        PathBuf::from("config/hybrid-blast.yml"),
    ];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("hybrid-blast/settings.yml"));
    }
    paths
}

/// Load settings from `explicit`, the environment, the default paths, or defaults,
/// then apply environment overrides and validate.
pub fn load(explicit: Option<&Path>) -> Result<Settings> {
    let candidate = explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var(SETTINGS_PATH_ENV).ok().map(PathBuf::from));

    let mut settings = match candidate {
        Some(path) => {
            info!("Loading settings from: {}", path.display());
            Settings::from_file(&path)?
        }
        None => match default_paths().into_iter().find(|p| p.exists()) {
            Some(path) => {
                info!("Loading settings from: {}", path.display());
                Settings::from_file(&path)?
            }
            None => {
                info!("No settings file found, using defaults");
                Settings::default()
            }
        },
    };

    settings.merge_env();
    settings.validate()?;
    Ok(settings)
}
