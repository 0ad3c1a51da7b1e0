// src/config.rs

//! Configuration loading utilities.
//!
//! Resolves which configuration file to read and falls back to the built-in
//! defaults when none is present.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::models::Config;

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "meterpoll.toml";

/// Environment variable overriding [`DEFAULT_CONFIG_FILE`].
pub const CONFIG_ENV: &str = "METERPOLL_CONFIG";

/// Path to read when none was given on the command line.
pub fn default_config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Load and validate configuration.
///
/// An explicitly given file must exist and parse. Without one, the default
/// location is tried and the built-in defaults are used if it is missing or
/// unreadable.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let config = match explicit {
        Some(path) => {
            let config = Config::load(path)?;
            log::info!("Loaded configuration from {}", path.display());
            config
        }
        None => {
            let path = default_config_path();
            if path.exists() {
                Config::load_or_default(&path)
            } else {
                log::info!(
                    "No configuration at {}, using defaults",
                    path.display()
                );
                Config::default()
            }
        }
    };

    config.validate()?;
    Ok(config)
}
