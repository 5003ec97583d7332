//! Configuration loading and schema definitions for labrun.
//!
//! This module provides functions for loading the runner configuration from
//! TOML files or strings. The schema is described in [`schema`].

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use labrun::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("labrun.toml"))?;
/// println!("Abort budget: {}", config.runner.max_aborted);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML string.
///
/// ```
/// use labrun::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [runner]
///     jobtemplate = "job.xml"
///     max_aborted = 5
/// "#)?;
///
/// assert_eq!(config.runner.max_aborted, 5);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}
