//! Configuration loading and schema definitions for verdict.
//!
//! This module provides types and functions for loading configuration from
//! TOML files or strings. Loaded configuration is validated before it is
//! returned, so callers can rely on the invariants documented in
//! [`schema`].

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads verdict configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
/// - A value fails validation (see [`Config::validate`])
///
/// # Example
///
/// ```no_run
/// use verdict::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("verdict.toml"))?;
/// println!("Max attempts: {}", config.verdict.max_attempts_per_test);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    config.expand_paths()?;
    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

    Ok(config)
}

/// Loads verdict configuration from a TOML string.
///
/// Useful for testing, embedding configuration, or generating configuration
/// programmatically.
///
/// # Example
///
/// ```
/// use verdict::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [verdict]
///     max_attempts_per_test = 3
///
///     [groups.unit.framework]
///     type = "rspec"
/// "#)?;
///
/// assert_eq!(config.verdict.max_attempts_per_test, 3);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("Failed to parse config")?;
    config.expand_paths()?;
    config.validate().context("Invalid config")?;
    Ok(config)
}
