//! Configuration loading and schema definitions for conductor.
//!
//! Configuration is read once at startup, adjusted by command-line
//! overrides, and then passed by reference to every component. Nothing reads
//! configuration from global state.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Loads conductor configuration from a TOML file.
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
/// use conductor::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("conductor.toml"))?;
/// println!("Retry times: {}", config.conductor.retry_times);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config.expand_paths())
}

/// Loads conductor configuration from a TOML string.
///
/// # Example
///
/// ```
/// use conductor::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [runner]
///     command = "pytest {suite} --junitxml={output}"
///     rerun_command = "pytest {failed} --junitxml={output}"
/// "#)?;
///
/// assert_eq!(config.bridge.base_port, 4723);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config.expand_paths())
}

/// Expands `~` and environment variables in a configured path.
///
/// Paths that reference undefined variables are returned unchanged.
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => path.to_path_buf(),
    }
}

impl Config {
    fn expand_paths(mut self) -> Self {
        self.conductor.test_root = expand_path(&self.conductor.test_root);
        self.conductor.log_root = expand_path(&self.conductor.log_root);
        self
    }
}
