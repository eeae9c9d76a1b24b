//! Config file resolution.
//!
//! Resolution order:
//! 1. explicit path (`--config`)
//! 2. `PIPEWRIGHT_CONFIG` env var
//! 3. `./pipewright.yaml` if present
//! 4. built-in defaults

use std::path::{Path, PathBuf};

use crate::{ConfigError, PipewrightConfig, Result};

/// Env var naming the config file.
pub const CONFIG_ENV: &str = "PIPEWRIGHT_CONFIG";

const PROJECT_CONFIG_FILE: &str = "pipewright.yaml";

const APP_NAME: &str = "pipewright";

/// A configuration together with the file it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: PipewrightConfig,
    /// `None` when running on defaults.
    pub source: Option<PathBuf>,
}

/// Load configuration from a specific file path (no discovery).
pub fn load_config_file(path: &Path) -> Result<PipewrightConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    let config = PipewrightConfig::from_yaml(&contents)?;
    config.validate()?;
    Ok(config)
}

/// Resolve and load the configuration.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
    let path = explicit.map(Path::to_path_buf).or(env_path).or_else(|| {
        let local = PathBuf::from(PROJECT_CONFIG_FILE);
        local.exists().then_some(local)
    });

    match path {
        Some(path) => {
            let config = load_config_file(&path)?;
            tracing::debug!(path = %path.display(), "loaded config");
            Ok(LoadedConfig {
                config,
                source: Some(path),
            })
        }
        None => {
            tracing::debug!("no config file found, using defaults");
            Ok(LoadedConfig {
                config: PipewrightConfig::default(),
                source: None,
            })
        }
    }
}

/// Platform data directory for the database and logs.
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join(APP_NAME))
        .unwrap_or_else(|| PathBuf::from(".").join(APP_NAME))
}
