//! CLI command handlers.

pub mod config;
pub mod migrate;
pub mod serve;

use std::path::PathBuf;

use pipewright_config::LoadedConfig;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Resolved configuration and where it came from.
    pub loaded: LoadedConfig,
    /// Verbose output enabled.
    pub verbose: bool,
}

impl Context {
    /// Database path; relative paths live under the data directory.
    pub fn storage_path(&self) -> PathBuf {
        let path = &self.loaded.config.storage.path;
        if path.is_absolute() {
            path.clone()
        } else {
            pipewright_config::data_dir().join(path)
        }
    }
}
