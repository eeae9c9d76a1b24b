//! Configuration for the pipewright workflow engine.
//!
//! A single YAML file with defaulted sections for HTTP, storage, the message
//! bus, collaborator health probing, integrations, caches and the engine.

pub mod error;
pub mod loader;
pub mod types;

pub use error::{ConfigError, Result};
pub use loader::{data_dir, load_config, load_config_file, LoadedConfig, CONFIG_ENV};
pub use types::*;
