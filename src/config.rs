//! Configuration file (`~/.config/conda-stream/config.toml`).
//!
//! Every field has a default, so an empty or missing file is valid.

use crate::error::ConfigError;
use crate::transport::pipe::DEFAULT_READ_SIZE;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub conda: CondaConfig,
    pub transport: TransportConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CondaConfig {
    /// Executable spawned by the pipe transport.
    pub program: String,
    /// Arguments placed before the subcommand (e.g. `["run", "-n", "base", "conda"]`).
    pub args: Vec<String>,
    /// Extra environment for the spawned process.
    pub env: HashMap<String, String>,
}

impl Default for CondaConfig {
    fn default() -> Self {
        Self {
            program: "conda".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Bytes requested per stdout read.
    pub read_chunk_size: usize,
    /// Relay URL for the channel transport, e.g. `ws://127.0.0.1:8000/api_ws`.
    pub channel_url: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: DEFAULT_READ_SIZE,
            channel_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
        }
    }
}

impl Config {
    /// `<config dir>/conda-stream/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("conda-stream").join("config.toml"))
    }

    /// Load from `path`, which must exist.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load an explicit file, or the default one if it exists, or defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::from_path(path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::debug!(path = %path.display(), "loading config");
                Self::from_path(&path)
            }
            _ => Ok(Self::default()),
        }
    }
}
