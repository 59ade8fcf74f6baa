//! User preferences persisted as JSON.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{hooks::DEFAULT_LIBRARY_SUFFIX, memory::CHUNK_CEILING};

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid preferences in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("No configuration directory on this platform")]
    NoConfigDir,
}

fn default_agent_script() -> PathBuf {
    PathBuf::from("lib/script.js")
}

const fn default_chunk_size() -> usize {
    CHUNK_CEILING
}

fn default_library_suffix() -> String {
    DEFAULT_LIBRARY_SUFFIX.to_string()
}

fn default_bridge_addr() -> String {
    "127.0.0.1:27042".to_string()
}

/// Preferences document.
///
/// Unknown keys are kept and written back on save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prefs {
    /// Path of the agent bundle loaded into every session.
    #[serde(default = "default_agent_script")]
    pub agent_script: PathBuf,

    /// Largest single memory read.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Suffix appended to on-load module names.
    #[serde(default = "default_library_suffix")]
    pub library_suffix: String,

    /// Address of the device bridge.
    #[serde(default = "default_bridge_addr")]
    pub bridge_addr: String,

    /// Free-form settings.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl Default for Prefs {
    fn default() -> Self {
        Self {
            agent_script: default_agent_script(),
            chunk_size: default_chunk_size(),
            library_suffix: default_library_suffix(),
            bridge_addr: default_bridge_addr(),
            extra: HashMap::new(),
        }
    }
}

impl Prefs {
    /// `<config_dir>/dwarf/prefs.json`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("dwarf").join("prefs.json"))
    }

    /// Load from the default location.
    ///
    /// # Errors
    /// Returns error if there is no config directory or the file is invalid.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        Self::load(&path)
    }

    /// Load from `path`. A missing file yields the defaults.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No preferences file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write to `path`, creating parent directories.
    ///
    /// # Errors
    /// Returns error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let text = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, text).map_err(io_err)
    }

    /// Chunk size to use, falling back to the default for zero.
    #[must_use]
    pub const fn effective_chunk_size(&self) -> usize {
        if self.chunk_size == 0 {
            CHUNK_CEILING
        } else {
            self.chunk_size
        }
    }

    /// Get a free-form value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Set a free-form value.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.extra.insert(key.into(), value);
    }
}
