//! Layered stream configuration.
//!
//! A [`StreamConfig`] is assembled from three layers, later ones winning:
//!
//! 1. a TOML file: the one passed to [`ConfigLoader::file`], or else the first
//!    of `./.magick-stream.toml` and `<config_dir>/magick-stream/config.toml`
//!    that exists;
//! 2. `MAGICK_STREAM_*` environment variables, one per field
//!    (`MAGICK_STREAM_BINARY`, `MAGICK_STREAM_START`, ...);
//! 3. overrides set on the loader, such as [`ConfigLoader::binary`].

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::DeserializeOwned;

use super::StreamConfig;

/// File looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = ".magick-stream.toml";

/// Prefix of the environment variables that override file settings.
pub const ENV_PREFIX: &str = "MAGICK_STREAM_";

/// Builds a [`StreamConfig`] from file, environment and overrides.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    binary: Option<String>,
    read_env: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Search the default locations and read the environment.
    #[must_use]
    pub fn new() -> Self {
        Self {
            file: None,
            binary: None,
            read_env: true,
        }
    }

    /// Read this file instead of searching. It must exist.
    #[must_use]
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Run this binary whatever the file or environment say.
    #[must_use]
    pub fn binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    /// Skip the `MAGICK_STREAM_*` variables.
    #[must_use]
    pub fn ignore_env(mut self) -> Self {
        self.read_env = false;
        self
    }

    /// Locations searched when no file was given, in order.
    #[must_use]
    pub fn default_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(LOCAL_CONFIG_FILE)];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("magick-stream").join("config.toml"));
        }
        paths
    }

    /// The file `load` will read, if any.
    #[must_use]
    pub fn source(&self) -> Option<PathBuf> {
        match &self.file {
            Some(path) => Some(path.clone()),
            None => Self::default_paths().into_iter().find(|p| p.exists()),
        }
    }

    /// Assemble the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an
    /// environment variable holds an invalid value.
    pub fn load(&self) -> Result<StreamConfig, ConfigError> {
        self.load_with(|key| std::env::var(key).ok())
    }

    fn load_with(
        &self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<StreamConfig, ConfigError> {
        let mut config = match self.source() {
            Some(path) => read_file(&path)?,
            None => {
                tracing::debug!("No config file found, using defaults");
                StreamConfig::default()
            }
        };

        if self.read_env {
            apply_env(&mut config, env)?;
        }
        if let Some(binary) = &self.binary {
            config.binary.clone_from(binary);
        }
        Ok(config)
    }
}

fn read_file(path: &Path) -> Result<StreamConfig, ConfigError> {
    tracing::debug!(path = %path.display(), "Loading config file");
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_env(
    config: &mut StreamConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    let var = |field: &str| {
        let key = format!("{ENV_PREFIX}{field}");
        env(&key).map(|value| (key, value))
    };

    if let Some((key, value)) = var("BINARY") {
        tracing::debug!(%key, %value, "Binary set from environment");
        config.binary = value;
    }
    if let Some((key, value)) = var("START") {
        config.start = parse_name(&key, value)?;
    }
    if let Some((key, value)) = var("UNHANDLED_ERROR") {
        config.unhandled_error = parse_name(&key, value)?;
    }
    if let Some((key, value)) = var("SPAWN_ON_EMPTY_CLOSE") {
        config.spawn_on_empty_close = parse_value(&key, value)?;
    }
    if let Some((key, value)) = var("WRITE_QUEUE_CAPACITY") {
        config.write_queue_capacity = parse_value(&key, value)?;
    }
    if let Some((key, value)) = var("MAX_CHUNK_SIZE") {
        config.max_chunk_size = parse_value(&key, value)?;
    }
    if let Some((key, value)) = var("TERMINATE_TIMEOUT_MS") {
        config.terminate_timeout_ms = parse_value(&key, value)?;
    }
    if let Some((_, value)) = var("WORKING_DIR") {
        config.working_dir = Some(PathBuf::from(value));
    }
    Ok(())
}

/// Parse a policy name the way the config file spells it.
fn parse_name<T: DeserializeOwned>(key: &str, value: String) -> Result<T, ConfigError> {
    toml::Value::String(value.clone())
        .try_into()
        .map_err(|_| ConfigError::Env {
            key: key.to_string(),
            value,
        })
}

fn parse_value<T: FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key: key.to_string(),
        value,
    })
}

/// Errors that can occur while assembling the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid value {value:?} for {key}")]
    Env { key: String, value: String },
}
