//! Configuration for tourist-core
//!
//! Where the store lives, which model describes it, and how often the
//! autosave timer fires.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Result, StackError};

/// Default store file name inside the data directory
pub const DEFAULT_STORE_FILE_NAME: &str = "model.sqlite";

/// Default autosave interval in seconds
pub const DEFAULT_AUTOSAVE_INTERVAL_SECS: i64 = 10;

/// Stack-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Application name, used as the directory under the user data directory
    pub app_name: String,
    /// Explicit data directory; the platform data directory is used when unset
    pub data_dir: Option<PathBuf>,
    /// File name of the SQLite store
    pub store_file_name: String,
    /// Model resource to load instead of the bundled one
    pub model_path: Option<PathBuf>,
    /// Seconds between autosave cascades; zero or negative disables autosave
    pub autosave_interval_secs: i64,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            app_name: "VirtualTourist".to_string(),
            data_dir: None,
            store_file_name: DEFAULT_STORE_FILE_NAME.to_string(),
            model_path: None,
            autosave_interval_secs: DEFAULT_AUTOSAVE_INTERVAL_SECS,
        }
    }
}

impl StackConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration rooted at an explicit directory
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Serialize configuration to TOML
    pub fn to_toml(&self) -> std::result::Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Load configuration from a JSON string
    pub fn from_json(json_str: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json_str)
    }

    /// Serialize configuration to JSON
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Validate configuration values
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.app_name.trim().is_empty() {
            return Err(ConfigError::MissingField("app_name".to_string()));
        }

        if self.store_file_name.trim().is_empty() {
            return Err(ConfigError::MissingField("store_file_name".to_string()));
        }

        let separators: &[char] = &['/', '\\'];
        if self.store_file_name.contains(separators) || self.store_file_name == ".." {
            return Err(ConfigError::InvalidFileName(self.store_file_name.clone()));
        }

        Ok(())
    }

    /// Directory holding the store file, created if missing.
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        let dir = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_dir()
                .ok_or_else(|| {
                    StackError::DataDirectory("no platform data directory".to_string())
                })?
                .join(&self.app_name),
        };

        std::fs::create_dir_all(&dir)
            .map_err(|e| StackError::DataDirectory(format!("{}: {}", dir.display(), e)))?;
        Ok(dir)
    }

    /// Full path of the store file, creating its directory if needed.
    pub fn resolve_store_path(&self) -> Result<PathBuf> {
        Ok(self.store_path_in(&self.resolve_data_dir()?))
    }

    /// Store path under `dir` without touching the filesystem
    pub fn store_path_in(&self, dir: &Path) -> PathBuf {
        dir.join(&self.store_file_name)
    }
}

/// Configuration validation error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required field is missing or blank
    #[error("Missing field: {0}")]
    MissingField(String),

    /// Store file name must be a bare file name
    #[error("Invalid store file name: {0}")]
    InvalidFileName(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StackConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store_file_name, "model.sqlite");
        assert_eq!(config.autosave_interval_secs, 10);
    }

    #[test]
    fn test_json_serialization() {
        let config = StackConfig::in_dir("/tmp/tourist");
        let json = config.to_json().unwrap();
        let parsed = StackConfig::from_json(&json).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_toml_partial() {
        let config = StackConfig::from_toml("autosave_interval_secs = 0\n").unwrap();
        assert_eq!(config.autosave_interval_secs, 0);
        assert_eq!(config.store_file_name, DEFAULT_STORE_FILE_NAME);

        let round = StackConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(config, round);
    }

    #[test]
    fn test_invalid_file_name() {
        let mut config = StackConfig::default();
        config.store_file_name = "nested/model.sqlite".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidFileName(_))
        ));

        config.store_file_name = " ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_resolve_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = StackConfig::in_dir(dir.path().join("nested"));
        let path = config.resolve_store_path().unwrap();
        assert!(dir.path().join("nested").is_dir());
        assert_eq!(path, dir.path().join("nested").join("model.sqlite"));
        assert_eq!(path, config.store_path_in(&dir.path().join("nested")));
    }
}
