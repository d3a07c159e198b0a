//! Configuration module
//!
//! Handles loading and saving Midiwire configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network::{AcceptMode, ServerConfig};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Ingestion server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is not set
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_level() }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        Self::load_first(&Self::default_paths())
    }

    /// Load the first of `paths` that exists. A file that exists but fails to
    /// parse is an error, not a reason to fall back.
    pub fn load_first(paths: &[PathBuf]) -> ConfigResult<Self> {
        for path in paths {
            if path.exists() {
                tracing::debug!("Loading configuration from {}", path.display());
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Locations searched by [`Config::load_default`], in order
    pub fn default_paths() -> Vec<PathBuf> {
        [
            dirs::config_dir().map(|p| p.join("midiwire/config.toml")),
            Some(PathBuf::from("./midiwire.toml")),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        server: ServerConfig {
            accept_mode: AcceptMode::Sequential,
            ..Default::default()
        },
        logging: LoggingConfig {
            level: "midiwire=debug,info".to_string(),
        },
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_PORT;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.server.max_frame_size = 1024;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 7000").unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.server.port, 7000);
        assert_eq!(loaded.server.accept_mode, AcceptMode::Concurrent);
        assert_eq!(loaded.logging, LoggingConfig::default());
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load(Path::new("/nonexistent/midiwire.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_first_falls_back_only_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let broken = dir.path().join("midiwire.toml");

        let loaded = Config::load_first(&[missing.clone()]).unwrap();
        assert_eq!(loaded, Config::default());

        std::fs::write(&broken, "[server\nport = ").unwrap();
        let result = Config::load_first(&[missing, broken]);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.server.accept_mode, AcceptMode::Sequential);
    }
}
