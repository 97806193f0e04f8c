//! Configuration management for devhost

mod devhost;
pub mod serde_utils;

pub use devhost::{
    DevhostConfig, DnsConfig, HelperConfig, ParkingConfig, ProxyConfig, SupervisorConfig,
};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devhost")
}

/// Get the default data directory (state, logs, instance data)
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devhost")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = DevhostConfig::default();
        config.tld = "localhost".to_string();
        save_config(&path, &config).unwrap();

        let loaded: DevhostConfig = load_config(&path).unwrap();
        assert_eq!(loaded.tld, "localhost");
        assert_eq!(loaded.dns.bind, config.dns.bind);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let result: Result<DevhostConfig, _> = load_config(&dir.path().join("nope.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "tld = \"dev\"\n[dns]\nbind = \"127.0.0.1:5300\"\n").unwrap();

        let loaded: DevhostConfig = load_config(&path).unwrap();
        assert_eq!(loaded.tld, "dev");
        assert_eq!(loaded.dns.bind.port(), 5300);
        assert!(loaded.dns.enabled);
        assert_eq!(
            loaded.supervisor.stop_grace_period,
            SupervisorConfig::default().stop_grace_period
        );
    }
}
