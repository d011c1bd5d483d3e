/// Configuration file support for the data pool
///
/// Registry geometry and subscriber timing can be loaded from TOML or YAML
/// instead of relying on the built-in defaults.
use crate::error::{DataPoolError, DataPoolResult};
use crate::memory::platform::shm_base_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of registry slots
pub const DEFAULT_CAPACITY: usize = 30;
/// Default width of one registry slot in bytes
pub const DEFAULT_SLOT_WIDTH: usize = 100;

/// Data pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Directory holding the segment files (platform default when unset)
    pub base_dir: Option<PathBuf>,

    /// Name of the registry segment
    pub registry_name: String,

    /// Number of registry slots, fixed once the registry exists
    pub capacity: usize,

    /// Maximum encoded descriptor length in bytes
    pub slot_width: usize,

    /// Sleep between subscriber polls when nothing new was published
    pub poll_interval_ms: u64,

    /// Subscriber iterations between two health checks
    pub health_check_every: u32,

    /// Attempts per health check before giving up for that cycle
    pub health_check_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            registry_name: "datapool_registry".to_string(),
            capacity: DEFAULT_CAPACITY,
            slot_width: DEFAULT_SLOT_WIDTH,
            poll_interval_ms: 1000,
            health_check_every: 30,
            health_check_retries: 3,
        }
    }
}

impl PoolConfig {
    /// Default configuration rooted at `base_dir`
    pub fn with_base_dir<P: Into<PathBuf>>(base_dir: P) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
            ..Self::default()
        }
    }

    /// Resolved segment directory
    pub fn base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(shm_base_dir)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Reject settings the registry cannot work with
    pub fn validate(&self) -> DataPoolResult<()> {
        if self.capacity == 0 || self.capacity > u32::MAX as usize {
            return Err(DataPoolError::config(format!(
                "capacity {} is out of range",
                self.capacity
            )));
        }
        if self.slot_width == 0 || self.slot_width > u32::MAX as usize {
            return Err(DataPoolError::config(format!(
                "slot_width {} is out of range",
                self.slot_width
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(DataPoolError::config("poll_interval_ms must be positive"));
        }
        if self.health_check_every == 0 {
            return Err(DataPoolError::config("health_check_every must be positive"));
        }
        if self.registry_name.is_empty() {
            return Err(DataPoolError::config("registry_name must not be empty"));
        }
        Ok(())
    }

    /// Load config from a file (auto-detect format)
    pub fn from_file<P: AsRef<Path>>(path: P) -> DataPoolResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DataPoolError::config(format!("Failed to read config file: {}", e)))?;

        // Auto-detect format based on extension
        let extension = path.extension().and_then(|s| s.to_str());
        match extension {
            Some("toml") => Self::from_toml(&contents),
            Some("yaml") | Some("yml") => Self::from_yaml(&contents),
            _ => Self::from_toml(&contents).or_else(|_| Self::from_yaml(&contents)),
        }
    }

    /// Parse config from TOML string
    pub fn from_toml(contents: &str) -> DataPoolResult<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| DataPoolError::config(format!("Failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse config from YAML string
    pub fn from_yaml(contents: &str) -> DataPoolResult<Self> {
        let config: Self = serde_yaml::from_str(contents)
            .map_err(|e| DataPoolError::config(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Find and load config file from standard search paths
    ///
    /// Search order:
    /// 1. ./datapool.toml or ./datapool.yaml
    /// 2. ~/.datapool/config.toml or ~/.datapool/config.yaml
    ///
    /// Falls back to the defaults when no file exists.
    pub fn find_and_load() -> DataPoolResult<Self> {
        for path in Self::get_search_paths() {
            if path.exists() {
                log::debug!("Loading data pool config from {}", path.display());
                return Self::from_file(&path);
            }
        }
        Ok(Self::default())
    }

    /// Get standard config file search paths
    pub fn get_search_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("datapool.toml"),
            PathBuf::from("datapool.yaml"),
            PathBuf::from("datapool.yml"),
        ];

        if let Some(home) = dirs::home_dir() {
            let dir = home.join(".datapool");
            paths.push(dir.join("config.toml"));
            paths.push(dir.join("config.yaml"));
            paths.push(dir.join("config.yml"));
        }

        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.capacity, 30);
        assert_eq!(config.slot_width, 100);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
        assert_eq!(config.base_dir(), shm_base_dir());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            base_dir = "/tmp/pool-test"
            capacity = 8
            poll_interval_ms = 20
        "#;

        let config = PoolConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.capacity, 8);
        assert_eq!(config.slot_width, DEFAULT_SLOT_WIDTH);
        assert_eq!(config.base_dir(), PathBuf::from("/tmp/pool-test"));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml_str = "registry_name: vision\nslot_width: 256\n";
        let config = PoolConfig::from_yaml(yaml_str).unwrap();
        assert_eq!(config.registry_name, "vision");
        assert_eq!(config.slot_width, 256);
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
    }

    #[test]
    fn test_invalid_capacity_rejected() {
        let err = PoolConfig::from_toml("capacity = 0").unwrap_err();
        assert!(matches!(err, DataPoolError::Config(_)));

        let oversized = PoolConfig {
            capacity: u32::MAX as usize + 1,
            ..PoolConfig::default()
        };
        assert!(matches!(oversized.validate(), Err(DataPoolError::Config(_))));
        let largest = PoolConfig {
            capacity: u32::MAX as usize,
            ..PoolConfig::default()
        };
        assert!(largest.validate().is_ok());
    }
}
