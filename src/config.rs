use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Base directory for sockets: the user runtime dir, or the temp dir when unset
pub fn runtime_base_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("taro")
}

/// Base directory for history and log files
pub fn data_base_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("taro")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub job_defaults: JobDefaults,
    pub listener_bind_address: PathBuf,
    pub listeners: Vec<ListenerConfig>,
    pub listener_buffer_capacity: usize,
    pub listener_retry_ms: u64,
    pub registry_endpoint_dir: PathBuf,
    pub command_timeout_ms: u64,
    pub persistence: PersistenceConfig,
    pub plugins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDefaults {
    pub grace_period_ms: u64,
    /// 0 means unlimited
    pub max_concurrent: usize,
    pub capture_output: bool,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            grace_period_ms: 5000,
            max_concurrent: 0,
            capture_output: true,
        }
    }
}

/// A listening server this process pushes events to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub endpoint: PathBuf,
    #[serde(default)]
    pub job_filter: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    #[default]
    Jsonl,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub backend: PersistenceBackend,
    pub path: Option<PathBuf>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: PersistenceBackend::Jsonl,
            path: None,
        }
    }
}

impl PersistenceConfig {
    /// Configured path, or the backend's default file under the data dir
    pub fn path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| match self.backend {
            PersistenceBackend::Jsonl => data_base_dir().join("history.jsonl"),
            PersistenceBackend::Sqlite => data_base_dir().join("history.db"),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: None,
            job_defaults: JobDefaults::default(),
            listener_bind_address: runtime_base_dir().join("listener.sock"),
            listeners: Vec::new(),
            listener_buffer_capacity: 256,
            listener_retry_ms: 1000,
            registry_endpoint_dir: runtime_base_dir().join("registry"),
            command_timeout_ms: 5000,
            persistence: PersistenceConfig::default(),
            plugins: vec!["log".to_string()],
        }
    }
}

impl Config {
    /// Load configuration with fallback chain.
    ///
    /// Search order:
    /// 1. Explicit path if provided
    /// 2. .taro.yml in current directory
    /// 3. ~/.config/taro/taro.yml
    /// 4. Defaults
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let project_config = PathBuf::from(".taro.yml");
        if project_config.exists() {
            match Self::load_from_file(&project_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load .taro.yml: {}", e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let project_name = env!("CARGO_PKG_NAME");
            let user_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_ms == 0 {
            eyre::bail!("command_timeout_ms must be > 0");
        }
        if self.listener_buffer_capacity == 0 {
            eyre::bail!("listener_buffer_capacity must be > 0");
        }
        for listener in &self.listeners {
            if let Some(filter) = &listener.job_filter {
                glob::Pattern::new(filter).context(format!("Invalid job_filter '{}'", filter))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.job_defaults.grace_period_ms, 5000);
        assert_eq!(config.job_defaults.max_concurrent, 0);
        assert!(config.job_defaults.capture_output);
        assert_eq!(config.listener_buffer_capacity, 256);
        assert_eq!(config.listener_retry_ms, 1000);
        assert_eq!(config.command_timeout_ms, 5000);
        assert!(config.persistence.enabled);
        assert_eq!(config.persistence.backend, PersistenceBackend::Jsonl);
        assert_eq!(config.plugins, vec!["log".to_string()]);
        assert!(config.registry_endpoint_dir.ends_with("taro/registry"));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
job_defaults:
  grace_period_ms: 250
listeners:
  - endpoint: /tmp/taro-listener.sock
    job_filter: "backup*"
persistence:
  backend: sqlite
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.job_defaults.grace_period_ms, 250);
        assert!(config.job_defaults.capture_output);
        assert_eq!(config.listeners.len(), 1);
        assert_eq!(config.listeners[0].job_filter.as_deref(), Some("backup*"));
        assert_eq!(config.persistence.backend, PersistenceBackend::Sqlite);
        assert!(config.persistence.path().ends_with("history.db"));
    }

    #[test]
    fn test_load_explicit_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("taro.yml");
        std::fs::write(&path, "command_timeout_ms: 750\nplugins: []\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.command_timeout_ms, 750);
        assert!(config.plugins.is_empty());
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("missing.yml");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.command_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.listener_buffer_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_filter() {
        let mut config = Config::default();
        config.listeners.push(ListenerConfig {
            endpoint: PathBuf::from("/tmp/l.sock"),
            job_filter: Some("[".to_string()),
        });
        assert!(config.validate().is_err());
    }
}
