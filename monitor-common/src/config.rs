use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::check::Target;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Upper bound for every interval in the file, one year in seconds. Larger
/// values cannot be scheduled on the runtime clock.
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

fn default_log_level() -> String {
    "DEBUG".to_owned()
}

/// One monitored endpoint. Identity is the position in `Config::services`;
/// two entries with the same address are two distinct services.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceSpec {
    pub address: String,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub enabled: bool,
    /// Seconds between two probes. Only required for enabled services.
    #[serde(default)]
    pub check_interval: u64,
}

impl fmt::Debug for ServiceSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServiceSpec")
            .field("address", &self.address)
            .field("login", &self.login)
            .field("password", &"***")
            .field("enabled", &self.enabled)
            .field("check_interval", &self.check_interval)
            .finish()
    }
}

impl ServiceSpec {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn target(&self) -> Target {
        Target::new(&self.address, &self.login, &self.password)
    }
}

/// Snapshot of the services file. Never mutated once loaded: a reload produces a new one.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// Seconds between two modification checks of the file.
    pub reload_config_interval: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Empty means stdout.
    #[serde(default)]
    pub log_filename: String,
    #[serde(default)]
    pub data_collector_url: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

impl Config {
    pub fn from_yaml(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config: Config =
            serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
                path: path.to_owned(),
                source,
            })?;
        if config.log_level.trim().is_empty() {
            config.log_level = default_log_level();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reload_config_interval == 0 || self.reload_config_interval > MAX_INTERVAL_SECS {
            return Err(ConfigError::Invalid(format!(
                "reload_config_interval must be between 1 and {} seconds, got {}",
                MAX_INTERVAL_SECS, self.reload_config_interval
            )));
        }
        for (position, service) in self.services.iter().enumerate() {
            if !service.enabled {
                continue;
            }
            if service.check_interval == 0 || service.check_interval > MAX_INTERVAL_SECS {
                return Err(ConfigError::Invalid(format!(
                    "service #{} ({}) needs a check_interval between 1 and {} seconds, got {}",
                    position, service.address, MAX_INTERVAL_SECS, service.check_interval
                )));
            }
        }
        Ok(())
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_config_interval)
    }

    pub fn enabled_services(&self) -> usize {
        self.services.iter().filter(|s| s.enabled).count()
    }
}

/// Result of polling a `ConfigSource`.
#[derive(Debug)]
pub enum Reload {
    /// Nothing changed since the last accepted snapshot.
    NotModified,
    Updated(Config),
}

/// Where the supervisor gets new configuration snapshots from.
pub trait ConfigSource: Send {
    fn reload(&mut self) -> Result<Reload, ConfigError>;
}

/// Services file on disk, re-read whenever its modification time changes.
pub struct FileConfigSource {
    path: PathBuf,
    modified: Option<SystemTime>,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            modified: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file regardless of its modification time.
    pub fn load(&mut self) -> Result<Config, ConfigError> {
        let modified = self.modified_time()?;
        let config = self.read()?;
        self.modified = Some(modified);
        Ok(config)
    }

    fn read(&self) -> Result<Config, ConfigError> {
        let contents = fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        Config::from_yaml(&contents, &self.path)
    }

    fn modified_time(&self) -> Result<SystemTime, ConfigError> {
        fs::metadata(&self.path)
            .and_then(|metadata| metadata.modified())
            .map_err(|source| ConfigError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

impl ConfigSource for FileConfigSource {
    fn reload(&mut self) -> Result<Reload, ConfigError> {
        let modified = self.modified_time()?;
        if self.modified == Some(modified) {
            debug!(path = %self.path.display(), "configuration not modified");
            return Ok(Reload::NotModified);
        }

        let config = self.read()?;
        self.modified = Some(modified);
        Ok(Reload::Updated(config))
    }
}
