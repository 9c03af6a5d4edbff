use serde::Deserialize;
use thiserror::Error;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::listener::ListenAddr;
use crate::relaunch::StrategyKind;

/// Environment variable naming the configuration file.
pub const CONFIG_VAR: &str = "HANDOFF_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("Unable to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: ListenAddr,
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default)]
    pub exit_after_relaunch: bool,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;

        Ok(config)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.exit_after_relaunch && self.strategy == StrategyKind::Exec {
            return Err(ConfigError::Invalid(
                "exit_after_relaunch cannot be used with the exec strategy".to_string(),
            ));
        }

        if self.backlog <= 0 {
            return Err(ConfigError::Invalid(format!(
                "backlog must be positive, got {}",
                self.backlog
            )));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            strategy: StrategyKind::default(),
            drain_timeout_secs: default_drain_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            exit_after_relaunch: false,
            backlog: default_backlog(),
            log_filter: default_log_filter(),
        }
    }
}

/// Read the file named by `HANDOFF_CONFIG`, or `config.toml`.
pub fn get_config() -> Result<Config, ConfigError> {
    let path = std::env::var_os(CONFIG_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    load(&path)
}

/// A missing file means defaults.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    match fs::read_to_string(path) {
        Ok(toml_string) => Config::from_toml(&toml_string),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Config::default()),
        Err(source) => Err(ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

// Defaults
fn default_listen() -> ListenAddr { ListenAddr::Tcp(([127, 0, 0, 1], 48879).into()) }
fn default_drain_timeout_secs() -> u64 { 10 }
fn default_handshake_timeout_secs() -> u64 { 30 }
fn default_backlog() -> i32 { 128 }
fn default_log_filter() -> String { "info".to_string() }
