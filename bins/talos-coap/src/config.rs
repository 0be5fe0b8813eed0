use std::{fs, path::PathBuf, time::Duration};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Error while deserializing TOML: {0}")]
    Deserialize(#[from] toml::de::Error),

    #[error("Error while reading TOML config file: {0}")]
    Read(#[from] std::io::Error),
}

#[derive(Deserialize)]
#[serde(default)]
pub struct RawConfig {
    ack_timeout_ms: u64,
    ack_random_factor: f64,
    max_retransmit: u32,
    block_size: usize,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 2000,
            ack_random_factor: 1.5,
            max_retransmit: 4,
            block_size: 512,
        }
    }
}

impl RawConfig {
    pub fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Config {
        Config {
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            ack_random_factor: self.ack_random_factor,
            max_retransmit: self.max_retransmit,
            block_size: self.block_size,
        }
    }
}

pub struct Config {
    pub ack_timeout: Duration,
    pub ack_random_factor: f64,
    pub max_retransmit: u32,
    pub block_size: usize,
}

impl Config {
    pub fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let raw_config = RawConfig::from_file(path)?;
        Ok(raw_config.validate())
    }
}

impl Default for Config {
    fn default() -> Self {
        RawConfig::default().validate()
    }
}
