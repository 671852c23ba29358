//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Upstream SDR server host.
    /// Override: `GATEWAY_HOST`
    pub host: String,

    /// Upstream SDR server port.
    /// Override: `GATEWAY_PORT`
    pub port: u16,

    /// Use TLS (wss://) for the upstream connection.
    pub ssl: bool,

    /// Upstream session password, if required.
    pub password: Option<String>,

    /// Connect to the upstream server immediately on startup rather than
    /// waiting for the first observer/subscriber.
    pub auto_connect: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8080,
            ssl: false,
            password: None,
            auto_connect: false,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("GATEWAY_HOST") {
            self.host = val;
        }

        if let Ok(val) = std::env::var("GATEWAY_PORT") {
            if let Ok(port) = val.parse() {
                self.port = port;
            }
        }
    }

    /// Converts to gateway-core's `Config` type. Fields this server shell
    /// has no CLI/YAML surface for (tuning, sinks, rig control, fan-out
    /// tuning) keep `gateway_core::Config`'s own defaults, left for a config
    /// file consumed directly by the core in a future revision.
    pub fn to_core_config(&self) -> gateway_core::Config {
        gateway_core::Config {
            host: self.host.clone(),
            port: self.port,
            ssl: self.ssl,
            password: self.password.clone(),
            auto_connect: self.auto_connect,
            ..Default::default()
        }
    }
}
