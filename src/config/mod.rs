//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::DEFAULT_CRYPT_KEY;

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Proxy-role configuration.
    pub proxy: Option<ProxyConfig>,
    /// Agent-role configuration.
    pub agent: Option<AgentConfig>,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Proxy-role configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Local address clients connect to.
    pub listen: String,
    /// Address the agent dials on its side.
    pub connect: String,
    /// Tunnel URL to dial (normal mode).
    pub tunnel_connect: Option<String>,
    /// Tunnel URL to listen on (reverse mode).
    pub tunnel_listen: Option<String>,
    /// Shared obfuscation key.
    #[serde(default = "default_crypt_key")]
    pub crypt_key: i64,
    /// Capture per-stream traffic under this directory.
    pub dump_dir: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:56080".to_string(),
            connect: "127.0.0.1:3128".to_string(),
            tunnel_connect: None,
            tunnel_listen: None,
            crypt_key: DEFAULT_CRYPT_KEY,
            dump_dir: None,
        }
    }
}

/// Agent-role configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Tunnel URL to listen on (normal mode).
    pub tunnel_listen: Option<String>,
    /// Tunnel URL to dial (reverse mode).
    pub tunnel_connect: Option<String>,
    /// Shared obfuscation key.
    #[serde(default = "default_crypt_key")]
    pub crypt_key: i64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tunnel_listen: None,
            tunnel_connect: None,
            crypt_key: DEFAULT_CRYPT_KEY,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Log format (pretty, compact).
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

fn default_crypt_key() -> i64 {
    DEFAULT_CRYPT_KEY
}
