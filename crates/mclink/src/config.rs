//! Configuration management for the MCLink bridge.
//!
//! Loads the TOML file, validates it, and converts it into the
//! [`BridgeConfig`] the library consumes.

use link_server::{AllowList, BridgeConfig, Platform, SocketConfig, SocketMode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

fn default_auto_start() -> bool {
    true
}

fn default_stop_timeout() -> u64 {
    30
}

fn default_call_timeout() -> u64 {
    5000
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_allow_connections() -> AllowConnections {
    AllowConnections::List(vec!["127.0.0.1".to_string()])
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Dedicated server settings
    pub server: ServerSettings,
    /// Websocket relay settings
    pub socket: SocketSettings,
    /// Logging configuration settings
    pub logging: LoggingSettings,
}

/// Where the dedicated server lives and how it is supervised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Server build to launch ("ubuntu" or "windows")
    pub platform: String,
    /// Directory holding the server executable
    pub directory: String,
    /// Start the server as soon as the bridge is up
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
    /// Seconds a requested stop may take before it is forced
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    /// Deadline for calls into the in-engine script, in milliseconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
}

/// Websocket relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketSettings {
    /// "listen", "connect" or "disabled"
    pub mode: String,
    /// Hub to dial in connect mode
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    /// Delay between reconnect attempts; 5000 when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_delay_ms: Option<u64>,
    /// Origins allowed to connect in listen mode
    #[serde(default = "default_allow_connections")]
    pub allow_connections: AllowConnections,
}

/// Either `true` for everyone or a list of addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AllowConnections {
    Everyone(bool),
    List(Vec<String>),
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                platform: Platform::current().to_string(),
                directory: "bds".to_string(),
                auto_start: true,
                stop_timeout_secs: 30,
                call_timeout_ms: 5000,
            },
            socket: SocketSettings {
                mode: "connect".to_string(),
                host: "localhost".to_string(),
                port: 8080,
                reconnect_delay_ms: Some(5000),
                allow_connections: default_allow_connections(),
            },
            logging: LoggingSettings {
                level: "info".to_string(),
                json_format: false,
            },
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, a default configuration file is written at
    /// `path` and the defaults are returned.
    pub async fn load_from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Converts the file configuration into the library's [`BridgeConfig`].
    pub fn to_bridge_config(&self) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
        let mode = match self.socket.mode.as_str() {
            "listen" => SocketMode::Listen {
                bind_address: SocketAddr::from(([0, 0, 0, 0], self.socket.port)),
            },
            "connect" => SocketMode::Connect {
                host: self.socket.host.clone(),
                port: self.socket.port,
            },
            "disabled" => SocketMode::Disabled,
            other => return Err(format!("Invalid socket mode: {other}").into()),
        };

        let allow = match &self.socket.allow_connections {
            AllowConnections::Everyone(true) => AllowList::All,
            AllowConnections::Everyone(false) => AllowList::Only(HashSet::new()),
            AllowConnections::List(addresses) => AllowList::Only(
                addresses
                    .iter()
                    .map(|address| address.parse::<IpAddr>())
                    .collect::<Result<HashSet<_>, _>>()?,
            ),
        };

        Ok(BridgeConfig {
            platform: Platform::from_name(&self.server.platform)?,
            server_dir: PathBuf::from(&self.server.directory),
            stop_timeout: Duration::from_secs(self.server.stop_timeout_secs),
            call_timeout: Duration::from_millis(self.server.call_timeout_ms),
            socket: SocketConfig {
                mode,
                reconnect_delay: self
                    .socket
                    .reconnect_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(SocketConfig::DEFAULT_RECONNECT_DELAY),
                allow,
            },
        })
    }

    /// Validates the configuration for consistency and correctness.
    pub fn validate(&self) -> Result<(), String> {
        if let Err(e) = Platform::from_name(&self.server.platform) {
            return Err(e.to_string());
        }

        if self.server.directory.is_empty() {
            return Err("Server directory cannot be empty".to_string());
        }

        let valid_modes = ["listen", "connect", "disabled"];
        if !valid_modes.contains(&self.socket.mode.as_str()) {
            return Err(format!(
                "Invalid socket mode: {}. Must be one of: {valid_modes:?}",
                &self.socket.mode
            ));
        }

        if self.socket.mode != "disabled" && self.socket.port == 0 {
            return Err("Socket port cannot be 0".to_string());
        }

        if self.socket.mode == "connect" && self.socket.host.trim().is_empty() {
            return Err("Socket host cannot be empty in connect mode".to_string());
        }

        if let AllowConnections::List(addresses) = &self.socket.allow_connections {
            if let Some(bad) = addresses.iter().find(|a| a.parse::<IpAddr>().is_err()) {
                return Err(format!("Invalid address in allow_connections: {bad}"));
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}
