//! Configuration for the frame server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values. The resolved
//! [`Config`] is an immutable value handed to [`Server::new`](crate::Server::new).

use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// Command-line arguments for the server binary
#[derive(Parser, Debug)]
#[command(name = "frame-server")]
#[command(author = "frame-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP server with length-prefixed message routing", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// IP address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker tasks (0 = dispatch every message on its own task)
    #[arg(short = 'w', long)]
    pub workers: Option<u32>,

    /// Maximum number of concurrent connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub framework: FrameworkSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Server name reported in logs
    #[serde(default = "default_name")]
    pub name: String,
    /// IP address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Connection, framing and worker pool limits
#[derive(Debug, Deserialize)]
pub struct FrameworkSection {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Largest accepted payload in bytes (0 = unbounded)
    #[serde(default = "default_max_package_size")]
    pub max_package_size: u32,
    /// Number of worker tasks (0 = direct dispatch)
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: u32,
    /// Capacity of each worker's task queue
    #[serde(default = "default_max_worker_task_len")]
    pub max_worker_task_len: usize,
}

impl Default for FrameworkSection {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_package_size: default_max_package_size(),
            worker_pool_size: default_worker_pool_size(),
            max_worker_task_len: default_max_worker_task_len(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_name() -> String {
    "frame-server".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8999
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_package_size() -> u32 {
    4096
}

fn default_worker_pool_size() -> u32 {
    10
}

fn default_max_worker_task_len() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub max_package_size: u32,
    pub worker_pool_size: u32,
    pub max_worker_task_len: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::from(TomlConfig::default())
    }
}

impl From<TomlConfig> for Config {
    fn from(toml: TomlConfig) -> Self {
        Config {
            name: toml.server.name,
            host: toml.server.host,
            port: toml.server.port,
            max_connections: toml.framework.max_connections,
            max_package_size: toml.framework.max_package_size,
            worker_pool_size: toml.framework.worker_pool_size,
            max_worker_task_len: toml.framework.max_worker_task_len,
            log_level: toml.logging.level,
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve already-parsed CLI arguments against the optional TOML file.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut config = Config::from(toml_config);
        if let Some(host) = cli.host {
            config.host = host;
        }
        if let Some(port) = cli.port {
            config.port = port;
        }
        if let Some(workers) = cli.workers {
            config.worker_pool_size = workers;
        }
        if let Some(max_connections) = cli.max_connections {
            config.max_connections = max_connections;
        }
        if cli.log_level != "info" {
            config.log_level = cli.log_level;
        }

        Ok(config)
    }

    /// Socket address to bind. `host` must be an IPv4 or IPv6 literal.
    pub fn listen_addr(&self) -> crate::Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| crate::Error::InvalidAddress(self.host.clone()))?;
        Ok(SocketAddr::from((ip, self.port)))
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
}
