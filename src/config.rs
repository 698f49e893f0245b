//! Configuration module for the chat server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. With neither, the
//! server listens on loopback at the default chat port.

use crate::protocol::DEFAULT_CHAT_PORT;
use clap::Parser;
use serde::Deserialize;
use tokio::sync::Semaphore;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the chat server
#[derive(Parser, Debug)]
#[command(name = "socket-chat")]
#[command(author = "socket-chat authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP chat server answering messages with JSON", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8888)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of clients served at once
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Close clients idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum number of clients served at once
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Idle timeout in seconds
    #[serde(default)]
    pub idle_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
            idle_timeout: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    format!("127.0.0.1:{DEFAULT_CHAT_PORT}")
}

fn default_max_connections() -> usize {
    10000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub workers: Option<usize>,
    pub max_connections: usize,
    /// `None` when clients may stay idle forever.
    pub idle_timeout: Option<Duration>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_CHAT_PORT)),
            workers: None,
            max_connections: default_max_connections(),
            idle_timeout: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Config::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen))?;

        let idle_timeout = cli
            .idle_timeout
            .unwrap_or(toml_config.server.idle_timeout);

        let max_connections = cli
            .max_connections
            .unwrap_or(toml_config.server.max_connections);
        if max_connections > Semaphore::MAX_PERMITS {
            return Err(ConfigError::InvalidMaxConnections(max_connections));
        }

        Ok(Config {
            listen,
            workers: cli.workers.or(toml_config.server.workers),
            max_connections: max_connections.max(1),
            idle_timeout: (idle_timeout > 0).then(|| Duration::from_secs(idle_timeout)),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String),
    InvalidMaxConnections(usize),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidListen(addr) => {
                write!(f, "Invalid listen address '{}'", addr)
            }
            ConfigError::InvalidMaxConnections(n) => {
                write!(
                    f,
                    "max_connections {} exceeds the limit of {}",
                    n,
                    Semaphore::MAX_PERMITS
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_cli_args() -> CliArgs {
        CliArgs {
            config: None,
            listen: None,
            workers: None,
            max_connections: None,
            idle_timeout: None,
            log_level: None,
        }
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:8888");
        assert_eq!(config.server.max_connections, 10000);
        assert_eq!(config.server.idle_timeout, 0);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_default_resolved_config() {
        let config = Config::default();
        assert_eq!(config.listen, "127.0.0.1:8888".parse().unwrap());
        assert!(config.listen.ip().is_loopback());
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.workers, None);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            workers = 4
            max_connections = 16
            idle_timeout = 30

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.max_connections, 16);
        assert_eq!(config.server.idle_timeout, 30);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:9000"
            idle_timeout = 30
        "#,
        )
        .unwrap();

        let cli = CliArgs {
            listen: Some("127.0.0.1:7000".to_string()),
            idle_timeout: Some(5),
            log_level: Some("trace".to_string()),
            ..default_cli_args()
        };

        let config = Config::merge(cli, toml_config).unwrap();
        assert_eq!(config.listen, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_cli_args_parse() {
        let cli = CliArgs::try_parse_from([
            "socket-chat",
            "--listen",
            "127.0.0.1:0",
            "--max-connections",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.listen.as_deref(), Some("127.0.0.1:0"));
        assert_eq!(cli.max_connections, Some(2));
        assert_eq!(cli.log_level, None);
    }

    #[test]
    fn test_invalid_listen() {
        let cli = CliArgs {
            listen: Some("localhost".to_string()),
            ..default_cli_args()
        };
        match Config::merge(cli, TomlConfig::default()) {
            Err(ConfigError::InvalidListen(addr)) => assert_eq!(addr, "localhost"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_explicit_info_log_level_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [logging]
            level = "debug"
        "#,
        )
        .unwrap();

        let cli = CliArgs::try_parse_from(["socket-chat", "--log-level", "info"]).unwrap();
        let config = Config::merge(cli, toml_config).unwrap();
        assert_eq!(config.log_level, "info");

        let toml_config: TomlConfig = toml::from_str("[logging]\nlevel = \"debug\"").unwrap();
        let config = Config::merge(default_cli_args(), toml_config).unwrap();
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_max_connections_out_of_range() {
        let huge = usize::MAX.to_string();
        let cli =
            CliArgs::try_parse_from(["socket-chat", "--max-connections", huge.as_str()]).unwrap();
        match Config::merge(cli, TomlConfig::default()) {
            Err(ConfigError::InvalidMaxConnections(n)) => assert_eq!(n, usize::MAX),
            other => panic!("unexpected: {:?}", other),
        }

        let cli = CliArgs {
            max_connections: Some(Semaphore::MAX_PERMITS),
            ..default_cli_args()
        };
        let config = Config::merge(cli, TomlConfig::default()).unwrap();
        assert_eq!(config.max_connections, Semaphore::MAX_PERMITS);
    }

    #[test]
    fn test_max_connections_zero_becomes_one() {
        let toml_config: TomlConfig = toml::from_str("[server]\nmax_connections = 0").unwrap();
        let config = Config::merge(default_cli_args(), toml_config).unwrap();
        assert_eq!(config.max_connections, 1);
    }
}
