//! Configuration module for chatline.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::ChatError;
use crate::establish::Role;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the chat endpoint
#[derive(Parser, Debug)]
#[command(name = "chatline")]
#[command(author = "chatline authors")]
#[command(version = "0.1.0")]
#[command(about = "Exchange text messages with one peer over TCP", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Role of this endpoint: listener (server) or initiator (client)
    #[arg(short, long)]
    pub role: Option<String>,

    /// Address to bind to (listener, empty = any) or connect to (initiator)
    #[arg(short, long)]
    pub addr: Option<String>,

    /// Port to listen on or connect to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// How long one accept attempt waits before the cancel check, in ms
    #[arg(long)]
    pub accept_timeout_ms: Option<u64>,

    /// Connect timeout for the initiator, in ms (0 = system default)
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Give up waiting for a peer after this many seconds (listener only)
    #[arg(long)]
    pub wait_deadline_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection-related configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    pub wait_deadline_secs: Option<u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            role: default_role(),
            addr: String::new(),
            port: default_port(),
            accept_timeout_ms: default_accept_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            wait_deadline_secs: None,
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

fn default_role() -> String {
    "listener".to_string()
}

fn default_port() -> u16 {
    5001
}

fn default_accept_timeout_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Connection parameters consumed by the library.
#[derive(Debug, Clone)]
pub struct Settings {
    pub role: Role,
    /// Bind address for the listener, peer address for the initiator.
    pub addr: String,
    pub port: u16,
    pub accept_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Settings {
    pub fn new(role: Role, addr: impl Into<String>, port: u16) -> Self {
        Self {
            role,
            addr: addr.into(),
            port,
            accept_timeout: Duration::from_millis(default_accept_timeout_ms()),
            connect_timeout: Duration::from_millis(default_connect_timeout_ms()),
        }
    }

    pub fn listener(addr: impl Into<String>, port: u16) -> Self {
        Self::new(Role::Listener, addr, port)
    }

    pub fn initiator(addr: impl Into<String>, port: u16) -> Self {
        Self::new(Role::Initiator, addr, port)
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub settings: Settings,
    pub wait_deadline: Option<Duration>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let conn = toml_config.connection;
        let role: Role = cli
            .role
            .as_deref()
            .unwrap_or(conn.role.as_str())
            .parse()
            .map_err(ConfigError::Role)?;

        let settings = Settings {
            role,
            addr: cli.addr.unwrap_or(conn.addr),
            port: cli.port.unwrap_or(conn.port),
            accept_timeout: Duration::from_millis(
                cli.accept_timeout_ms.unwrap_or(conn.accept_timeout_ms),
            ),
            connect_timeout: Duration::from_millis(
                cli.connect_timeout_ms.unwrap_or(conn.connect_timeout_ms),
            ),
        };

        Ok(Config {
            settings,
            wait_deadline: cli
                .wait_deadline_secs
                .or(conn.wait_deadline_secs)
                .map(Duration::from_secs),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Role(ChatError),
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
            ConfigError::Role(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("chatline").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.connection.role, "listener");
        assert_eq!(config.connection.addr, "");
        assert_eq!(config.connection.port, 5001);
        assert_eq!(config.connection.accept_timeout_ms, 1000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [connection]
            role = "client"
            addr = "192.168.1.20"
            port = 6000
            connect_timeout_ms = 250

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.role, "client");
        assert_eq!(config.connection.addr, "192.168.1.20");
        assert_eq!(config.connection.port, 6000);
        assert_eq!(config.connection.connect_timeout_ms, 250);
        assert_eq!(config.connection.accept_timeout_ms, 1000);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [connection]
            role = "server"
            port = 7000
            wait_deadline_secs = 30
        "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["--role", "client", "--addr", "peer.local", "--log-level", "warn"]),
            file,
        )
        .unwrap();

        assert_eq!(config.settings.role, Role::Initiator);
        assert_eq!(config.settings.addr, "peer.local");
        assert_eq!(config.settings.port, 7000);
        assert_eq!(config.wait_deadline, Some(Duration::from_secs(30)));
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_invalid_role_rejected() {
        let err = Config::merge(cli(&["--role", "observer"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Role(ChatError::InvalidRole(_))));
    }

    #[test]
    fn test_settings_builders() {
        let settings = Settings::initiator("10.0.0.1", 5001)
            .with_connect_timeout(Duration::from_millis(10))
            .with_accept_timeout(Duration::from_millis(20));
        assert_eq!(settings.role, Role::Initiator);
        assert_eq!(settings.connect_timeout, Duration::from_millis(10));
        assert_eq!(settings.accept_timeout, Duration::from_millis(20));
    }
}
