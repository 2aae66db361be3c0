//! Configuration module for the echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "echo-reactor")]
#[command(author = "echo-reactor authors")]
#[command(version = "0.1.0")]
#[command(about = "An edge-triggered TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// TCP port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum pending connection backlog
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Number of worker threads
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Task queue capacity
    #[arg(short = 'q', long)]
    pub queue_capacity: Option<usize>,

    /// Size of each pooled buffer in bytes
    #[arg(short = 'b', long)]
    pub block_size: Option<usize>,

    /// Number of buffers in the block pool
    #[arg(long)]
    pub pool_capacity: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and reactor configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum pending connection backlog passed to listen(2)
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum number of simultaneously open client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Readiness wait timeout in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Maximum events drained per readiness wait
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// How long a blocked send may wait for the peer, in milliseconds
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Receive calls a single task performs before yielding its worker
    #[serde(default = "default_max_reads_per_event")]
    pub max_reads_per_event: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            poll_timeout_ms: default_poll_timeout_ms(),
            max_events: default_max_events(),
            send_timeout_ms: default_send_timeout_ms(),
            max_reads_per_event: default_max_reads_per_event(),
        }
    }
}

/// Worker pool and block pool configuration
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            block_size: default_block_size(),
            pool_capacity: default_pool_capacity(),
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_backlog() -> u32 {
    10000
}

fn default_max_connections() -> usize {
    10000
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_max_events() -> usize {
    1000
}

fn default_send_timeout_ms() -> u64 {
    5000
}

fn default_max_reads_per_event() -> usize {
    64
}

fn default_workers() -> usize {
    10
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_block_size() -> usize {
    4096
}

fn default_pool_capacity() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub max_connections: usize,
    pub poll_timeout: Duration,
    pub max_events: usize,
    pub send_timeout: Duration,
    pub max_reads_per_event: usize,
    pub workers: usize,
    pub queue_capacity: usize,
    pub block_size: usize,
    pub pool_capacity: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args over TOML values.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let TomlConfig {
            server,
            pool,
            logging,
        } = toml_config;

        Config {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            backlog: cli.backlog.unwrap_or(server.backlog),
            max_connections: server.max_connections,
            poll_timeout: Duration::from_millis(server.poll_timeout_ms),
            max_events: server.max_events,
            send_timeout: Duration::from_millis(server.send_timeout_ms),
            max_reads_per_event: server.max_reads_per_event,
            workers: cli.workers.unwrap_or(pool.workers),
            queue_capacity: cli.queue_capacity.unwrap_or(pool.queue_capacity),
            block_size: cli.block_size.unwrap_or(pool.block_size),
            pool_capacity: cli.pool_capacity.unwrap_or(pool.pool_capacity),
            log_level: cli.log_level.unwrap_or(logging.level),
        }
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("workers", self.workers),
            ("queue_capacity", self.queue_capacity),
            ("block_size", self.block_size),
            ("pool_capacity", self.pool_capacity),
            ("max_events", self.max_events),
            ("max_connections", self.max_connections),
            ("max_reads_per_event", self.max_reads_per_event),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero",
                });
            }
        }
        if self.backlog == 0 {
            return Err(ConfigError::Invalid {
                field: "backlog",
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }

    /// The `host:port` string the listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {field} {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:8080");
        assert_eq!(config.backlog, 10000);
        assert_eq!(config.workers, 10);
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.pool_capacity, 1000);
        assert_eq!(config.max_events, 1000);
        assert_eq!(config.poll_timeout, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9000
            backlog = 128
            poll_timeout_ms = 250
            max_events = 64

            [pool]
            workers = 4
            queue_capacity = 16
            block_size = 512
            pool_capacity = 8

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.server.poll_timeout_ms, 250);
        assert_eq!(config.server.max_events, 64);
        // Unset fields keep their defaults
        assert_eq!(config.server.max_connections, 10000);
        assert_eq!(config.pool.workers, 4);
        assert_eq!(config.pool.queue_capacity, 16);
        assert_eq!(config.pool.block_size, 512);
        assert_eq!(config.pool.pool_capacity, 8);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 9000

            [pool]
            workers = 4
            block_size = 512
        "#,
        )
        .unwrap();

        let cli = CliArgs {
            port: Some(7000),
            workers: Some(2),
            log_level: Some("trace".to_string()),
            ..CliArgs::default()
        };

        let config = Config::merge(cli, toml_config);
        assert_eq!(config.port, 7000);
        assert_eq!(config.workers, 2);
        assert_eq!(config.block_size, 512);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = Config {
            pool_capacity: 0,
            ..Config::default()
        };
        match config.validate() {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "pool_capacity"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_file_is_reported() {
        let path = PathBuf::from("/nonexistent/echo-reactor.toml");
        let err = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::FileRead(path.clone(), e))
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/echo-reactor.toml"));
    }
}
