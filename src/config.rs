//! Configuration module for the grow-a-reactor demo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use grow_a_reactor::protocols::line::DEFAULT_MAX_LINE_LENGTH;
use grow_a_reactor::runtime::{AdaptiveRecvSizing, LoopConfig};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the reactor server
#[derive(Parser, Debug)]
#[command(name = "grow-a-reactor")]
#[command(version)]
#[command(about = "A ping server on an event-driven reactor", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of event loops (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub loops: Option<usize>,

    /// Longest accepted request line, in bytes
    #[arg(long)]
    pub max_line_length: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub buffers: BufferConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of event loops
    pub loops: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            loops: None,
        }
    }
}

/// Receive buffer sizing and pooling
#[derive(Debug, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_min_recv")]
    pub min_recv_size: usize,
    #[serde(default = "default_initial_recv")]
    pub initial_recv_size: usize,
    #[serde(default = "default_max_recv")]
    pub max_recv_size: usize,
    /// Buffers kept per kind by each loop's pool
    #[serde(default = "default_max_pooled")]
    pub max_pooled: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            min_recv_size: default_min_recv(),
            initial_recv_size: default_initial_recv(),
            max_recv_size: default_max_recv(),
            max_pooled: default_max_pooled(),
        }
    }
}

/// Event loop tuning
#[derive(Debug, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
    /// Task drain budget per loop turn; 0 drains the whole queue
    #[serde(default = "default_task_budget_ms")]
    pub task_budget_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            events_capacity: default_events_capacity(),
            task_budget_ms: default_task_budget_ms(),
        }
    }
}

/// Protocol limits
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_line_length: default_max_line_length(),
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
    "127.0.0.1:7000".to_string()
}

fn default_min_recv() -> usize {
    AdaptiveRecvSizing::DEFAULT_MINIMUM
}

fn default_initial_recv() -> usize {
    AdaptiveRecvSizing::DEFAULT_INITIAL
}

fn default_max_recv() -> usize {
    AdaptiveRecvSizing::DEFAULT_MAXIMUM
}

fn default_max_pooled() -> usize {
    256
}

fn default_events_capacity() -> usize {
    1024
}

fn default_task_budget_ms() -> u64 {
    8
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub loops: Option<usize>,
    pub min_recv_size: usize,
    pub initial_recv_size: usize,
    pub max_recv_size: usize,
    pub max_pooled: usize,
    pub events_capacity: usize,
    pub task_budget_ms: u64,
    pub max_line_length: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            loops: cli.loops.or(toml_config.server.loops),
            min_recv_size: toml_config.buffers.min_recv_size,
            initial_recv_size: toml_config.buffers.initial_recv_size,
            max_recv_size: toml_config.buffers.max_recv_size,
            max_pooled: toml_config.buffers.max_pooled,
            events_capacity: toml_config.scheduler.events_capacity,
            task_budget_ms: toml_config.scheduler.task_budget_ms,
            max_line_length: cli
                .max_line_length
                .unwrap_or(toml_config.protocol.max_line_length),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("listen address '{}': {e}", self.listen)))
    }

    /// Loop count; unset or zero means one per CPU.
    pub fn loop_count(&self) -> usize {
        match self.loops {
            Some(n) if n > 0 => n,
            _ => num_cpus(),
        }
    }

    /// Validated per-loop settings.
    pub fn loop_config(&self) -> Result<LoopConfig, ConfigError> {
        let recv_sizing = AdaptiveRecvSizing::new(
            self.min_recv_size,
            self.initial_recv_size,
            self.max_recv_size,
        )
        .map_err(|e| ConfigError::Invalid(format!("receive sizing: {e}")))?;

        if self.events_capacity == 0 {
            return Err(ConfigError::Invalid(
                "events_capacity must be positive".to_string(),
            ));
        }
        if self.max_line_length == 0 {
            return Err(ConfigError::Invalid(
                "max_line_length must be positive".to_string(),
            ));
        }

        Ok(LoopConfig {
            events_capacity: self.events_capacity,
            task_budget: (self.task_budget_ms > 0)
                .then(|| Duration::from_millis(self.task_budget_ms)),
            recv_sizing,
            pool_max_pooled: self.max_pooled,
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["grow-a-reactor"];
        argv.extend_from_slice(args);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:7000");
        assert_eq!(config.buffers.initial_recv_size, 1024);
        assert_eq!(config.scheduler.task_budget_ms, 8);
        assert_eq!(config.protocol.max_line_length, DEFAULT_MAX_LINE_LENGTH);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:7001"
            loops = 4

            [buffers]
            min_recv_size = 128
            max_recv_size = 131072

            [scheduler]
            task_budget_ms = 0

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:7001");
        assert_eq!(config.server.loops, Some(4));
        assert_eq!(config.buffers.min_recv_size, 128);
        assert_eq!(config.buffers.initial_recv_size, 1024);
        assert_eq!(config.scheduler.task_budget_ms, 0);
        assert_eq!(config.logging.level, "debug");

        let resolved = Config::merge(cli(&[]), config);
        let loop_config = resolved.loop_config().unwrap();
        assert_eq!(loop_config.task_budget, None);
        assert_eq!(loop_config.recv_sizing.min_size(), 128);
        assert_eq!(loop_config.recv_sizing.max_size(), 131072);
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str("[server]\nlisten = \"0.0.0.0:1\"\nloops = 8").unwrap();
        let config = Config::merge(cli(&["--listen", "127.0.0.1:9", "-w", "2"]), file);
        assert_eq!(config.listen_addr().unwrap(), "127.0.0.1:9".parse::<SocketAddr>().unwrap());
        assert_eq!(config.loop_count(), 2);
    }

    #[test]
    fn test_invalid_values() {
        let mut config = Config::merge(cli(&[]), TomlConfig::default());
        config.min_recv_size = 4096;
        assert!(matches!(config.loop_config(), Err(ConfigError::Invalid(_))));

        let mut config = Config::merge(cli(&["--listen", "nowhere"]), TomlConfig::default());
        assert!(config.listen_addr().is_err());
        config.loops = Some(0);
        assert!(config.loop_count() >= 1);
    }

    #[test]
    fn test_missing_file() {
        let result = Config::resolve(cli(&["--config", "/nonexistent/reactor.toml"]));
        assert!(matches!(result, Err(ConfigError::FileRead(_, _))));
    }
}
