//! Server configuration
//!
//! Defaults, optionally overridden by a JSON file named in `WS_CONFIG`
//! and then by positional command line arguments `[port] [strategy]`.

use std::env;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ServerError;

/// Environment variable holding the path of a JSON config file
pub const CONFIG_ENV: &str = "WS_CONFIG";

/// Which built-in strategy each connection runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Echo,
    Chat,
    Tick,
}

impl FromStr for StrategyKind {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "echo" => Ok(StrategyKind::Echo),
            "chat" => Ok(StrategyKind::Chat),
            "tick" => Ok(StrategyKind::Tick),
            other => Err(ServerError::Config(format!("unknown strategy '{}'", other))),
        }
    }
}

/// Server settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: String,
    /// TCP port to listen on
    pub port: u16,
    /// Listen backlog
    pub backlog: u32,
    /// Upper bound on the upgrade request, in bytes
    pub handshake_buffer: usize,
    /// Handshake read timeout in milliseconds; absent waits forever
    pub handshake_timeout_ms: Option<u64>,
    /// Deadline for one frame write in milliseconds; absent waits forever
    pub write_timeout_ms: Option<u64>,
    /// Sleep between empty non-blocking reads
    pub poll_interval_ms: u64,
    /// Period of the tick strategy
    pub tick_interval_ms: u64,
    /// Registry command channel capacity
    pub registry_buffer: usize,
    /// Per-connection behaviour
    pub strategy: StrategyKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4545,
            backlog: 5,
            handshake_buffer: 2048,
            handshake_timeout_ms: Some(10_000),
            write_timeout_ms: Some(5_000),
            poll_interval_ms: 10,
            tick_interval_ms: 1000,
            registry_buffer: 256,
            strategy: StrategyKind::Tick,
        }
    }
}

impl ServerConfig {
    /// Parse a JSON config document; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self, ServerError> {
        let config: ServerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `WS_CONFIG` (if set) and the command line
    pub fn load() -> Result<Self, ServerError> {
        let mut config = match env::var(CONFIG_ENV) {
            Ok(path) => Self::from_json(&fs::read_to_string(path)?)?,
            Err(_) => Self::default(),
        };
        config.apply_args(env::args().skip(1))?;
        Ok(config)
    }

    /// Apply positional `[port] [strategy]` overrides
    pub fn apply_args<I>(&mut self, mut args: I) -> Result<(), ServerError>
    where
        I: Iterator<Item = String>,
    {
        if let Some(port) = args.next() {
            self.port = port
                .parse()
                .map_err(|_| ServerError::Config(format!("invalid port '{}'", port)))?;
        }
        if let Some(strategy) = args.next() {
            self.strategy = strategy.parse()?;
        }
        self.validate()
    }

    fn validate(&self) -> Result<(), ServerError> {
        if self.registry_buffer == 0 {
            return Err(ServerError::Config("registry_buffer must be positive".into()));
        }
        if self.handshake_buffer < 16 {
            return Err(ServerError::Config("handshake_buffer is too small".into()));
        }
        Ok(())
    }

    /// `host:port` string to bind
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
