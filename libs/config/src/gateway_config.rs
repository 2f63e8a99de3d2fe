//! Gateway Configuration Module
//!
//! Loads [`GatewayConfig`] from defaults, an optional TOML file and environment
//! variables, in that order of precedence (last wins).

use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Prefix of environment overrides, e.g. `BUSGATE__RETRY__MAX_ATTEMPTS=10`
pub const ENV_PREFIX: &str = "BUSGATE";

const ENV_SEPARATOR: &str = "__";

/// Smallest allowed reassembly buffer: one 64-byte packet
const MIN_INPUT_BUFFER_SIZE: usize = 64;

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub socket: SocketConfig,
    pub server: ServerConfig,
    pub bus: BusConfig,
    pub retry: RetryConfig,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
}

/// Local socket settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub path: PathBuf,
    pub max_clients: usize,
    pub input_buffer_size: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/busgate.sock"),
            max_clients: 1024,
            input_buffer_size: 2048,
        }
    }
}

/// Control loop pacing and batch limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub tick_period_ms: u64,
    pub max_results_per_tick: usize,
    pub max_incoming_per_tick: usize,
    pub receive_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    /// Zero disables the periodic statistics line
    pub stats_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 4,
            max_results_per_tick: 1000,
            max_incoming_per_tick: 1024,
            receive_timeout_ms: 0,
            reconnect_interval_ms: 1000,
            stats_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}

/// Which bus driver the daemon runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusDriverKind {
    Serial,
    Loopback,
}

/// Serial bus settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub driver: BusDriverKind,
    pub device: String,
    pub baud_rate: u32,
    pub local_id: u8,
    pub ack_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            driver: BusDriverKind::Serial,
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 19200,
            local_id: 0x42,
            ack_timeout_ms: 35,
        }
    }
}

impl BusConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Retry and backoff policy for outgoing messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_backoff_ms: u64,
    pub backoff_factor: f64,
    pub max_attempts: u32,
    pub max_backoff_ms: Option<u64>,
    /// Pending requests at which submitters are warned
    pub queue_warning_threshold: usize,
    /// Pending requests beyond which submissions are rejected
    pub queue_capacity: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1,
            backoff_factor: 1.4,
            max_attempts: 40,
            max_backoff_ms: None,
            queue_warning_threshold: 256,
            queue_capacity: 1024,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Option<Duration> {
        self.max_backoff_ms.map(Duration::from_millis)
    }
}

/// Health monitor thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Smoothing window of the moving averages
    pub window: u32,
    pub min_success_rate: f64,
    pub max_latency_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: 32,
            min_success_rate: 0.8,
            max_latency_ms: 500,
        }
    }
}

impl HealthConfig {
    pub fn max_latency(&self) -> Duration {
        Duration::from_millis(self.max_latency_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from an optional file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`load`](Self::load) but reads overrides from `env` instead of the
    /// process environment when given.
    pub fn load_with_env(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading gateway config: {:?}", path);
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .source(env),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let mut config: GatewayConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.expand_env_vars()?;
        config.validate()?;
        debug!(?config, "Gateway configuration loaded");
        Ok(config)
    }

    /// Parse a TOML document on its own, without environment overrides
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: GatewayConfig =
            toml::from_str(content).context("Failed to parse TOML configuration")?;
        config.expand_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in path-like values
    pub fn expand_env_vars(&mut self) -> Result<()> {
        let socket = self.socket.path.to_string_lossy().into_owned();
        let expanded = shellexpand::env(&socket).context("Failed to expand socket path")?;
        self.socket.path = PathBuf::from(expanded.as_ref());

        let expanded = shellexpand::env(&self.bus.device).context("Failed to expand bus device")?;
        self.bus.device = expanded.to_string();
        Ok(())
    }

    /// Reject values the gateway cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.socket.path.as_os_str().is_empty() {
            bail!("socket.path must not be empty");
        }
        if self.socket.max_clients == 0 {
            bail!("socket.max_clients must be at least 1");
        }
        if self.socket.input_buffer_size < MIN_INPUT_BUFFER_SIZE {
            bail!(
                "socket.input_buffer_size must be at least {} bytes, got {}",
                MIN_INPUT_BUFFER_SIZE,
                self.socket.input_buffer_size
            );
        }
        if self.server.tick_period_ms == 0 {
            bail!("server.tick_period_ms must be greater than zero");
        }
        if self.server.max_results_per_tick == 0 {
            bail!("server.max_results_per_tick must be at least 1");
        }
        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor <= 1.0 {
            bail!(
                "retry.backoff_factor must be a finite number greater than 1, got {}",
                self.retry.backoff_factor
            );
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.queue_warning_threshold == 0 {
            bail!("retry.queue_warning_threshold must be at least 1");
        }
        if self.retry.queue_capacity < self.retry.queue_warning_threshold {
            bail!(
                "retry.queue_capacity ({}) must not be below retry.queue_warning_threshold ({})",
                self.retry.queue_capacity,
                self.retry.queue_warning_threshold
            );
        }
        if let Some(max) = self.retry.max_backoff_ms {
            if max < self.retry.initial_backoff_ms {
                bail!("retry.max_backoff_ms must not be below retry.initial_backoff_ms");
            }
        }
        if self.health.window == 0 {
            bail!("health.window must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.health.min_success_rate) {
            bail!(
                "health.min_success_rate must lie in [0, 1], got {}",
                self.health.min_success_rate
            );
        }
        if self.bus.driver == BusDriverKind::Serial && self.bus.device.is_empty() {
            bail!("bus.device must be set for the serial driver");
        }
        Ok(())
    }
}
