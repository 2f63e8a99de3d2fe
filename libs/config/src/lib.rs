//! Busgate Configuration
//!
//! Typed configuration for the gateway daemon. Every field has a default, so
//! the daemon runs with no file at all; a TOML file and `BUSGATE__SECTION__FIELD`
//! environment variables are layered on top.

pub mod gateway_config;

pub use gateway_config::{
    BusConfig, BusDriverKind, GatewayConfig, HealthConfig, LoggingConfig, RetryConfig,
    ServerConfig, SocketConfig, ENV_PREFIX,
};
