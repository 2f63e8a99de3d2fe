//! # Busgate
//!
//! Gateway between local clients speaking 64-byte packets over a unix socket and
//! devices on an acknowledged serial bus.
//!
//! ## Architecture
//!
//! ```text
//!  clients ──unix socket──► SocketMultiplexer ──OutgoingMessage──► RetryEngine ──► BusDriver
//!     ▲                          │   ▲                                 │              │
//!     └──── results, broadcasts ─┘   └──────── OutgoingResult ─────────┘   inbound ───┘
//! ```
//!
//! Everything runs on one task. [`Gateway::run_once`] is a single tick of the
//! control loop; [`Gateway::run`] repeats it until shutdown.
//!
//! - [`retry`]: per-request exponential backoff, bounded attempts, terminal outcomes
//! - [`health`]: moving averages of bus success rate and latency with edge-triggered alerts
//! - [`server`]: the control loop tying sockets, retries and the bus together
//! - [`client`]: a small client used by `busgate-send` and the tests

pub mod client;
pub mod error;
pub mod health;
pub mod retry;
pub mod server;

pub use client::{Delivery, GatewayClient};
pub use error::{ClientError, GatewayError, PushRejected, Result};
pub use health::{HealthAlert, HealthMonitor, HealthSnapshot};
pub use retry::{Completion, Outcome, PushStatus, RetryEngine, RetryPolicy};
pub use server::Gateway;

use busgate_config::GatewayConfig;
use busgate_network::SerialConfig;

/// Serial driver settings derived from the gateway configuration
pub fn serial_config(config: &GatewayConfig) -> SerialConfig {
    SerialConfig {
        device: config.bus.device.clone(),
        baud_rate: config.bus.baud_rate,
        local_id: config.bus.local_id,
        ack_timeout: config.bus.ack_timeout(),
        inbound_capacity: config.server.max_incoming_per_tick,
    }
}
