//! Serial bus boundary
//!
//! The gateway never talks to a device directly. It drives a [`BusDriver`], which
//! owns addressing, acknowledgement and link framing. Two drivers ship with the
//! crate: [`SerialBus`] for real hardware and [`LoopbackBus`] for running the
//! daemon without any.

mod link;
mod loopback;
mod serial;

pub use loopback::LoopbackBus;
pub use serial::{SerialBus, SerialConfig};

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Device address on the bus
pub type BusAddress = u8;

/// Destination that reaches every device. Nothing acknowledges it.
pub const BROADCAST_ADDRESS: BusAddress = 0;

/// Result of a single transmission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The destination confirmed receipt
    Acknowledged,
    /// The frame went out but no acknowledgement arrived in time
    Unacknowledged,
    /// The frame could not be written; the bus is disconnected afterwards
    Failed,
}

/// A message another device addressed to us
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub src: BusAddress,
    pub payload: Vec<u8>,
}

/// Connection to the serial bus
#[async_trait]
pub trait BusDriver: Send {
    /// Open the underlying device. Calling this while connected reopens it.
    async fn connect(&mut self) -> Result<()>;

    /// Close the device. Pending inbound messages are kept.
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Transmit one payload and wait for its acknowledgement.
    async fn send(&mut self, dest: BusAddress, payload: &[u8]) -> SendOutcome;

    /// Collect up to `max` inbound messages, waiting at most `timeout` for the first.
    async fn receive_batch(&mut self, timeout: Duration, max: usize) -> Vec<IncomingMessage>;
}
