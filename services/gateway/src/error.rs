//! Gateway error types

use busgate_codec::{CodecError, Head};
use busgate_network::TransportError;
use thiserror::Error;

/// Failures that stop the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Failed to bind local socket: {0}")]
    Bind(#[source] TransportError),
}

/// Why the retry engine refused a submission
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushRejected {
    #[error("a request with the same reference is already pending")]
    Duplicate,

    #[error("pending queue is full ({capacity} requests)")]
    QueueFull { capacity: usize },
}

/// Client side failures talking to a running gateway
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid packet: {0}")]
    Codec(#[from] CodecError),

    #[error("Expected a version handshake, got {head:?}")]
    Handshake { head: Head },

    #[error("Timed out after {timeout_ms}ms waiting for the gateway")]
    Timeout { timeout_ms: u64 },
}

pub type Result<T> = std::result::Result<T, GatewayError>;
