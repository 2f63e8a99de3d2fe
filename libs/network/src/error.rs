//! Transport Error Types
//!
//! Failures of the unix socket server and the bus drivers.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main transport error type
#[derive(Error, Debug)]
pub enum TransportError {
    /// Socket level errors on the local listener
    #[error("Network error: {message}")]
    Network {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Bus device could not be opened or was lost
    #[error("Connection error: {message} (device: {device:?})")]
    Connection {
        message: String,
        device: Option<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Corrupt or malformed link frame
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Another process is already serving the socket path
    #[error("Socket path {path:?} is already served by a live listener")]
    AddressInUse { path: PathBuf },

    /// Operation attempted on a closed bus
    #[error("Not connected: {operation}")]
    NotConnected { operation: String },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Create a network error with source
    pub fn network_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>, device: Option<&str>) -> Self {
        Self::Connection {
            message: message.into(),
            device: device.map(str::to_string),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        device: Option<&str>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            device: device.map(str::to_string),
            source: Some(Box::new(source)),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(str::to_string),
        }
    }

    /// Create an address-in-use error for a socket path
    pub fn address_in_use(path: &Path) -> Self {
        Self::AddressInUse {
            path: path.to_path_buf(),
        }
    }

    /// Create a not-connected error
    pub fn not_connected(operation: impl Into<String>) -> Self {
        Self::NotConnected {
            operation: operation.into(),
        }
    }

    /// Get error category for log fields
    pub fn category(&self) -> &'static str {
        match self {
            TransportError::Network { .. } => "network",
            TransportError::Connection { .. } => "connection",
            TransportError::Protocol { .. } => "protocol",
            TransportError::Configuration { .. } => "configuration",
            TransportError::AddressInUse { .. } => "address_in_use",
            TransportError::NotConnected { .. } => "not_connected",
            TransportError::Io { .. } => "io",
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        TransportError::Io {
            message: error.to_string(),
            source: error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_names_device() {
        let err = TransportError::connection("Failed to open", Some("/dev/ttyUSB0"));
        assert_eq!(err.category(), "connection");
        assert!(err.to_string().contains("/dev/ttyUSB0"));
    }

    #[test]
    fn test_address_in_use_names_path() {
        let err = TransportError::address_in_use(Path::new("/tmp/busgate.sock"));
        assert_eq!(err.category(), "address_in_use");
        assert!(err.to_string().contains("/tmp/busgate.sock"));
    }

    #[test]
    fn test_not_connected_names_operation() {
        let err = TransportError::not_connected("serial write");
        assert_eq!(err.category(), "not_connected");
        assert_eq!(err.to_string(), "Not connected: serial write");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: TransportError = io.into();
        assert_eq!(err.category(), "io");
        assert!(err.to_string().contains("pipe closed"));
    }
}
