//! Busgate Network Infrastructure
//!
//! Everything that touches a file descriptor lives here:
//!
//! - [`multiplexer`]: the local unix socket server. Accepts clients, reassembles
//!   fixed-size packets from their byte streams and drains per-client output queues.
//! - [`bus`]: the [`BusDriver`] boundary towards the serial bus, with a COBS-framed
//!   serial implementation and an in-process loopback.
//! - [`framing`]: the compacting per-client input buffer behind the multiplexer.
//!
//! Nothing in this crate spawns tasks. All I/O is driven from the caller's tick.

pub mod bus;
pub mod error;
pub mod framing;
pub mod multiplexer;
pub mod test_utils;

pub use bus::{
    BusAddress, BusDriver, IncomingMessage, LoopbackBus, SendOutcome, SerialBus, SerialConfig,
    BROADCAST_ADDRESS,
};
pub use error::{Result, TransportError};
pub use framing::InputBuffer;
pub use multiplexer::{ClientId, MultiplexerConfig, Received, SocketMultiplexer};

/// Default location of the gateway socket
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/busgate.sock";

/// Default per-client reassembly buffer size in bytes
pub const DEFAULT_INPUT_BUFFER_SIZE: usize = 2048;

/// Default maximum number of simultaneously connected clients
pub const DEFAULT_MAX_CLIENTS: usize = 1024;
