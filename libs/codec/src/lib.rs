//! # Busgate Protocol Codec
//!
//! Encoding and decoding rules for the fixed-size packets exchanged between
//! the gateway daemon and its local socket clients.
//!
//! ## Wire Format
//!
//! Every packet is exactly [`PACKET_SIZE`] bytes. The first byte is the head
//! tag ([`Head`]); the remaining bytes are the variant payload, zero-padded:
//!
//! ```text
//! Version          [head][text .. NUL .. padding                     ]
//! Info/Warn/Error  [head][code LE u16][padding                       ]
//! OutgoingResult   [head][code LE u16][padding                       ]
//! In/OutgoingMsg   [head][peer][len LE u16][data x50][padding x10    ]
//! ```
//!
//! Frame boundaries on a stream are purely positional, so a fixed size is the
//! only framing the protocol needs.
//!
//! ## What This Crate Does NOT Contain
//! - Stream reassembly or socket handling (belongs in `busgate-network`)
//! - Bus transport logic

pub mod constants;
pub mod error;
pub mod packet;

pub use constants::{
    ErrorCode, Head, InfoCode, OutgoingResultCode, WarnCode, DATA_MAX_LENGTH, PACKET_SIZE,
    PROTOCOL_VERSION,
};
pub use error::{CodecError, Result};
pub use packet::{validate_payload_len, Message, Packet};
