//! Codec errors
//!
//! Decoding never panics on malformed input: every protocol violation is
//! reported as a [`CodecError`] the caller can turn into an error packet.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Head byte does not select any known packet variant
    #[error("Invalid packet head {head:#04x}")]
    InvalidHead { head: u8 },

    /// Message payload exceeds what a packet can carry
    #[error("Payload too long: {len} bytes exceeds maximum {max}")]
    PayloadTooLong { len: usize, max: usize },

    /// Buffer is shorter than one packet
    #[error("Frame too short: need {need} bytes, got {got}")]
    FrameTooShort { need: usize, got: usize },

    /// Version text does not fit with its NUL terminator
    #[error("Version text too long: {len} bytes exceeds maximum {max}")]
    VersionTooLong { len: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, CodecError>;
