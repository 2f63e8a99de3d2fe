//! Protocol constants: packet geometry, head tags and status codes.
//!
//! These values define the local socket protocol and must remain stable for
//! compatibility with deployed clients.

use num_enum::TryFromPrimitive;

/// Size of every packet on the wire, whatever its variant
pub const PACKET_SIZE: usize = 64;

/// Maximum payload carried by an ingoing or outgoing message
pub const DATA_MAX_LENGTH: usize = 50;

/// Protocol version announced to every client right after accept
pub const PROTOCOL_VERSION: &str = "0.0.1";

/// Packet head tag (byte 0 of every frame)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum Head {
    Version = 0x00,
    Info = 0x01,
    Warn = 0x02,
    Error = 0x03,
    /// Message received from the bus, forwarded to clients
    IngoingMessage = 0x04,
    /// Message submitted by a client for delivery on the bus
    OutgoingMessage = 0x05,
    /// Terminal result of an outgoing message
    OutgoingResult = 0x06,
}

/// Codes carried by `Info` packets
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum InfoCode {
    SerialOpened = 0x01,
}

/// Codes carried by `Warn` packets
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum WarnCode {
    /// The pending request queue crossed its warning watermark
    QueueFillingUp = 0x01,
    LowSuccessRate = 0x02,
    HighLatency = 0x03,
}

/// Codes carried by `Error` packets
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum ErrorCode {
    FailedOpenSerial = 0x01,
    ReceivedInvalidPacketHead = 0x02,
    /// Outgoing message refused at submission (queue full or already pending)
    RequestRejected = 0x03,
}

/// Codes carried by `OutgoingResult` packets
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum OutgoingResultCode {
    Success = 0x00,
    InternalError = 0x01,
    ContentTooLong = 0x02,
    ConnectionLost = 0x03,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_values_are_stable() {
        assert_eq!(Head::Version as u8, 0);
        assert_eq!(Head::OutgoingMessage as u8, 5);
        assert_eq!(Head::OutgoingResult as u8, 6);
        assert_eq!(Head::try_from(4u8).unwrap(), Head::IngoingMessage);
        assert!(Head::try_from(7u8).is_err());
    }

    #[test]
    fn test_result_codes_are_distinct() {
        assert_ne!(
            OutgoingResultCode::Success as u16,
            OutgoingResultCode::ConnectionLost as u16
        );
        assert_eq!(
            OutgoingResultCode::try_from(0x03u16).unwrap(),
            OutgoingResultCode::ConnectionLost
        );
    }
}
