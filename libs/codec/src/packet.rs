//! Packet Implementation
//!
//! [`Packet`] is a plain tagged value. Its byte layout is produced by the
//! `#[repr(C)]` frame structs below, which are exactly [`PACKET_SIZE`] bytes
//! each with no padding, so encoding and decoding are straight copies.

use crate::constants::{
    ErrorCode, Head, InfoCode, OutgoingResultCode, WarnCode, DATA_MAX_LENGTH, PACKET_SIZE,
    PROTOCOL_VERSION,
};
use crate::error::{CodecError, Result};
use std::fmt;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

const VERSION_TEXT_SIZE: usize = PACKET_SIZE - 1;
const CODE_PADDING: usize = PACKET_SIZE - 3;
const MESSAGE_PADDING: usize = PACKET_SIZE - 4 - DATA_MAX_LENGTH;

/// Version frame: NUL-terminated text in bytes 1..64
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct VersionFrame {
    head: u8,
    text: [u8; VERSION_TEXT_SIZE],
}

/// Info / Warn / Error / OutgoingResult frame: little-endian code in bytes 1..3
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct CodeFrame {
    head: u8,
    code: [u8; 2],
    padding: [u8; CODE_PADDING],
}

/// Ingoing / Outgoing message frame
///
/// ```text
/// [0] head  [1] peer  [2..4] length LE  [4..54] data  [54..64] padding
/// ```
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct MessageFrame {
    head: u8,
    peer: u8,
    length: [u8; 2],
    data: [u8; DATA_MAX_LENGTH],
    padding: [u8; MESSAGE_PADDING],
}

/// Check that a payload fits in a message packet
pub fn validate_payload_len(len: usize) -> Result<()> {
    if len > DATA_MAX_LENGTH {
        return Err(CodecError::PayloadTooLong {
            len,
            max: DATA_MAX_LENGTH,
        });
    }
    Ok(())
}

/// Bus message carried by `IngoingMessage` and `OutgoingMessage` packets
///
/// `peer` is the source address for ingoing messages and the destination
/// address for outgoing ones. The declared length is kept as received, so a
/// decoded message may declare more bytes than a packet can carry; use
/// [`Message::payload`] to get the validated bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    peer: u8,
    length: u16,
    data: [u8; DATA_MAX_LENGTH],
}

impl Message {
    /// Build a message, rejecting payloads longer than [`DATA_MAX_LENGTH`]
    pub fn new(peer: u8, payload: &[u8]) -> Result<Self> {
        validate_payload_len(payload.len())?;
        let mut data = [0u8; DATA_MAX_LENGTH];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            peer,
            length: payload.len() as u16,
            data,
        })
    }

    pub fn peer(&self) -> u8 {
        self.peer
    }

    /// Length as declared on the wire
    pub fn declared_len(&self) -> usize {
        self.length as usize
    }

    /// Payload bytes, or `PayloadTooLong` when the declared length overflows
    /// the packet
    pub fn payload(&self) -> Result<&[u8]> {
        validate_payload_len(self.declared_len())?;
        Ok(&self.data[..self.declared_len()])
    }

    /// Bytes the client asked to send, sized to the declared length.
    ///
    /// An oversized declaration keeps its length (zero-filled past the bytes
    /// a frame can hold) so that delivery reports it as too long instead of
    /// silently truncating it.
    pub fn submitted_payload(&self) -> Vec<u8> {
        let carried = self.declared_len().min(DATA_MAX_LENGTH);
        let mut payload = vec![0u8; self.declared_len()];
        payload[..carried].copy_from_slice(&self.data[..carried]);
        payload
    }

    fn from_frame(frame: &MessageFrame) -> Self {
        let length = u16::from_le_bytes(frame.length);
        let carried = (length as usize).min(DATA_MAX_LENGTH);
        let mut data = [0u8; DATA_MAX_LENGTH];
        data[..carried].copy_from_slice(&frame.data[..carried]);
        Self {
            peer: frame.peer,
            length,
            data,
        }
    }

    fn to_frame(self, head: Head) -> Result<MessageFrame> {
        validate_payload_len(self.declared_len())?;
        Ok(MessageFrame {
            head: head as u8,
            peer: self.peer,
            length: self.length.to_le_bytes(),
            data: self.data,
            padding: [0u8; MESSAGE_PADDING],
        })
    }
}

/// One fixed-size protocol packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Version(String),
    Info(u16),
    Warn(u16),
    Error(u16),
    IngoingMessage(Message),
    OutgoingMessage(Message),
    OutgoingResult(u16),
}

impl Packet {
    /// Handshake packet announcing [`PROTOCOL_VERSION`]
    pub fn version() -> Self {
        Packet::Version(PROTOCOL_VERSION.to_string())
    }

    pub fn info(code: InfoCode) -> Self {
        Packet::Info(code as u16)
    }

    pub fn warn(code: WarnCode) -> Self {
        Packet::Warn(code as u16)
    }

    pub fn error(code: ErrorCode) -> Self {
        Packet::Error(code as u16)
    }

    pub fn outgoing_result(code: OutgoingResultCode) -> Self {
        Packet::OutgoingResult(code as u16)
    }

    /// Message received from bus address `src`
    pub fn ingoing_message(src: u8, payload: &[u8]) -> Result<Self> {
        Ok(Packet::IngoingMessage(Message::new(src, payload)?))
    }

    /// Message to deliver to bus address `dest`
    pub fn outgoing_message(dest: u8, payload: &[u8]) -> Result<Self> {
        Ok(Packet::OutgoingMessage(Message::new(dest, payload)?))
    }

    pub fn head(&self) -> Head {
        match self {
            Packet::Version(_) => Head::Version,
            Packet::Info(_) => Head::Info,
            Packet::Warn(_) => Head::Warn,
            Packet::Error(_) => Head::Error,
            Packet::IngoingMessage(_) => Head::IngoingMessage,
            Packet::OutgoingMessage(_) => Head::OutgoingMessage,
            Packet::OutgoingResult(_) => Head::OutgoingResult,
        }
    }

    /// Serialize to exactly [`PACKET_SIZE`] bytes
    pub fn encode(&self) -> Result<[u8; PACKET_SIZE]> {
        let mut out = [0u8; PACKET_SIZE];
        match self {
            Packet::Version(text) => {
                // Keep room for the NUL terminator
                if text.len() >= VERSION_TEXT_SIZE {
                    return Err(CodecError::VersionTooLong {
                        len: text.len(),
                        max: VERSION_TEXT_SIZE - 1,
                    });
                }
                let mut frame = VersionFrame::new_zeroed();
                frame.head = Head::Version as u8;
                frame.text[..text.len()].copy_from_slice(text.as_bytes());
                out.copy_from_slice(frame.as_bytes());
            }
            Packet::Info(code)
            | Packet::Warn(code)
            | Packet::Error(code)
            | Packet::OutgoingResult(code) => {
                let frame = CodeFrame {
                    head: self.head() as u8,
                    code: code.to_le_bytes(),
                    padding: [0u8; CODE_PADDING],
                };
                out.copy_from_slice(frame.as_bytes());
            }
            Packet::IngoingMessage(message) | Packet::OutgoingMessage(message) => {
                let frame = message.to_frame(self.head())?;
                out.copy_from_slice(frame.as_bytes());
            }
        }
        Ok(out)
    }

    /// Parse one packet from the first [`PACKET_SIZE`] bytes of `bytes`.
    ///
    /// The head byte alone selects the layout; an unknown head is reported
    /// as [`CodecError::InvalidHead`] before any variant field is read.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PACKET_SIZE {
            return Err(CodecError::FrameTooShort {
                need: PACKET_SIZE,
                got: bytes.len(),
            });
        }
        let bytes = &bytes[..PACKET_SIZE];
        let head =
            Head::try_from(bytes[0]).map_err(|_| CodecError::InvalidHead { head: bytes[0] })?;

        let packet = match head {
            Head::Version => {
                let text = &bytes[1..];
                let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
                Packet::Version(String::from_utf8_lossy(&text[..end]).into_owned())
            }
            Head::Info | Head::Warn | Head::Error | Head::OutgoingResult => {
                let code = u16::from_le_bytes([bytes[1], bytes[2]]);
                match head {
                    Head::Info => Packet::Info(code),
                    Head::Warn => Packet::Warn(code),
                    Head::Error => Packet::Error(code),
                    _ => Packet::OutgoingResult(code),
                }
            }
            Head::IngoingMessage | Head::OutgoingMessage => {
                let frame = MessageFrame::read_from(bytes).ok_or(CodecError::FrameTooShort {
                    need: PACKET_SIZE,
                    got: bytes.len(),
                })?;
                let message = Message::from_frame(&frame);
                if head == Head::IngoingMessage {
                    Packet::IngoingMessage(message)
                } else {
                    Packet::OutgoingMessage(message)
                }
            }
        };
        Ok(packet)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Version(text) => write!(f, "Version{{'{}'}}", text),
            Packet::Info(code) => write!(f, "Info{{code={:#06x}}}", code),
            Packet::Warn(code) => write!(f, "Warn{{code={:#06x}}}", code),
            Packet::Error(code) => write!(f, "Error{{code={:#06x}}}", code),
            Packet::IngoingMessage(m) => {
                write!(f, "IngoingMessage{{src={:#04x} len={}}}", m.peer, m.length)
            }
            Packet::OutgoingMessage(m) => {
                write!(f, "OutgoingMessage{{dest={:#04x} len={}}}", m.peer, m.length)
            }
            Packet::OutgoingResult(code) => write!(f, "OutgoingResult{{code={:#06x}}}", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_frame_structs_are_packet_sized() {
        assert_eq!(std::mem::size_of::<VersionFrame>(), PACKET_SIZE);
        assert_eq!(std::mem::size_of::<CodeFrame>(), PACKET_SIZE);
        assert_eq!(std::mem::size_of::<MessageFrame>(), PACKET_SIZE);
    }

    #[test]
    fn test_outgoing_message_byte_layout() {
        let packet = Packet::outgoing_message(0x22, b"hi").unwrap();
        let bytes = packet.encode().unwrap();

        assert_eq!(bytes.len(), PACKET_SIZE);
        assert_eq!(bytes[0], Head::OutgoingMessage as u8);
        assert_eq!(bytes[1], 0x22);
        assert_eq!(&bytes[2..4], &[2, 0]);
        assert_eq!(&bytes[4..6], b"hi");
        assert!(bytes[6..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_code_byte_layout_is_little_endian() {
        let bytes = Packet::Warn(0x1234).encode().unwrap();
        assert_eq!(bytes[0], Head::Warn as u8);
        assert_eq!(&bytes[1..3], &[0x34, 0x12]);
        assert!(bytes[3..].iter().all(|&b| b == 0));

        let result = Packet::outgoing_result(OutgoingResultCode::ConnectionLost);
        assert_eq!(result.encode().unwrap()[1], 0x03);
    }

    #[test]
    fn test_version_is_nul_terminated() {
        let bytes = Packet::version().encode().unwrap();
        assert_eq!(bytes[0], Head::Version as u8);
        assert_eq!(&bytes[1..6], PROTOCOL_VERSION.as_bytes());
        assert_eq!(bytes[6], 0);
        assert_eq!(
            Packet::decode(&bytes).unwrap(),
            Packet::Version(PROTOCOL_VERSION.to_string())
        );
    }

    #[test]
    fn test_version_too_long_is_rejected() {
        let text = "v".repeat(PACKET_SIZE - 1);
        assert!(matches!(
            Packet::Version(text).encode(),
            Err(CodecError::VersionTooLong { .. })
        ));
        assert!(Packet::Version("v".repeat(PACKET_SIZE - 2)).encode().is_ok());
    }

    #[test]
    fn test_oversized_payload_is_rejected_not_truncated() {
        let payload = [0xAAu8; DATA_MAX_LENGTH + 1];
        assert_eq!(
            Packet::outgoing_message(0x22, &payload),
            Err(CodecError::PayloadTooLong {
                len: DATA_MAX_LENGTH + 1,
                max: DATA_MAX_LENGTH
            })
        );
        assert!(Packet::ingoing_message(0x22, &payload[..DATA_MAX_LENGTH]).is_ok());
        assert!(validate_payload_len(DATA_MAX_LENGTH).is_ok());
    }

    #[test]
    fn test_unknown_head_is_protocol_violation() {
        let mut bytes = [0u8; PACKET_SIZE];
        bytes[0] = 0x7f;
        assert_eq!(
            Packet::decode(&bytes),
            Err(CodecError::InvalidHead { head: 0x7f })
        );
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        let bytes = [Head::Info as u8; PACKET_SIZE - 1];
        assert!(matches!(
            Packet::decode(&bytes),
            Err(CodecError::FrameTooShort { got: 63, .. })
        ));
    }

    #[test]
    fn test_decode_reads_only_one_packet() {
        let mut stream = Packet::info(InfoCode::SerialOpened).encode().unwrap().to_vec();
        stream.extend_from_slice(&[0xff; 10]);
        assert_eq!(Packet::decode(&stream).unwrap(), Packet::Info(0x01));
    }

    #[test]
    fn test_oversized_declaration_decodes_and_keeps_length() {
        let mut bytes = Packet::outgoing_message(0x33, b"abc")
            .unwrap()
            .encode()
            .unwrap();
        bytes[2..4].copy_from_slice(&51u16.to_le_bytes());

        let Packet::OutgoingMessage(message) = Packet::decode(&bytes).unwrap() else {
            panic!("Expected OutgoingMessage");
        };
        assert_eq!(message.declared_len(), 51);
        assert!(message.payload().is_err());
        let submitted = message.submitted_payload();
        assert_eq!(submitted.len(), 51);
        assert_eq!(&submitted[..3], b"abc");

        // Such a message cannot be re-encoded
        assert!(Packet::OutgoingMessage(message).encode().is_err());
    }

    #[test]
    fn test_display_snapshot() {
        let packet = Packet::outgoing_message(0x22, b"hi").unwrap();
        assert_eq!(packet.to_string(), "OutgoingMessage{dest=0x22 len=2}");
        assert_eq!(
            Packet::error(ErrorCode::FailedOpenSerial).to_string(),
            "Error{code=0x0001}"
        );
    }

    proptest! {
        #[test]
        fn prop_message_packets_survive_encoding(
            peer in any::<u8>(),
            payload in proptest::collection::vec(any::<u8>(), 0..=DATA_MAX_LENGTH),
            ingoing in any::<bool>(),
        ) {
            let packet = if ingoing {
                Packet::ingoing_message(peer, &payload).unwrap()
            } else {
                Packet::outgoing_message(peer, &payload).unwrap()
            };
            let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
            prop_assert_eq!(&decoded, &packet);
            match decoded {
                Packet::IngoingMessage(m) | Packet::OutgoingMessage(m) => {
                    prop_assert_eq!(m.payload().unwrap(), &payload[..]);
                }
                _ => prop_assert!(false, "wrong variant"),
            }
        }
    }
}
