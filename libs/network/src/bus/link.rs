//! Link frames on the serial line
//!
//! ```text
//! [dest u8][src u8][kind u8][len u8][payload; len][crc32 LE; 4]
//! ```
//!
//! Each frame is COBS encoded and terminated by a zero byte, so a receiver can
//! resynchronise at the next delimiter after line noise.

use super::BusAddress;
use crate::error::{Result, TransportError};
use tracing::trace;

pub(crate) const KIND_DATA: u8 = 0x01;
pub(crate) const KIND_ACK: u8 = 0x06;

const HEADER_LEN: usize = 4;
const CRC_LEN: usize = 4;
const MAX_PAYLOAD: usize = u8::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LinkFrame {
    pub dest: BusAddress,
    pub src: BusAddress,
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl LinkFrame {
    pub fn data(dest: BusAddress, src: BusAddress, payload: &[u8]) -> Self {
        Self {
            dest,
            src,
            kind: KIND_DATA,
            payload: payload.to_vec(),
        }
    }

    pub fn ack(dest: BusAddress, src: BusAddress) -> Self {
        Self {
            dest,
            src,
            kind: KIND_ACK,
            payload: Vec::new(),
        }
    }

    /// Encode to delimited wire bytes. `None` if the payload exceeds the length field.
    pub fn encode(&self) -> Option<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD {
            return None;
        }
        let mut raw = Vec::with_capacity(HEADER_LEN + self.payload.len() + CRC_LEN);
        raw.extend_from_slice(&[self.dest, self.src, self.kind, self.payload.len() as u8]);
        raw.extend_from_slice(&self.payload);
        let crc = crc32fast::hash(&raw);
        raw.extend_from_slice(&crc.to_le_bytes());

        let mut wire = cobs::encode_vec(&raw);
        wire.push(0);
        Some(wire)
    }

    /// Decode one COBS block without its delimiter.
    pub fn decode(encoded: &[u8]) -> Result<Self> {
        let raw = cobs::decode_vec(encoded)
            .map_err(|_| TransportError::protocol("invalid COBS block"))?;
        if raw.len() < HEADER_LEN + CRC_LEN {
            return Err(TransportError::protocol(format!(
                "link frame of {} bytes is shorter than its header",
                raw.len()
            )));
        }
        let len = raw[3] as usize;
        if raw.len() != HEADER_LEN + len + CRC_LEN {
            return Err(TransportError::protocol(format!(
                "link frame declares {} payload bytes but carries {}",
                len,
                raw.len() - HEADER_LEN - CRC_LEN
            )));
        }
        let (body, crc) = raw.split_at(HEADER_LEN + len);
        let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        if crc32fast::hash(body) != expected {
            return Err(TransportError::protocol("link frame checksum mismatch"));
        }
        Ok(Self {
            dest: raw[0],
            src: raw[1],
            kind: raw[2],
            payload: body[HEADER_LEN..].to_vec(),
        })
    }
}

fn max_encoded_len(raw_len: usize) -> usize {
    raw_len + raw_len / 254 + 1
}

/// Splits a byte stream at zero delimiters and decodes the blocks in between
#[derive(Debug)]
pub(crate) struct LinkDecoder {
    pending: Vec<u8>,
    overflowed: bool,
    max_block: usize,
}

impl LinkDecoder {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            overflowed: false,
            max_block: max_encoded_len(HEADER_LEN + MAX_PAYLOAD + CRC_LEN),
        }
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.overflowed = false;
    }

    /// Feed raw bytes and return every valid frame they complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<LinkFrame> {
        let mut frames = Vec::new();
        for &byte in bytes {
            if byte != 0 {
                if self.pending.len() < self.max_block {
                    self.pending.push(byte);
                } else {
                    self.overflowed = true;
                }
                continue;
            }

            if !self.overflowed && !self.pending.is_empty() {
                match LinkFrame::decode(&self.pending) {
                    Ok(frame) => frames.push(frame),
                    Err(e) => trace!(len = self.pending.len(), error = %e, "Discarding corrupt link frame"),
                }
            }
            self.reset();
        }
        frames
    }
}
