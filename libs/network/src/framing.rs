//! Fixed-size frame reassembly
//!
//! Stream sockets deliver arbitrary byte runs. [`InputBuffer`] accumulates them and
//! slices off whole [`PACKET_SIZE`] frames. Consumed bytes are reclaimed by moving the
//! unread tail to the front before every fill, so the buffer never grows.

use busgate_codec::PACKET_SIZE;
use std::io;

/// Compacting reassembly buffer with a fixed capacity
#[derive(Debug)]
pub struct InputBuffer {
    data: Box<[u8]>,
    start: usize,
    stop: usize,
}

impl InputBuffer {
    /// Create a buffer. Capacities below one frame are raised to one frame.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity.max(PACKET_SIZE)].into_boxed_slice(),
            start: 0,
            stop: 0,
        }
    }

    /// Bytes received but not yet returned as frames
    fn buffered(&self) -> usize {
        self.stop - self.start
    }

    fn has_frame(&self) -> bool {
        self.buffered() >= PACKET_SIZE
    }

    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.data.copy_within(self.start..self.stop, 0);
        self.stop -= self.start;
        self.start = 0;
    }

    /// Compact, then hand the free tail to `read`. Whatever `read` reports as
    /// written becomes buffered.
    pub fn fill_with<F>(&mut self, read: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        self.compact();
        let n = read(&mut self.data[self.stop..])?;
        self.stop += n.min(self.data.len() - self.stop);
        Ok(n)
    }

    /// Copy as much of `bytes` as fits and return how many were taken.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> usize {
        self.compact();
        let take = bytes.len().min(self.data.len() - self.stop);
        self.data[self.stop..self.stop + take].copy_from_slice(&bytes[..take]);
        self.stop += take;
        take
    }

    /// Remove the oldest complete frame
    pub fn next_frame(&mut self) -> Option<[u8; PACKET_SIZE]> {
        if !self.has_frame() {
            return None;
        }
        let mut frame = [0u8; PACKET_SIZE];
        frame.copy_from_slice(&self.data[self.start..self.start + PACKET_SIZE]);
        self.start += PACKET_SIZE;
        if self.start == self.stop {
            self.start = 0;
            self.stop = 0;
        }
        Some(frame)
    }
}
