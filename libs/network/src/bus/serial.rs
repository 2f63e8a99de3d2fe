//! Serial bus driver
//!
//! Frames are COBS encoded link frames (see `link`). A unicast send writes one
//! DATA frame and then reads the line until the destination's ACK arrives or the
//! acknowledgement window closes. DATA frames that show up meanwhile are
//! acknowledged and queued for [`BusDriver::receive_batch`].
//!
//! Any I/O error closes the port. The owner decides when to reconnect.

use super::link::{LinkDecoder, LinkFrame, KIND_ACK, KIND_DATA};
use super::{BusAddress, BusDriver, IncomingMessage, SendOutcome, BROADCAST_ADDRESS};
use crate::error::{Result, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, trace, warn};

const READ_CHUNK: usize = 512;

/// Serial driver configuration
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub device: String,
    pub baud_rate: u32,
    /// Our own address on the bus
    pub local_id: BusAddress,
    /// How long a unicast send waits for its ACK
    pub ack_timeout: Duration,
    /// Inbound messages kept while nobody collects them; oldest are dropped first
    pub inbound_capacity: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 19200,
            local_id: 0x42,
            ack_timeout: Duration::from_millis(35),
            inbound_capacity: 1024,
        }
    }
}

/// [`BusDriver`] over a tokio-serial port
pub struct SerialBus {
    config: SerialConfig,
    port: Option<SerialStream>,
    decoder: LinkDecoder,
    inbound: VecDeque<IncomingMessage>,
}

impl SerialBus {
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            port: None,
            decoder: LinkDecoder::new(),
            inbound: VecDeque::new(),
        }
    }

    fn fail(&mut self, error: TransportError) {
        warn!(
            device = %self.config.device,
            category = error.category(),
            error = %error,
            "Serial I/O failed, closing device"
        );
        self.port = None;
        self.decoder.reset();
    }

    async fn write_frame(&mut self, frame: &LinkFrame) -> Result<()> {
        let Some(port) = self.port.as_mut() else {
            return Err(TransportError::not_connected("serial write"));
        };
        let wire = frame.encode().ok_or_else(|| {
            TransportError::protocol(format!(
                "link payload of {} bytes exceeds the length field",
                frame.payload.len()
            ))
        })?;
        port.write_all(&wire).await?;
        port.flush().await?;
        Ok(())
    }

    /// One read bounded by `wait`. An elapsed wait yields no frames.
    async fn read_frames(&mut self, wait: Duration) -> Result<Vec<LinkFrame>> {
        let Some(port) = self.port.as_mut() else {
            return Err(TransportError::not_connected("serial read"));
        };
        let mut buf = [0u8; READ_CHUNK];
        match tokio::time::timeout(wait, port.read(&mut buf)).await {
            Err(_) => Ok(Vec::new()),
            Ok(Ok(0)) => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(Ok(n)) => Ok(self.decoder.feed(&buf[..n])),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// Acknowledge and queue a DATA frame if it is for us.
    async fn accept_data(&mut self, frame: LinkFrame) -> Result<()> {
        if frame.dest != self.config.local_id && frame.dest != BROADCAST_ADDRESS {
            trace!(dest = frame.dest, "Ignoring frame for another device");
            return Ok(());
        }
        if frame.dest == self.config.local_id {
            self.write_frame(&LinkFrame::ack(frame.src, self.config.local_id))
                .await?;
        }
        if self.inbound.len() >= self.config.inbound_capacity {
            warn!(capacity = self.config.inbound_capacity, "Inbound queue full, dropping oldest message");
            self.inbound.pop_front();
        }
        self.inbound.push_back(IncomingMessage {
            src: frame.src,
            payload: frame.payload,
        });
        Ok(())
    }

    /// Route frames read outside an ACK wait.
    async fn absorb(&mut self, frames: Vec<LinkFrame>) -> Result<()> {
        for frame in frames {
            if frame.kind == KIND_DATA {
                self.accept_data(frame).await?;
            } else {
                trace!(src = frame.src, kind = frame.kind, "Ignoring stray link frame");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BusDriver for SerialBus {
    async fn connect(&mut self) -> Result<()> {
        self.port = None;
        let port = tokio_serial::new(&self.config.device, self.config.baud_rate)
            .open_native_async()
            .map_err(|e| {
                TransportError::connection_with_source(
                    "Failed to open serial device",
                    Some(self.config.device.as_str()),
                    e,
                )
            })?;
        self.decoder.reset();
        self.port = Some(port);
        info!(device = %self.config.device, baud_rate = self.config.baud_rate, "Serial device opened");
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.port.take().is_some() {
            debug!(device = %self.config.device, "Serial device closed");
        }
        self.decoder.reset();
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    async fn send(&mut self, dest: BusAddress, payload: &[u8]) -> SendOutcome {
        let frame = LinkFrame::data(dest, self.config.local_id, payload);
        if let Err(e) = self.write_frame(&frame).await {
            match e {
                TransportError::NotConnected { .. } => debug!(dest, error = %e, "Send on closed bus"),
                e => self.fail(e),
            }
            return SendOutcome::Failed;
        }
        if dest == BROADCAST_ADDRESS {
            return SendOutcome::Acknowledged;
        }

        let deadline = Instant::now() + self.config.ack_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return SendOutcome::Unacknowledged;
            }
            let frames = match self.read_frames(deadline - now).await {
                Ok(frames) => frames,
                Err(e) => {
                    self.fail(e);
                    return SendOutcome::Failed;
                }
            };

            let mut acknowledged = false;
            for frame in frames {
                if frame.kind == KIND_ACK && frame.src == dest && frame.dest == self.config.local_id {
                    acknowledged = true;
                } else if frame.kind == KIND_DATA {
                    if let Err(e) = self.accept_data(frame).await {
                        self.fail(e);
                        return SendOutcome::Failed;
                    }
                }
            }
            if acknowledged {
                return SendOutcome::Acknowledged;
            }
        }
    }

    async fn receive_batch(&mut self, timeout: Duration, max: usize) -> Vec<IncomingMessage> {
        let mut wait = timeout;
        while self.port.is_some() && self.inbound.len() < max {
            match self.read_frames(wait).await {
                Ok(frames) if frames.is_empty() => break,
                Ok(frames) => {
                    if let Err(e) = self.absorb(frames).await {
                        self.fail(e);
                    }
                }
                Err(e) => self.fail(e),
            }
            wait = Duration::ZERO;
        }
        let take = max.min(self.inbound.len());
        self.inbound.drain(..take).collect()
    }
}
