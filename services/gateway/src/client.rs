//! Client side of the local packet socket
//!
//! Used by `busgate-send` and by tests that drive a running gateway.

use crate::error::ClientError;
use busgate_codec::{ErrorCode, Head, Packet, PACKET_SIZE};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

/// How the gateway answered a submitted message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Terminal `OutgoingResult` code
    Result(u16),
    /// Refused at submission; no result will follow
    Rejected,
}

pub struct GatewayClient {
    stream: UnixStream,
    version: String,
}

impl GatewayClient {
    /// Connect and consume the version handshake.
    pub async fn connect(path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path).await?;
        let mut client = Self {
            stream,
            version: String::new(),
        };
        match client.next_packet().await? {
            Packet::Version(version) => {
                debug!(%version, "Connected to gateway");
                client.version = version;
                Ok(client)
            }
            other => Err(ClientError::Handshake { head: other.head() }),
        }
    }

    /// Protocol version announced by the gateway
    pub fn version(&self) -> &str {
        &self.version
    }

    pub async fn send(&mut self, packet: &Packet) -> Result<(), ClientError> {
        let frame = packet.encode()?;
        self.send_frame(&frame).await
    }

    /// Write raw frame bytes, valid or not
    pub async fn send_frame(&mut self, frame: &[u8]) -> Result<(), ClientError> {
        self.stream.write_all(frame).await?;
        Ok(())
    }

    pub async fn next_packet(&mut self) -> Result<Packet, ClientError> {
        let mut frame = [0u8; PACKET_SIZE];
        self.stream.read_exact(&mut frame).await?;
        Ok(Packet::decode(&frame)?)
    }

    /// Next packet within `timeout`
    pub async fn next_packet_within(&mut self, timeout: Duration) -> Result<Packet, ClientError> {
        tokio::time::timeout(timeout, self.next_packet())
            .await
            .map_err(|_| ClientError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    /// Read packets until one with `head` arrives, returning it together with
    /// everything skipped on the way.
    pub async fn wait_for(
        &mut self,
        head: Head,
        timeout: Duration,
    ) -> Result<(Packet, Vec<Packet>), ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut skipped = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let packet = self.next_packet_within(remaining).await?;
            if packet.head() == head {
                return Ok((packet, skipped));
            }
            skipped.push(packet);
        }
    }

    /// Submit one message and wait for the gateway's answer to it.
    ///
    /// Packets that are neither the result nor a rejection are returned
    /// alongside the answer.
    pub async fn deliver(
        &mut self,
        dest: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(Delivery, Vec<Packet>), ClientError> {
        self.send(&Packet::outgoing_message(dest, payload)?).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut skipped = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.next_packet_within(remaining).await? {
                Packet::OutgoingResult(code) => return Ok((Delivery::Result(code), skipped)),
                Packet::Error(code) if code == ErrorCode::RequestRejected as u16 => {
                    return Ok((Delivery::Rejected, skipped))
                }
                other => skipped.push(other),
            }
        }
    }
}
