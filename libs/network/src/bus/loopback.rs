//! In-process bus for running without hardware.
//!
//! Every unicast send is acknowledged and echoed back as an inbound message from
//! the destination, so a client sees its own traffic come back.

use super::{BusAddress, BusDriver, IncomingMessage, SendOutcome, BROADCAST_ADDRESS};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Default)]
pub struct LoopbackBus {
    connected: bool,
    inbound: VecDeque<IncomingMessage>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BusDriver for LoopbackBus {
    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        debug!("Loopback bus connected");
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn send(&mut self, dest: BusAddress, payload: &[u8]) -> SendOutcome {
        if !self.connected {
            return SendOutcome::Failed;
        }
        if dest != BROADCAST_ADDRESS {
            self.inbound.push_back(IncomingMessage {
                src: dest,
                payload: payload.to_vec(),
            });
        }
        SendOutcome::Acknowledged
    }

    async fn receive_batch(&mut self, _timeout: Duration, max: usize) -> Vec<IncomingMessage> {
        let take = max.min(self.inbound.len());
        self.inbound.drain(..take).collect()
    }
}
