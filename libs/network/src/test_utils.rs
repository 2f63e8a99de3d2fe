//! Scriptable bus for tests
//!
//! [`ScriptedBus`] is a cheap clone around shared state, so a test can hand one
//! handle to the gateway and keep another to script outcomes and inspect what
//! was sent.

use crate::bus::{BusAddress, BusDriver, IncomingMessage, SendOutcome};
use crate::error::{Result, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// One transmission attempt observed by the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub dest: BusAddress,
    pub payload: Vec<u8>,
    pub at: Instant,
}

#[derive(Debug)]
struct ScriptState {
    connected: bool,
    connect_succeeds: bool,
    connect_attempts: usize,
    outcomes: VecDeque<SendOutcome>,
    default_outcome: SendOutcome,
    inbound: VecDeque<IncomingMessage>,
    sent: Vec<SentFrame>,
}

/// [`BusDriver`] whose behaviour is set by the test
#[derive(Debug, Clone)]
pub struct ScriptedBus {
    state: Arc<Mutex<ScriptState>>,
}

impl Default for ScriptedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBus {
    /// A bus that opens on demand and acknowledges everything
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                connected: false,
                connect_succeeds: true,
                connect_attempts: 0,
                outcomes: VecDeque::new(),
                default_outcome: SendOutcome::Acknowledged,
                inbound: VecDeque::new(),
                sent: Vec::new(),
            })),
        }
    }

    /// Whether future connect attempts succeed
    pub fn set_connect_succeeds(&self, succeeds: bool) {
        self.state.lock().connect_succeeds = succeeds;
    }

    /// Simulate the device going away or coming back without a connect call
    pub fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    /// Outcome for the next send, ahead of the default
    pub fn push_outcome(&self, outcome: SendOutcome) {
        self.state.lock().outcomes.push_back(outcome);
    }

    /// Outcome for sends with nothing scripted
    pub fn set_default_outcome(&self, outcome: SendOutcome) {
        self.state.lock().default_outcome = outcome;
    }

    /// Make a message from `src` available to the next receive
    pub fn push_inbound(&self, src: BusAddress, payload: &[u8]) {
        self.state.lock().inbound.push_back(IncomingMessage {
            src,
            payload: payload.to_vec(),
        });
    }

    pub fn sent(&self) -> Vec<SentFrame> {
        self.state.lock().sent.clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }
}

#[async_trait]
impl BusDriver for ScriptedBus {
    async fn connect(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if !state.connect_succeeds {
            state.connected = false;
            return Err(TransportError::connection(
                "Scripted connect failure",
                Some("scripted"),
            ));
        }
        state.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.state.lock().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn send(&mut self, dest: BusAddress, payload: &[u8]) -> SendOutcome {
        let mut state = self.state.lock();
        if !state.connected {
            return SendOutcome::Failed;
        }
        state.sent.push(SentFrame {
            dest,
            payload: payload.to_vec(),
            at: Instant::now(),
        });
        let outcome = state.outcomes.pop_front().unwrap_or(state.default_outcome);
        if outcome == SendOutcome::Failed {
            state.connected = false;
        }
        outcome
    }

    async fn receive_batch(&mut self, _timeout: Duration, max: usize) -> Vec<IncomingMessage> {
        let mut state = self.state.lock();
        let take = max.min(state.inbound.len());
        state.inbound.drain(..take).collect()
    }
}
