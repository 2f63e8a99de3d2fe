//! Gateway control loop
//!
//! One [`Gateway`] owns the socket multiplexer, the retry engine and the bus
//! driver, and advances all three from a single task. Each call to
//! [`Gateway::run_once`] is one tick:
//!
//! 1. wait up to the tick period for socket activity
//! 2. accept one pending client
//! 3. read every client; submit `OutgoingMessage`s, reject anything else
//! 4. flush every client's output queue
//! 5. reconnect the bus if it is down and the reconnect interval has passed
//! 6. tick the retry engine and route each result to its submitter
//! 7. broadcast bus state transitions and health alerts
//! 8. broadcast inbound bus messages
//!
//! Results therefore always reach a client before the state broadcasts and
//! unsolicited messages of the same tick.

use crate::error::{GatewayError, PushRejected, Result};
use crate::health::HealthMonitor;
use crate::retry::{PushStatus, RetryEngine, RetryPolicy};
use busgate_codec::{ErrorCode, InfoCode, Message, Packet, WarnCode};
use busgate_config::{GatewayConfig, ServerConfig};
use busgate_network::{BusDriver, ClientId, MultiplexerConfig, SocketMultiplexer};
use std::future::Future;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct Gateway<B> {
    settings: ServerConfig,
    mux: SocketMultiplexer,
    engine: RetryEngine<ClientId>,
    bus: B,
    /// Bus state last announced to clients
    bus_online: bool,
    /// Set while the listener keeps failing to accept
    accept_failing: bool,
    last_reconnect: Option<Instant>,
    last_stats: Instant,
}

impl<B: BusDriver> Gateway<B> {
    /// Bind the local socket. The bus is not touched until [`start`](Self::start).
    pub fn new(config: &GatewayConfig, bus: B) -> Result<Self> {
        let mux = SocketMultiplexer::bind(MultiplexerConfig {
            path: config.socket.path.clone(),
            max_clients: config.socket.max_clients,
            input_buffer_size: config.socket.input_buffer_size,
        })
        .map_err(GatewayError::Bind)?;

        let engine = RetryEngine::new(
            RetryPolicy::from_config(&config.retry),
            HealthMonitor::from_config(&config.health),
        );

        Ok(Self {
            settings: config.server.clone(),
            mux,
            engine,
            bus,
            bus_online: false,
            accept_failing: false,
            last_reconnect: None,
            last_stats: Instant::now(),
        })
    }

    /// Make the initial bus connection attempt.
    ///
    /// Failure is not fatal: the gateway runs degraded and keeps retrying at the
    /// reconnect interval.
    pub async fn start(&mut self) {
        self.last_reconnect = Some(Instant::now());
        match self.bus.connect().await {
            Ok(()) => {
                self.bus_online = true;
                info!("Bus connected");
                self.mux.broadcast(&Packet::info(InfoCode::SerialOpened));
            }
            Err(e) => {
                warn!(error = %e, "Bus unavailable at startup, will keep retrying");
                self.mux.broadcast(&Packet::error(ErrorCode::FailedOpenSerial));
            }
        }
    }

    /// Tick until `shutdown` resolves.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(path = ?self.mux.path(), "Gateway running");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = self.run_once() => {}
            }
        }
        info!(
            pending = self.engine.pending_len(),
            clients = self.mux.client_count(),
            "Gateway shutting down"
        );
    }

    /// Run a single tick of the control loop.
    ///
    /// A failed accept does not stop the tick: connected clients and the bus
    /// are still served.
    pub async fn run_once(&mut self) {
        let polled = self.mux.poll(self.settings.tick_period()).await;
        self.note_accept(polled);
        self.mux.accept_pending();

        let clients = self.mux.client_ids();
        for &id in &clients {
            for received in self.mux.receive(id) {
                match received {
                    Ok(Packet::OutgoingMessage(message)) => self.submit(id, &message),
                    Ok(other) => {
                        warn!(client = %id, packet = %other, "Unexpected packet from client");
                        self.mux
                            .enqueue(id, &Packet::error(ErrorCode::ReceivedInvalidPacketHead));
                    }
                    Err(e) => {
                        warn!(client = %id, error = %e, "Invalid packet from client");
                        self.mux
                            .enqueue(id, &Packet::error(ErrorCode::ReceivedInvalidPacketHead));
                    }
                }
            }
        }
        for &id in &clients {
            self.mux.flush(id);
        }

        let (went_down, came_up) = self.check_bus().await;

        let completions = self
            .engine
            .tick(&mut self.bus, self.settings.max_results_per_tick)
            .await;
        for completion in completions {
            let packet = Packet::outgoing_result(completion.outcome.result_code());
            if !self.mux.enqueue(completion.reference, &packet) {
                debug!(client = %completion.reference, outcome = ?completion.outcome, "Submitter gone, dropping result");
            }
        }

        if went_down {
            self.mux.broadcast(&Packet::error(ErrorCode::FailedOpenSerial));
        }
        if came_up {
            self.mux.broadcast(&Packet::info(InfoCode::SerialOpened));
        }
        for alert in self.engine.take_alerts() {
            self.mux.broadcast(&Packet::warn(alert.warn_code()));
        }

        let inbound = self
            .bus
            .receive_batch(
                self.settings.receive_timeout(),
                self.settings.max_incoming_per_tick,
            )
            .await;
        for message in inbound {
            match Packet::ingoing_message(message.src, &message.payload) {
                Ok(packet) => {
                    debug!(packet = %packet, "Forwarding bus message");
                    self.mux.broadcast(&packet);
                }
                Err(e) => warn!(src = message.src, error = %e, "Dropping inbound bus message"),
            }
        }

        self.log_stats();
    }

    /// Log accept failures once per outage rather than once per tick.
    fn note_accept(&mut self, polled: busgate_network::Result<()>) {
        match polled {
            Ok(()) if self.accept_failing => {
                self.accept_failing = false;
                info!("Accepting clients again");
            }
            Ok(()) => {}
            Err(e) if self.accept_failing => debug!(error = %e, "Accept still failing"),
            Err(e) => {
                self.accept_failing = true;
                warn!(
                    error = %e,
                    clients = self.mux.client_count(),
                    "Cannot accept new clients"
                );
            }
        }
    }

    fn submit(&mut self, id: ClientId, message: &Message) {
        let payload = message.submitted_payload();
        match self.engine.push(id, message.peer(), &payload) {
            Ok(PushStatus::Accepted) => {
                debug!(client = %id, dest = message.peer(), len = payload.len(), "Request accepted");
            }
            Ok(PushStatus::QueueFillingUp) => {
                self.mux.enqueue(id, &Packet::warn(WarnCode::QueueFillingUp));
            }
            Err(rejected) => {
                match rejected {
                    PushRejected::Duplicate => {
                        debug!(client = %id, "Request rejected, previous one still pending")
                    }
                    PushRejected::QueueFull { .. } => {
                        warn!(client = %id, error = %rejected, "Request rejected")
                    }
                }
                self.mux.enqueue(id, &Packet::error(ErrorCode::RequestRejected));
            }
        }
    }

    /// Track bus connectivity and reconnect when due.
    ///
    /// Returns which transitions happened since the last announced state.
    async fn check_bus(&mut self) -> (bool, bool) {
        let mut went_down = false;
        if !self.bus.is_connected() {
            if self.bus_online {
                self.bus_online = false;
                went_down = true;
                warn!("Bus connection lost");
            }

            let now = Instant::now();
            let due = self
                .last_reconnect
                .map_or(true, |at| now.duration_since(at) >= self.settings.reconnect_interval());
            if due {
                self.last_reconnect = Some(now);
                match self.bus.connect().await {
                    Ok(()) => info!("Bus reconnected"),
                    Err(e) => debug!(error = %e, "Bus reconnect failed"),
                }
            }
        }

        let came_up = !self.bus_online && self.bus.is_connected();
        if came_up {
            self.bus_online = true;
        }
        (went_down, came_up)
    }

    fn log_stats(&mut self) {
        let Some(interval) = self.settings.stats_interval() else {
            return;
        };
        let now = Instant::now();
        if now.duration_since(self.last_stats) < interval {
            return;
        }
        self.last_stats = now;

        let snapshot = self.engine.health().snapshot();
        info!(
            success_rate = snapshot.success_rate,
            mean_latency_ms = snapshot.mean_latency.as_secs_f64() * 1000.0,
            successes = snapshot.successes,
            failures = snapshot.failures,
            pending = self.engine.pending_len(),
            clients = self.mux.client_count(),
            bus_online = self.bus_online,
            "Gateway statistics"
        );
    }

    pub fn multiplexer(&self) -> &SocketMultiplexer {
        &self.mux
    }

    pub fn engine(&self) -> &RetryEngine<ClientId> {
        &self.engine
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }
}
