//! Outgoing request retry engine
//!
//! Turns the fire-and-forget bus into at-most-N-attempts delivery. Each pending
//! request carries its own backoff period. A request is eligible when the time
//! since its last attempt reaches that period; every attempt multiplies the
//! period by the backoff factor, so the wait after attempt `k` is
//! `initial * factor^k`.
//!
//! A request ends in exactly one [`Outcome`] and is removed in the same tick:
//!
//! - `Success` when the destination acknowledges an attempt
//! - `ContentTooLong` at its first eligible tick if the payload exceeds
//!   [`DATA_MAX_LENGTH`], without ever touching the bus
//! - `ConnectionLost` once `max_attempts` attempts went unacknowledged
//!
//! Only outcomes that involved the bus feed the [`HealthMonitor`]. `ContentTooLong`
//! is a client error and leaves the success rate and latency untouched.

use crate::error::PushRejected;
use crate::health::{HealthAlert, HealthMonitor};
use busgate_codec::{OutgoingResultCode, DATA_MAX_LENGTH};
use busgate_config::RetryConfig;
use busgate_network::{BusAddress, BusDriver, SendOutcome};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Terminal outcome of an outgoing request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    ContentTooLong,
    ConnectionLost,
}

impl Outcome {
    pub fn result_code(&self) -> OutgoingResultCode {
        match self {
            Outcome::Success => OutgoingResultCode::Success,
            Outcome::ContentTooLong => OutgoingResultCode::ContentTooLong,
            Outcome::ConnectionLost => OutgoingResultCode::ConnectionLost,
        }
    }
}

/// A finished request and how it ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion<R> {
    pub reference: R,
    pub outcome: Outcome,
}

/// Accepted submission, possibly with a queue pressure warning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    Accepted,
    /// Accepted, but the pending count reached the warning watermark
    QueueFillingUp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
    pub max_attempts: u32,
    pub max_backoff: Option<Duration>,
    pub queue_warning_threshold: usize,
    pub queue_capacity: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            initial_backoff: config.initial_backoff(),
            backoff_factor: config.backoff_factor,
            max_attempts: config.max_attempts,
            max_backoff: config.max_backoff(),
            queue_warning_threshold: config.queue_warning_threshold,
            queue_capacity: config.queue_capacity,
        }
    }

    fn next_period(&self, period: Duration) -> Duration {
        let grown = Duration::try_from_secs_f64(period.as_secs_f64() * self.backoff_factor)
            .unwrap_or(Duration::MAX);
        match self.max_backoff {
            Some(ceiling) => grown.min(ceiling),
            None => grown,
        }
    }
}

#[derive(Debug)]
struct OutgoingRequest {
    dest: BusAddress,
    payload: Vec<u8>,
    attempts: u32,
    registered: Instant,
    last_attempt: Instant,
    period: Duration,
}

/// Pending outgoing requests keyed by the reference results are routed to
pub struct RetryEngine<R> {
    policy: RetryPolicy,
    requests: BTreeMap<R, OutgoingRequest>,
    health: HealthMonitor,
    alerts: Vec<HealthAlert>,
    above_watermark: bool,
}

impl<R> RetryEngine<R>
where
    R: Copy + Ord + fmt::Debug,
{
    pub fn new(policy: RetryPolicy, health: HealthMonitor) -> Self {
        Self {
            policy,
            requests: BTreeMap::new(),
            health,
            alerts: Vec::new(),
            above_watermark: false,
        }
    }

    /// Queue a payload for delivery to `dest`.
    ///
    /// Payload length is not checked here; oversized payloads are reported as
    /// [`Outcome::ContentTooLong`] by the next eligible tick.
    pub fn push(
        &mut self,
        reference: R,
        dest: BusAddress,
        payload: &[u8],
    ) -> Result<PushStatus, PushRejected> {
        if self.requests.contains_key(&reference) {
            return Err(PushRejected::Duplicate);
        }
        if self.requests.len() >= self.policy.queue_capacity {
            warn!(
                reference = ?reference,
                capacity = self.policy.queue_capacity,
                "Pending queue full, rejecting request"
            );
            return Err(PushRejected::QueueFull {
                capacity: self.policy.queue_capacity,
            });
        }

        let now = Instant::now();
        self.requests.insert(
            reference,
            OutgoingRequest {
                dest,
                payload: payload.to_vec(),
                attempts: 0,
                registered: now,
                last_attempt: now,
                period: self.policy.initial_backoff,
            },
        );
        trace!(reference = ?reference, dest, len = payload.len(), "Request queued");

        if self.requests.len() >= self.policy.queue_warning_threshold {
            if !self.above_watermark {
                self.above_watermark = true;
                warn!(
                    pending = self.requests.len(),
                    threshold = self.policy.queue_warning_threshold,
                    "Pending queue filling up"
                );
            }
            return Ok(PushStatus::QueueFillingUp);
        }
        Ok(PushStatus::Accepted)
    }

    /// Drop a pending request. Absent references are ignored.
    pub fn cancel(&mut self, reference: &R) -> bool {
        let removed = self.requests.remove(reference).is_some();
        if removed {
            self.rearm_watermark();
        }
        removed
    }

    /// Attempt every eligible request once and return those that finished.
    ///
    /// At most `max_results` completions are returned; requests not reached
    /// stay pending untouched for the next tick. While the bus is disconnected
    /// no attempts are made.
    pub async fn tick<B>(&mut self, bus: &mut B, max_results: usize) -> Vec<Completion<R>>
    where
        B: BusDriver + ?Sized,
    {
        let mut completions = Vec::new();
        let references: Vec<R> = self.requests.keys().copied().collect();

        for reference in references {
            if completions.len() >= max_results {
                break;
            }
            let now = Instant::now();
            let Some(request) = self.requests.get_mut(&reference) else {
                continue;
            };
            if now.duration_since(request.last_attempt) < request.period {
                continue;
            }

            if request.payload.len() > DATA_MAX_LENGTH {
                debug!(reference = ?reference, len = request.payload.len(), "Payload too long");
                self.requests.remove(&reference);
                completions.push(Completion {
                    reference,
                    outcome: Outcome::ContentTooLong,
                });
                continue;
            }

            if !bus.is_connected() {
                continue;
            }

            let sent = bus.send(request.dest, &request.payload).await;
            let now = Instant::now();
            request.attempts += 1;
            request.last_attempt = now;
            request.period = self.policy.next_period(request.period);
            trace!(
                reference = ?reference,
                dest = request.dest,
                attempts = request.attempts,
                outcome = ?sent,
                next_backoff_us = request.period.as_micros() as u64,
                "Send attempt"
            );

            if sent == SendOutcome::Acknowledged {
                let latency = now.duration_since(request.registered);
                debug!(reference = ?reference, attempts = request.attempts, latency_us = latency.as_micros() as u64, "Request delivered");
                self.requests.remove(&reference);
                self.record(true, Some(latency));
                completions.push(Completion {
                    reference,
                    outcome: Outcome::Success,
                });
            } else if request.attempts >= self.policy.max_attempts {
                debug!(reference = ?reference, attempts = request.attempts, "Request exhausted its attempts");
                self.requests.remove(&reference);
                self.record(false, None);
                completions.push(Completion {
                    reference,
                    outcome: Outcome::ConnectionLost,
                });
            }
        }

        if !completions.is_empty() {
            self.rearm_watermark();
        }
        completions
    }

    fn record(&mut self, success: bool, latency: Option<Duration>) {
        if let Some(alert) = self.health.record_outcome(success) {
            self.alerts.push(alert);
        }
        if let Some(alert) = latency.and_then(|l| self.health.record_latency(l)) {
            self.alerts.push(alert);
        }
    }

    fn rearm_watermark(&mut self) {
        if self.above_watermark && self.requests.len() < self.policy.queue_warning_threshold {
            self.above_watermark = false;
            debug!(pending = self.requests.len(), "Pending queue back below watermark");
        }
    }

    /// Health alerts raised since the last call
    pub fn take_alerts(&mut self) -> Vec<HealthAlert> {
        std::mem::take(&mut self.alerts)
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn pending_len(&self) -> usize {
        self.requests.len()
    }

    pub fn contains(&self, reference: &R) -> bool {
        self.requests.contains_key(reference)
    }

    /// Attempts made so far for a pending request
    pub fn attempts(&self, reference: &R) -> Option<u32> {
        self.requests.get(reference).map(|r| r.attempts)
    }
}
