//! Rolling link health
//!
//! Two exponential moving averages, success rate and round-trip latency, updated
//! once per terminal outcome with `mean += (x - mean) / n`. Threshold alerts are
//! edge-triggered: an alert fires once when its average crosses the threshold
//! and is re-armed only after the average recovers.

use busgate_codec::WarnCode;
use busgate_config::HealthConfig;
use std::time::Duration;
use tracing::{info, warn};

/// Threshold crossing reported by the record calls
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HealthAlert {
    LowSuccessRate { success_rate: f64 },
    HighLatency { mean_latency: Duration },
}

impl HealthAlert {
    /// Code broadcast to clients when this alert fires
    pub fn warn_code(&self) -> WarnCode {
        match self {
            HealthAlert::LowSuccessRate { .. } => WarnCode::LowSuccessRate,
            HealthAlert::HighLatency { .. } => WarnCode::HighLatency,
        }
    }
}

/// Point-in-time view for the statistics log line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthSnapshot {
    pub success_rate: f64,
    pub mean_latency: Duration,
    pub successes: u64,
    pub failures: u64,
}

#[derive(Debug, Clone)]
pub struct HealthMonitor {
    window: f64,
    min_success_rate: f64,
    max_latency: Duration,
    success_rate: f64,
    mean_latency_secs: f64,
    successes: u64,
    failures: u64,
    low_success_alerted: bool,
    high_latency_alerted: bool,
}

impl HealthMonitor {
    pub fn new(window: u32, min_success_rate: f64, max_latency: Duration) -> Self {
        Self {
            window: f64::from(window.max(1)),
            min_success_rate,
            max_latency,
            success_rate: 1.0,
            mean_latency_secs: 0.0,
            successes: 0,
            failures: 0,
            low_success_alerted: false,
            high_latency_alerted: false,
        }
    }

    pub fn from_config(config: &HealthConfig) -> Self {
        Self::new(config.window, config.min_success_rate, config.max_latency())
    }

    pub fn record_outcome(&mut self, success: bool) -> Option<HealthAlert> {
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        let sample = if success { 1.0 } else { 0.0 };
        self.success_rate += (sample - self.success_rate) / self.window;

        if self.success_rate < self.min_success_rate {
            if !self.low_success_alerted {
                self.low_success_alerted = true;
                warn!(
                    success_rate = self.success_rate,
                    threshold = self.min_success_rate,
                    "Bus success rate below threshold"
                );
                return Some(HealthAlert::LowSuccessRate {
                    success_rate: self.success_rate,
                });
            }
        } else if self.low_success_alerted {
            self.low_success_alerted = false;
            info!(success_rate = self.success_rate, "Bus success rate recovered");
        }
        None
    }

    pub fn record_latency(&mut self, latency: Duration) -> Option<HealthAlert> {
        self.mean_latency_secs += (latency.as_secs_f64() - self.mean_latency_secs) / self.window;
        let mean = self.mean_latency();

        if mean > self.max_latency {
            if !self.high_latency_alerted {
                self.high_latency_alerted = true;
                warn!(
                    mean_latency_ms = mean.as_secs_f64() * 1000.0,
                    threshold_ms = self.max_latency.as_secs_f64() * 1000.0,
                    "Bus round-trip latency above threshold"
                );
                return Some(HealthAlert::HighLatency { mean_latency: mean });
            }
        } else if self.high_latency_alerted {
            self.high_latency_alerted = false;
            info!(mean_latency_ms = mean.as_secs_f64() * 1000.0, "Bus latency recovered");
        }
        None
    }

    pub fn success_rate(&self) -> f64 {
        self.success_rate
    }

    pub fn mean_latency(&self) -> Duration {
        Duration::try_from_secs_f64(self.mean_latency_secs).unwrap_or(Duration::MAX)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            success_rate: self.success_rate,
            mean_latency: self.mean_latency(),
            successes: self.successes,
            failures: self.failures,
        }
    }
}
