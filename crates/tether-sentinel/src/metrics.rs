//! Sentinel Metrics
//!
//! Per-task tick counters, exposed through the server's status API.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a successful tick did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickOutcome {
    /// Nothing needed doing
    Idle,
    /// The tick changed something; the string says what
    Acted(String),
}

/// Counters for one task across all its ticks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickStats {
    pub ticks: u64,
    pub succeeded: u64,
    pub failed: u64,

    /// Successful ticks that changed something
    pub acted: u64,

    /// Failures since the last success
    pub consecutive_failures: u64,

    pub last_duration: Option<Duration>,
    pub last_error: Option<String>,
    pub last_action: Option<String>,
}

impl TickStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, outcome: &TickOutcome, duration: Duration) {
        self.ticks += 1;
        self.succeeded += 1;
        self.consecutive_failures = 0;
        self.last_duration = Some(duration);
        self.last_error = None;
        if let TickOutcome::Acted(action) = outcome {
            self.acted += 1;
            self.last_action = Some(action.clone());
        }
    }

    pub fn record_failure(&mut self, error: impl Into<String>, duration: Duration) {
        self.ticks += 1;
        self.failed += 1;
        self.consecutive_failures += 1;
        self.last_duration = Some(duration);
        self.last_error = Some(error.into());
    }

    /// Fraction of ticks that succeeded (1.0 before the first tick)
    pub fn success_rate(&self) -> f64 {
        if self.ticks == 0 {
            1.0
        } else {
            self.succeeded as f64 / self.ticks as f64
        }
    }

    /// Format a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "{} ticks | {} ok ({:.1}%) | {} failed | {} acted",
            self.ticks,
            self.succeeded,
            self.success_rate() * 100.0,
            self.failed,
            self.acted
        )
    }
}
