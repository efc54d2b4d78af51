//! Sentinel Policy
//!
//! How often each background task ticks and how long a single tick may run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// The background duties the sentinel knows how to schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Mirror gateway state into the bucket
    BackupSync,
    /// Re-register scheduled jobs the gateway forgot
    CronReconcile,
    /// Probe an idle gateway and restart it if it stopped answering
    HealthCheck,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::BackupSync => write!(f, "backup-sync"),
            TaskKind::CronReconcile => write!(f, "cron-reconcile"),
            TaskKind::HealthCheck => write!(f, "health-check"),
        }
    }
}

/// Sentinel operational policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelPolicy {
    /// Seconds between backup syncs
    ///
    /// **Default:** 300
    pub backup_interval_s: u64,

    /// Seconds between job reconciliations
    ///
    /// **Default:** 600
    pub cron_interval_s: u64,

    /// Seconds between idle health checks
    ///
    /// **Default:** 60
    pub health_interval_s: u64,

    /// Upper bound for one tick of any task. A tick that overruns is
    /// abandoned and counted as a failure; the next tick runs on schedule.
    ///
    /// **Default:** 600
    pub tick_timeout_s: u64,
}

impl Default for SentinelPolicy {
    fn default() -> Self {
        Self {
            backup_interval_s: 300,
            cron_interval_s: 600,
            health_interval_s: 60,
            tick_timeout_s: 600,
        }
    }
}

impl SentinelPolicy {
    /// Interval between ticks of `kind`
    pub fn interval_for(&self, kind: TaskKind) -> Duration {
        let secs = match kind {
            TaskKind::BackupSync => self.backup_interval_s,
            TaskKind::CronReconcile => self.cron_interval_s,
            TaskKind::HealthCheck => self.health_interval_s,
        };
        Duration::from_secs(secs)
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_secs(self.tick_timeout_s)
    }

    /// Validate the policy configuration
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.backup_interval_s == 0 {
            return Err("backup_interval_s must be greater than 0".to_string());
        }

        if self.cron_interval_s == 0 {
            return Err("cron_interval_s must be greater than 0".to_string());
        }

        if self.health_interval_s == 0 {
            return Err("health_interval_s must be greater than 0".to_string());
        }

        if self.tick_timeout_s == 0 {
            return Err("tick_timeout_s must be greater than 0".to_string());
        }

        Ok(())
    }
}
