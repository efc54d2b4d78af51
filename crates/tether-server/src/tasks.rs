//! Sentinel tasks: the server's periodic duties
//!
//! Each task wraps one library operation and turns its outcome into a
//! `TickOutcome`. Failures are returned to the sentinel, which logs them and
//! tries again next interval.

use async_trait::async_trait;
use std::sync::Arc;
use tether::cron::{JobRegistry, Reconciler};
use tether::{BackupSynchronizer, CronSpec, HealthOutcome, Supervisor, TetherError};
use tether_sentinel::{TaskKind, TickOutcome, SentinelTask};

/// Mirror gateway state into the bucket
pub struct BackupTask {
    sync: BackupSynchronizer,
}

impl BackupTask {
    pub fn new(sync: BackupSynchronizer) -> Self {
        Self { sync }
    }
}

#[async_trait]
impl SentinelTask for BackupTask {
    fn kind(&self) -> TaskKind {
        TaskKind::BackupSync
    }

    async fn tick(&self) -> anyhow::Result<TickOutcome> {
        if !self.sync.config().enabled {
            return Ok(TickOutcome::Idle);
        }
        let marker = self.sync.source_marker();
        match self.sync.sync().await?.into_result(&marker) {
            Ok(timestamp) => Ok(TickOutcome::Acted(format!("Backup synced at {}", timestamp))),
            // Gateway has not written its state yet; nothing to protect
            Err(TetherError::SourceIncomplete(path)) => {
                tracing::warn!("Skipping backup: {} missing", path.display());
                Ok(TickOutcome::Idle)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Re-register scheduled jobs the gateway forgot
pub struct CronTask {
    supervisor: Arc<Supervisor>,
    reconciler: Reconciler,
    jobs: Vec<CronSpec>,
}

impl CronTask {
    pub fn new(supervisor: Arc<Supervisor>, registry: Arc<dyn JobRegistry>, jobs: Vec<CronSpec>) -> Self {
        Self {
            supervisor,
            reconciler: Reconciler::new(registry),
            jobs,
        }
    }
}

#[async_trait]
impl SentinelTask for CronTask {
    fn kind(&self) -> TaskKind {
        TaskKind::CronReconcile
    }

    async fn tick(&self) -> anyhow::Result<TickOutcome> {
        if self.jobs.is_empty() {
            return Ok(TickOutcome::Idle);
        }
        // Never start the gateway just to talk to its registry
        let Some(handle) = self.supervisor.current().await? else {
            tracing::debug!("No gateway running, skipping job reconciliation");
            return Ok(TickOutcome::Idle);
        };

        let report = self.reconciler.reconcile(&handle, &self.jobs).await?;
        if !report.failed.is_empty() {
            anyhow::bail!(
                "registered {} job(s), failed to register {:?}",
                report.added.len(),
                report.failed
            );
        }
        if report.changed() {
            let mut action = format!("Added {} job(s)", report.added.len());
            if report.restored {
                action.push_str(" after restoring the registry snapshot");
            }
            Ok(TickOutcome::Acted(action))
        } else {
            Ok(TickOutcome::Idle)
        }
    }
}

/// Probe an idle gateway and restart it if it stopped answering
pub struct HealthTask {
    supervisor: Arc<Supervisor>,
}

impl HealthTask {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl SentinelTask for HealthTask {
    fn kind(&self) -> TaskKind {
        TaskKind::HealthCheck
    }

    async fn tick(&self) -> anyhow::Result<TickOutcome> {
        match self.supervisor.check_health().await? {
            HealthOutcome::NotRunning | HealthOutcome::Healthy => Ok(TickOutcome::Idle),
            HealthOutcome::WithinGrace => {
                tracing::info!("Gateway not answering yet, still within startup grace");
                Ok(TickOutcome::Idle)
            }
            HealthOutcome::Restarted(id) => {
                Ok(TickOutcome::Acted(format!("Restarted unresponsive gateway as {}", id)))
            }
            HealthOutcome::RestartFailed(reason) => {
                anyhow::bail!("gateway restart failed: {}", reason)
            }
        }
    }
}
