//! Sentinel Daemon
//!
//! One independent interval loop per registered task. A tick never overlaps
//! the previous tick of the same task, is bounded by the policy's tick
//! timeout, and never takes the loop down: failures are logged, counted and
//! retried on the next interval.

use crate::metrics::{TickOutcome, TickStats};
use crate::policy::{SentinelPolicy, TaskKind};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// A unit of idempotent background work
#[async_trait]
pub trait SentinelTask: Send + Sync {
    fn kind(&self) -> TaskKind;

    /// Run once. Errors are reported, never retried within the same tick.
    async fn tick(&self) -> anyhow::Result<TickOutcome>;
}

#[derive(Debug, Error)]
pub enum SentinelError {
    #[error("Invalid sentinel policy: {0}")]
    InvalidPolicy(String),

    #[error("Task {0} is already registered")]
    DuplicateTask(TaskKind),
}

/// Shared view of per-task tick counters
#[derive(Debug, Clone, Default)]
pub struct SentinelStats {
    inner: Arc<Mutex<BTreeMap<TaskKind, TickStats>>>,
}

impl SentinelStats {
    pub fn snapshot(&self) -> BTreeMap<TaskKind, TickStats> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn get(&self, kind: TaskKind) -> Option<TickStats> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&kind)
            .cloned()
    }

    fn update<R>(&self, kind: TaskKind, f: impl FnOnce(&mut TickStats) -> R) -> R {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        f(map.entry(kind).or_default())
    }
}

/// The Sentinel: background scheduler for Tether's periodic duties
pub struct Sentinel {
    policy: SentinelPolicy,
    tasks: Vec<Arc<dyn SentinelTask>>,
    stats: SentinelStats,
}

impl Sentinel {
    pub fn new(policy: SentinelPolicy) -> Result<Self, SentinelError> {
        policy.validate().map_err(SentinelError::InvalidPolicy)?;
        Ok(Self {
            policy,
            tasks: Vec::new(),
            stats: SentinelStats::default(),
        })
    }

    /// Register a task; each kind may be registered once
    pub fn with_task(mut self, task: Arc<dyn SentinelTask>) -> Result<Self, SentinelError> {
        let kind = task.kind();
        if self.tasks.iter().any(|t| t.kind() == kind) {
            return Err(SentinelError::DuplicateTask(kind));
        }
        self.stats.update(kind, |_| ());
        self.tasks.push(task);
        Ok(self)
    }

    pub fn policy(&self) -> &SentinelPolicy {
        &self.policy
    }

    pub fn stats(&self) -> SentinelStats {
        self.stats.clone()
    }

    pub fn task_kinds(&self) -> Vec<TaskKind> {
        self.tasks.iter().map(|t| t.kind()).collect()
    }

    /// Main event loop - runs until the surrounding task is dropped
    ///
    /// The first tick of each task fires one interval after start.
    pub async fn run(self) {
        info!(
            "Sentinel active | backup every {}s | cron every {}s | health every {}s",
            self.policy.backup_interval_s, self.policy.cron_interval_s, self.policy.health_interval_s
        );

        let mut loops = JoinSet::new();
        for task in self.tasks {
            let period = self.policy.interval_for(task.kind());
            let timeout = self.policy.tick_timeout();
            let stats = self.stats.clone();

            loops.spawn(async move {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    let _ = execute_tick(task.as_ref(), timeout, &stats).await;
                }
            });
        }

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!("Sentinel task loop ended: {}", e);
            }
        }
    }

    /// Run one tick of `kind` now, outside the schedule
    ///
    /// Note: Public for integration testing and manual triggers
    pub async fn run_tick(&self, kind: TaskKind) -> Option<Result<TickOutcome, String>> {
        let task = self.tasks.iter().find(|t| t.kind() == kind)?;
        Some(execute_tick(task.as_ref(), self.policy.tick_timeout(), &self.stats).await)
    }
}

async fn execute_tick(
    task: &dyn SentinelTask,
    timeout: Duration,
    stats: &SentinelStats,
) -> Result<TickOutcome, String> {
    let kind = task.kind();
    let started = Instant::now();
    debug!(task = %kind, "Sentinel tick");

    let result = match tokio::time::timeout(timeout, task.tick()).await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(_) => Err(format!("tick exceeded {:?}", timeout)),
    };
    let elapsed = started.elapsed();

    match result {
        Ok(ref outcome) => {
            stats.update(kind, |s| s.record_success(outcome, elapsed));
            match outcome {
                TickOutcome::Acted(action) => info!(task = %kind, elapsed = ?elapsed, "{}", action),
                TickOutcome::Idle => debug!(task = %kind, elapsed = ?elapsed, "Nothing to do"),
            }
        }
        Err(ref e) => {
            let streak = stats.update(kind, |s| {
                s.record_failure(e.clone(), elapsed);
                s.consecutive_failures
            });
            warn!(task = %kind, consecutive_failures = streak, "Tick failed: {}", e);
        }
    }
    result
}
