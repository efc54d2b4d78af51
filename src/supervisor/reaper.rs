//! Zombie Reaper
//!
//! Clears stale rows out of the sandbox process table: every gateway except
//! the one being kept, and every auxiliary process that has already exited.

use std::sync::Arc;
use tether_host_interface::{ProcessId, ProcessInfo, SandboxHost};
use tracing::{debug, info, warn};

use super::classify::{ProcessClass, ProcessClassifier};
use crate::error::Result;

pub struct ZombieReaper {
    host: Arc<dyn SandboxHost>,
    classifier: Arc<dyn ProcessClassifier>,
}

impl ZombieReaper {
    pub fn new(host: Arc<dyn SandboxHost>, classifier: Arc<dyn ProcessClassifier>) -> Self {
        Self { host, classifier }
    }

    /// Kill stale processes, returning how many kills the host acknowledged
    ///
    /// Kill failures are swallowed; the table is re-listed afterwards and any
    /// survivor is logged.
    pub async fn reap(&self, keep: Option<&ProcessId>) -> Result<usize> {
        self.reap_sparing(keep, |_| false).await
    }

    /// Like [`reap`](Self::reap), but leaves alone any gateway `spare` accepts
    pub async fn reap_sparing<F>(&self, keep: Option<&ProcessId>, spare: F) -> Result<usize>
    where
        F: Fn(&ProcessInfo) -> bool + Send + Sync,
    {
        let targets: Vec<ProcessInfo> = self
            .host
            .list_processes()
            .await?
            .into_iter()
            .filter(|p| self.is_stale(p, keep, &spare))
            .collect();

        if targets.is_empty() {
            return Ok(0);
        }

        let mut killed = 0;
        for target in &targets {
            match self.host.kill_process(&target.id).await {
                Ok(()) => {
                    killed += 1;
                    debug!(id = %target.id, status = %target.status, command = %target.command, "Reaped process");
                }
                Err(e) => {
                    debug!(id = %target.id, error = %e, "Kill failed, process may already be gone");
                }
            }
        }

        self.verify(&targets).await;

        info!(targets = targets.len(), killed, "Reaper pass complete");
        Ok(killed)
    }

    fn is_stale<F>(&self, process: &ProcessInfo, keep: Option<&ProcessId>, spare: &F) -> bool
    where
        F: Fn(&ProcessInfo) -> bool,
    {
        match self.classifier.classify(&process.command) {
            ProcessClass::Gateway => keep != Some(&process.id) && !spare(process),
            ProcessClass::Auxiliary => !process.status.is_alive(),
        }
    }

    async fn verify(&self, targets: &[ProcessInfo]) {
        let remaining = match self.host.list_processes().await {
            Ok(procs) => procs,
            Err(e) => {
                warn!(error = %e, "Could not re-list processes after reaping");
                return;
            }
        };

        for survivor in remaining
            .iter()
            .filter(|p| targets.iter().any(|t| t.id == p.id))
        {
            if survivor.status.is_alive() {
                warn!(id = %survivor.id, command = %survivor.command, "Process survived kill");
            } else {
                debug!(id = %survivor.id, status = %survivor.status, "Exited process still listed");
            }
        }
    }
}
