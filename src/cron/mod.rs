//! Scheduled Job Reconciler
//!
//! The gateway forgets its scheduled jobs whenever its state is lost. Each
//! reconcile pass compares the desired job list against the live registry and
//! registers only what is missing.

pub mod registry;

pub use registry::{parse_job_names, CliJobRegistry, JobRegistry};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tether_host_interface::{ProcessHandle, ProcessStatus};
use tracing::{debug, info, warn};

use crate::error::{Result, TetherError};

/// A job the gateway should always have
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronSpec {
    pub name: String,
    /// Interval in the gateway's own syntax, e.g. `6h`
    pub interval: String,
    /// Prompt the job sends when it fires
    pub message: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// What one reconcile pass found and did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Jobs listed before anything was changed
    pub live_before: Vec<String>,
    /// Whether the snapshot was restored because the registry was empty
    pub restored: bool,
    /// Jobs confirmed registered by this pass
    pub added: Vec<String>,
    pub already_present: Vec<String>,
    /// Jobs still missing after the registration attempt
    pub failed: Vec<String>,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        self.restored || !self.added.is_empty()
    }
}

pub struct Reconciler {
    registry: Arc<dyn JobRegistry>,
}

impl Reconciler {
    pub fn new(registry: Arc<dyn JobRegistry>) -> Self {
        Self { registry }
    }

    /// Bring the live registry up to `desired`. Safe to repeat.
    pub async fn reconcile(
        &self,
        handle: &ProcessHandle,
        desired: &[CronSpec],
    ) -> Result<ReconcileReport> {
        let mut current = handle.clone();
        let status = match current.refresh().await {
            Ok(info) => info.status,
            Err(e) => {
                debug!(id = %handle.id(), error = %e, "Gateway handle no longer resolves");
                return Err(TetherError::GatewayNotRunning(handle.id().clone()));
            }
        };
        if status != ProcessStatus::Running {
            return Err(TetherError::GatewayNotRunning(handle.id().clone()));
        }

        let mut report = ReconcileReport {
            live_before: self.registry.list().await?,
            ..Default::default()
        };
        let mut live = report.live_before.clone();

        if live.is_empty() {
            match self.registry.restore_snapshot().await {
                Ok(true) => {
                    report.restored = true;
                    live = self.registry.list().await?;
                    info!(jobs = live.len(), "Restored job registry from snapshot");
                }
                Ok(false) => debug!("Job registry empty and no snapshot available"),
                Err(e) => warn!(error = %e, "Job snapshot restore failed"),
            }
        }

        let mut missing: Vec<CronSpec> = Vec::new();
        for spec in desired {
            if live.contains(&spec.name) {
                if !report.already_present.contains(&spec.name) {
                    report.already_present.push(spec.name.clone());
                }
            } else if !missing.iter().any(|m| m.name == spec.name) {
                missing.push(spec.clone());
            }
        }

        if missing.is_empty() {
            return Ok(report);
        }

        let names: Vec<String> = missing.iter().map(|s| s.name.clone()).collect();
        match self.registry.add_batch(&missing).await {
            Ok(()) => report.added = names,
            Err(e) => {
                warn!(error = %e, "Some job registrations failed");
                // Only the registry knows which adds landed
                let listed = match self.registry.list().await {
                    Ok(listed) => listed,
                    Err(e) => {
                        debug!(error = %e, "Could not re-list jobs after a failed batch");
                        Vec::new()
                    }
                };
                let (added, failed): (Vec<String>, Vec<String>) =
                    names.into_iter().partition(|name| listed.contains(name));
                report.added = added;
                report.failed = failed;
            }
        }

        if !report.added.is_empty() {
            info!(added = ?report.added, "Registered missing jobs");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::MockHost;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tether_host_interface::{ExecOutput, SandboxHost};

    /// Structured in-memory registry
    #[derive(Default)]
    struct FakeRegistry {
        jobs: Mutex<Vec<String>>,
        snapshot: Option<Vec<String>>,
        add_calls: Mutex<Vec<String>>,
        restores: Mutex<usize>,
        /// Names whose registration errors
        refuse: Vec<String>,
    }

    impl FakeRegistry {
        fn with_jobs(jobs: &[&str]) -> Self {
            Self {
                jobs: Mutex::new(jobs.iter().map(|j| j.to_string()).collect()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl JobRegistry for FakeRegistry {
        async fn list(&self) -> Result<Vec<String>> {
            Ok(self.jobs.lock().unwrap().clone())
        }

        async fn add(&self, spec: &CronSpec) -> Result<()> {
            self.add_calls.lock().unwrap().push(spec.name.clone());
            if self.refuse.contains(&spec.name) {
                return Err(TetherError::Registry(format!("{} rejected", spec.name)));
            }
            self.jobs.lock().unwrap().push(spec.name.clone());
            Ok(())
        }

        async fn restore_snapshot(&self) -> Result<bool> {
            *self.restores.lock().unwrap() += 1;
            match self.snapshot {
                Some(ref snapshot) => {
                    *self.jobs.lock().unwrap() = snapshot.clone();
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }

    fn spec(name: &str) -> CronSpec {
        CronSpec {
            name: name.to_string(),
            interval: "6h".to_string(),
            message: format!("run {}", name),
            model: None,
        }
    }

    async fn running_gateway(host: &Arc<MockHost>) -> ProcessHandle {
        let id = host.add_process("agentd gateway", ProcessStatus::Running);
        ProcessHandle::new(host.process(&id).await.unwrap(), host.clone())
    }

    #[tokio::test]
    async fn test_only_missing_job_is_added() {
        let host = Arc::new(MockHost::new());
        let handle = running_gateway(&host).await;
        let registry = Arc::new(FakeRegistry::with_jobs(&["other-job"]));
        let reconciler = Reconciler::new(registry.clone());

        let report = reconciler
            .reconcile(&handle, &[spec("auto-study")])
            .await
            .unwrap();

        assert_eq!(*registry.add_calls.lock().unwrap(), vec!["auto-study"]);
        assert_eq!(report.added, vec!["auto-study"]);
        assert!(!report.restored);
        assert_eq!(*registry.restores.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let host = Arc::new(MockHost::new());
        let handle = running_gateway(&host).await;
        let registry = Arc::new(FakeRegistry::with_jobs(&["other-job"]));
        let reconciler = Reconciler::new(registry.clone());
        let desired = [spec("auto-study"), spec("other-job")];

        reconciler.reconcile(&handle, &desired).await.unwrap();
        let second = reconciler.reconcile(&handle, &desired).await.unwrap();

        assert!(!second.changed());
        assert_eq!(second.already_present, vec!["auto-study", "other-job"]);
        assert_eq!(registry.add_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_registry_restores_snapshot_first() {
        let host = Arc::new(MockHost::new());
        let handle = running_gateway(&host).await;
        let registry = Arc::new(FakeRegistry {
            snapshot: Some(vec!["auto-study".to_string()]),
            ..Default::default()
        });
        let reconciler = Reconciler::new(registry.clone());

        let report = reconciler
            .reconcile(&handle, &[spec("auto-study"), spec("digest")])
            .await
            .unwrap();

        assert!(report.restored);
        assert!(report.live_before.is_empty());
        assert_eq!(report.added, vec!["digest"]);
        assert_eq!(*registry.restores.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_desired_registered_once() {
        let host = Arc::new(MockHost::new());
        let handle = running_gateway(&host).await;
        let registry = Arc::new(FakeRegistry::default());
        let reconciler = Reconciler::new(registry.clone());

        reconciler
            .reconcile(&handle, &[spec("a"), spec("a")])
            .await
            .unwrap();
        assert_eq!(*registry.add_calls.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_rejected_job_is_not_reported_added() {
        let host = Arc::new(MockHost::new());
        let handle = running_gateway(&host).await;
        let registry = Arc::new(FakeRegistry {
            refuse: vec!["digest".to_string()],
            ..FakeRegistry::with_jobs(&["other-job"])
        });

        let report = Reconciler::new(registry.clone())
            .reconcile(&handle, &[spec("auto-study"), spec("digest")])
            .await
            .unwrap();

        assert_eq!(report.added, vec!["auto-study"]);
        assert_eq!(report.failed, vec!["digest"]);
        assert!(report.changed());
    }

    #[tokio::test]
    async fn test_dead_gateway_is_skipped() {
        let host = Arc::new(MockHost::new());
        let handle = running_gateway(&host).await;
        host.set_status(handle.id(), ProcessStatus::Failed);
        let registry = Arc::new(FakeRegistry::default());

        let err = Reconciler::new(registry.clone())
            .reconcile(&handle, &[spec("a")])
            .await
            .unwrap_err();

        assert!(matches!(err, TetherError::GatewayNotRunning(_)));
        assert!(registry.add_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cli_registry_scenario() {
        let host = Arc::new(MockHost::new());
        let handle = running_gateway(&host).await;
        host.on_exec(|cmd| {
            if cmd.ends_with("cron list") {
                ExecOutput::ok("other-job every 6h\n")
            } else {
                ExecOutput::ok("")
            }
        });
        let registry = Arc::new(CliJobRegistry::new(
            host.clone(),
            "agentd",
            &crate::config::CronConfig::default(),
        ));

        Reconciler::new(registry)
            .reconcile(&handle, &[spec("auto-study")])
            .await
            .unwrap();

        let adds: Vec<String> = host
            .executed()
            .into_iter()
            .filter(|c| c.contains("cron add"))
            .collect();
        assert_eq!(adds.len(), 1);
        assert!(adds[0].contains("--name auto-study"));
        assert!(!adds[0].contains("other-job"));
    }
}
