//! Process Supervisor
//!
//! Keeps exactly one verified gateway alive. Nothing is cached between calls:
//! every `ensure` re-derives the truth from the host's process table, the
//! fingerprint file and a live probe, so concurrent callers need no lock.
//!
//! A fresh start claims the fingerprint before spawning and releases the
//! claim if the gateway never verifies. While the claim holds, a gateway
//! younger than the startup timeout is someone's boot in flight: later callers
//! wait on it instead of reaping it, and of two simultaneous starts the
//! earlier one survives.

pub mod classify;
pub mod fingerprint;
pub mod prober;
pub mod reaper;

pub use classify::{CommandClassifier, ProcessClass, ProcessClassifier};
pub use fingerprint::FingerprintTracker;
pub use prober::HealthProber;
pub use reaper::ZombieReaper;

use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tether_host_interface::{ProcessHandle, ProcessId, ProcessInfo, ProcessStatus, SandboxHost};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{GatewayConfig, SupervisorConfig};
use crate::error::{Result, TetherError};

/// Point-in-time view of the gateway, with no side effects
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub gateway: Option<ProcessInfo>,
    pub desired_fingerprint: String,
    pub stored_fingerprint: Option<String>,
    pub fingerprint_matches: bool,
    pub gateway_processes: usize,
    pub auxiliary_processes: usize,
    /// Auxiliary rows that have exited but are still listed
    pub zombie_processes: usize,
    /// Time since this supervisor last started a gateway
    pub since_last_start: Option<Duration>,
}

/// What an idle health check did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    /// No gateway is running; nothing to check
    NotRunning,
    Healthy,
    /// Probe failed, but the gateway was started too recently to restart
    WithinGrace,
    Restarted(tether_host_interface::ProcessId),
    RestartFailed(String),
}

pub struct Supervisor {
    host: Arc<dyn SandboxHost>,
    classifier: Arc<dyn ProcessClassifier>,
    reaper: ZombieReaper,
    gateway: GatewayConfig,
    config: SupervisorConfig,
    last_start: Mutex<Option<Instant>>,
}

impl Supervisor {
    /// Supervisor using the default command-line classifier
    pub fn new(host: Arc<dyn SandboxHost>, gateway: GatewayConfig, config: SupervisorConfig) -> Self {
        let classifier = Arc::new(CommandClassifier::from_config(&gateway));
        Self::with_classifier(host, gateway, config, classifier)
    }

    pub fn with_classifier(
        host: Arc<dyn SandboxHost>,
        gateway: GatewayConfig,
        config: SupervisorConfig,
        classifier: Arc<dyn ProcessClassifier>,
    ) -> Self {
        let reaper = ZombieReaper::new(host.clone(), classifier.clone());
        Self {
            host,
            classifier,
            reaper,
            gateway,
            config,
            last_start: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &Arc<dyn SandboxHost> {
        &self.host
    }

    /// The gateway configuration this supervisor was built with
    pub fn desired(&self) -> &GatewayConfig {
        &self.gateway
    }

    /// When this instance last started a gateway
    pub fn last_start(&self) -> Option<Instant> {
        *self.last_start.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn record_start(&self) {
        *self.last_start.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
    }

    /// Return a verified gateway for `desired`, starting one if needed
    ///
    /// A returned handle always has its port open and has passed the identity
    /// probe. The fingerprint is claimed before a fresh start, so a caller
    /// arriving mid-boot joins that start instead of replacing it.
    pub async fn ensure(&self, desired: &GatewayConfig) -> Result<ProcessHandle> {
        let prober = HealthProber::new(desired, self.config.probe_timeout());
        let fingerprints = FingerprintTracker::new(self.host.clone(), desired.fingerprint_path.clone());
        let wanted = FingerprintTracker::compute(desired);
        let mut rejected: Option<ProcessId> = None;

        if let Some(info) = self.find_gateway(None).await? {
            let handle = ProcessHandle::new(info, self.host.clone());

            if fingerprints.matches(&wanted).await {
                match prober.probe(&handle, self.config.startup_timeout()).await {
                    Ok(()) => {
                        debug!(id = %handle.id(), "Reusing verified gateway");
                        return Ok(handle);
                    }
                    Err(e) => {
                        warn!(id = %handle.id(), error = %e, "Existing gateway failed its probe, replacing it");
                        self.kill_quietly(&handle).await;
                    }
                }
            } else {
                info!(id = %handle.id(), fingerprint = %wanted, "Gateway config changed, restarting");
                self.kill_quietly(&handle).await;
            }
            rejected = Some(handle.id().clone());
        }

        // With a matching claim, a recent gateway is another caller's start in flight
        let claimed = fingerprints.matches(&wanted).await;
        let recent_after = self.recent_cutoff();
        let in_flight = |p: &ProcessInfo| {
            claimed && rejected.as_ref() != Some(&p.id) && p.start_time >= recent_after
        };
        if let Err(e) = self.reaper.reap_sparing(None, in_flight).await {
            warn!(error = %e, "Reaper pass failed before start");
        }

        if claimed {
            if let Some(info) = self.find_gateway(rejected.as_ref()).await? {
                let handle = ProcessHandle::new(info, self.host.clone());
                info!(id = %handle.id(), "Joining gateway start already in flight");
                match prober.probe(&handle, self.config.startup_timeout()).await {
                    Ok(()) => return Ok(handle),
                    Err(e) => {
                        warn!(id = %handle.id(), error = %e, "In-flight gateway never became healthy");
                        self.kill_quietly(&handle).await;
                        rejected = Some(handle.id().clone());
                    }
                }
            }
        }

        self.start_fresh(desired, &prober, &fingerprints, &wanted, rejected.as_ref())
            .await
    }

    async fn start_fresh(
        &self,
        desired: &GatewayConfig,
        prober: &HealthProber,
        fingerprints: &FingerprintTracker,
        wanted: &str,
        rejected: Option<&ProcessId>,
    ) -> Result<ProcessHandle> {
        info!(command = %desired.start_command, port = desired.port, "Starting gateway");

        let previous = fingerprints.stored().await;
        if let Err(e) = fingerprints.persist(wanted).await {
            warn!(error = %e, "Could not claim the gateway fingerprint before starting");
        }

        let info = match self
            .host
            .start_process(&desired.start_command, &desired.composed_env())
            .await
        {
            Ok(info) => info,
            Err(e) => {
                self.release_claim(fingerprints, previous.as_deref(), wanted).await;
                return Err(TetherError::ProcessStartFailed {
                    reason: e.to_string(),
                });
            }
        };
        let handle = ProcessHandle::new(info, self.host.clone());

        // Two callers can both reach this point; the earlier start wins
        if let Some(rival) = self.earlier_rival(&handle, fingerprints, wanted, rejected).await? {
            let rival = ProcessHandle::new(rival, self.host.clone());
            info!(id = %handle.id(), rival = %rival.id(), "Concurrent start detected, deferring to the earlier gateway");
            self.kill_quietly(&handle).await;
            prober.probe(&rival, self.config.startup_timeout()).await?;
            return Ok(rival);
        }

        if let Err(e) = prober.probe(&handle, self.config.startup_timeout()).await {
            let logs = handle.logs().await.unwrap_or_default();
            self.kill_quietly(&handle).await;
            self.release_claim(fingerprints, previous.as_deref(), wanted).await;
            return Err(TetherError::StartupFailed {
                id: handle.id().clone(),
                reason: e.to_string(),
                stdout: logs.stdout,
                stderr: logs.stderr,
            });
        }

        if let Err(e) = fingerprints.persist(wanted).await {
            warn!(error = %e, "Gateway is up but its fingerprint could not be saved");
        }
        self.record_start();

        info!(id = %handle.id(), "Gateway started and verified");
        Ok(handle)
    }

    /// Undo a claim made for a start that never verified
    async fn release_claim(&self, fingerprints: &FingerprintTracker, previous: Option<&str>, wanted: &str) {
        if previous == Some(wanted) {
            return;
        }
        if let Err(e) = fingerprints.restore(previous).await {
            warn!(error = %e, "Could not release the gateway fingerprint claim");
        }
    }

    /// Gateways started before this instant are no longer booting
    fn recent_cutoff(&self) -> SystemTime {
        SystemTime::now()
            .checked_sub(self.config.startup_timeout())
            .unwrap_or(UNIX_EPOCH)
    }

    /// Another live, recent gateway started before `ours` under the same claim
    async fn earlier_rival(
        &self,
        ours: &ProcessHandle,
        fingerprints: &FingerprintTracker,
        wanted: &str,
        rejected: Option<&ProcessId>,
    ) -> Result<Option<ProcessInfo>> {
        let recent_after = self.recent_cutoff();
        let ours_key = (ours.start_time(), ours.id().clone());
        let rival = self
            .host
            .list_processes()
            .await?
            .into_iter()
            .filter(|p| p.status.is_alive())
            .filter(|p| &p.id != ours.id() && Some(&p.id) != rejected)
            .filter(|p| p.start_time >= recent_after)
            .filter(|p| self.classifier.classify(&p.command) == ProcessClass::Gateway)
            .filter(|p| (p.start_time, p.id.clone()) < ours_key)
            .min_by_key(|p| (p.start_time, p.id.clone()));

        match rival {
            Some(rival) if fingerprints.matches(wanted).await => Ok(Some(rival)),
            _ => Ok(None),
        }
    }

    /// Most relevant live gateway: running beats starting, newer beats older
    async fn find_gateway(&self, except: Option<&ProcessId>) -> Result<Option<ProcessInfo>> {
        let procs = self.host.list_processes().await?;
        Ok(procs
            .into_iter()
            .filter(|p| p.status.is_alive())
            .filter(|p| Some(&p.id) != except)
            .filter(|p| self.classifier.classify(&p.command) == ProcessClass::Gateway)
            .max_by_key(|p| (p.status == ProcessStatus::Running, p.start_time)))
    }

    /// Live gateway, if any, without starting or probing anything
    pub async fn current(&self) -> Result<Option<ProcessHandle>> {
        Ok(self
            .find_gateway(None)
            .await?
            .map(|info| ProcessHandle::new(info, self.host.clone())))
    }

    /// Kill and re-check; failures never propagate
    async fn kill_quietly(&self, handle: &ProcessHandle) {
        if let Err(e) = handle.kill().await {
            debug!(id = %handle.id(), error = %e, "Kill failed, process may already be gone");
        }

        match self.host.process(handle.id()).await {
            Ok(info) if info.status.is_alive() => {
                warn!(id = %info.id, status = %info.status, "Process still alive after kill");
            }
            _ => {}
        }
    }

    pub async fn status(&self) -> Result<GatewayStatus> {
        let procs = self.host.list_processes().await?;
        let fingerprints = FingerprintTracker::new(self.host.clone(), self.gateway.fingerprint_path.clone());
        let desired_fingerprint = FingerprintTracker::compute(&self.gateway);
        let stored_fingerprint = fingerprints.stored().await;

        let (gateways, auxiliaries): (Vec<&ProcessInfo>, Vec<&ProcessInfo>) = procs
            .iter()
            .partition(|p| self.classifier.classify(&p.command) == ProcessClass::Gateway);

        let gateway = gateways
            .iter()
            .filter(|p| p.status.is_alive())
            .max_by_key(|p| (p.status == ProcessStatus::Running, p.start_time))
            .map(|p| (*p).clone());

        Ok(GatewayStatus {
            gateway,
            fingerprint_matches: stored_fingerprint.as_deref() == Some(desired_fingerprint.as_str()),
            desired_fingerprint,
            stored_fingerprint,
            gateway_processes: gateways.len(),
            auxiliary_processes: auxiliaries.len(),
            zombie_processes: auxiliaries.iter().filter(|p| !p.status.is_alive()).count(),
            since_last_start: self.last_start().map(|t| t.elapsed()),
        })
    }

    /// Kill every gateway and start a fresh one
    pub async fn restart(&self) -> Result<ProcessHandle> {
        let procs = self.host.list_processes().await?;
        for info in procs
            .into_iter()
            .filter(|p| self.classifier.classify(&p.command) == ProcessClass::Gateway)
        {
            let handle = ProcessHandle::new(info, self.host.clone());
            self.kill_quietly(&handle).await;
        }

        info!("Gateway restart requested");
        self.ensure(&self.gateway).await
    }

    /// Idle health check for the background tick
    ///
    /// Only restarts when a gateway exists, fails its probe, and was not
    /// started by this supervisor within the grace period.
    pub async fn check_health(&self) -> Result<HealthOutcome> {
        let Some(info) = self.find_gateway(None).await? else {
            debug!("No gateway running, skipping health check");
            return Ok(HealthOutcome::NotRunning);
        };

        let handle = ProcessHandle::new(info, self.host.clone());
        let prober = HealthProber::new(&self.gateway, self.config.probe_timeout());

        let err = match prober.probe(&handle, self.config.probe_timeout()).await {
            Ok(()) => return Ok(HealthOutcome::Healthy),
            Err(e) => e,
        };

        let grace = self.config.health_grace();
        if let Some(started) = self.last_start() {
            if started.elapsed() < grace {
                debug!(id = %handle.id(), error = %err, "Gateway unhealthy but within startup grace");
                return Ok(HealthOutcome::WithinGrace);
            }
        }

        warn!(id = %handle.id(), error = %err, "Gateway failed idle health check, restarting");
        self.kill_quietly(&handle).await;
        match self.ensure(&self.gateway).await {
            Ok(fresh) => Ok(HealthOutcome::Restarted(fresh.id().clone())),
            Err(e) => Ok(HealthOutcome::RestartFailed(e.to_string())),
        }
    }
}
