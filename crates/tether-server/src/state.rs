//! Shared state for every handler

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tether::proxy::{BackendConnector, ErrorTranslator, ProxySettings, ReconnectingProxy};
use tether::{Supervisor, TetherConfig};
use tether_host_interface::SandboxHost;
use tether_sentinel::SentinelStats;

use crate::backend::GatewayConnector;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<TetherConfig>,

    pub supervisor: Arc<Supervisor>,

    /// Session machine shared by every client connection
    pub proxy: Arc<ReconnectingProxy>,

    /// Tick counters of the background sentinel, if one is running
    pub sentinel: Option<SentinelStats>,

    /// Client sessions currently open
    pub active_sessions: Arc<AtomicUsize>,

    pub started_at: Instant,
}

impl AppState {
    /// State wired to the real gateway connector
    pub fn new(config: TetherConfig, host: Arc<dyn SandboxHost>) -> Self {
        let supervisor = Arc::new(Supervisor::new(
            host,
            config.gateway.clone(),
            config.supervisor.clone(),
        ));
        let connector = Arc::new(GatewayConnector::new(
            supervisor.clone(),
            config.gateway.clone(),
            &config.proxy.backend_path,
        ));
        Self::with_connector(config, supervisor, connector)
    }

    /// State with a caller-provided backend connector
    pub fn with_connector(
        config: TetherConfig,
        supervisor: Arc<Supervisor>,
        connector: Arc<dyn BackendConnector>,
    ) -> Self {
        let proxy = Arc::new(ReconnectingProxy::new(
            connector,
            Arc::new(ErrorTranslator::default()),
            ProxySettings::from(&config.proxy),
        ));
        Self {
            config: Arc::new(config),
            supervisor,
            proxy,
            sentinel: None,
            active_sessions: Arc::new(AtomicUsize::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn with_sentinel(mut self, stats: SentinelStats) -> Self {
        self.sentinel = Some(stats);
        self
    }

    pub fn sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }
}
