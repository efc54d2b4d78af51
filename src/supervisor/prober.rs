//! Health Prober
//!
//! A gateway counts as healthy only when its port accepts connections and the
//! service answering on that port is the gateway itself. Sandboxes ship a
//! fallback stub that binds the same port while the real server boots, so an
//! open port on its own proves nothing.

use std::time::Duration;
use tether_host_interface::{HostError, ProcessHandle};
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::error::{Result, TetherError};

/// Probes one gateway port
#[derive(Debug, Clone)]
pub struct HealthProber {
    port: u16,
    probe_path: String,
    gateway_markers: Vec<String>,
    stub_markers: Vec<String>,
    probe_timeout: Duration,
}

impl HealthProber {
    pub fn new(gateway: &GatewayConfig, probe_timeout: Duration) -> Self {
        Self {
            port: gateway.port,
            probe_path: gateway.probe_path.clone(),
            gateway_markers: gateway.gateway_markers.clone(),
            stub_markers: gateway.stub_markers.clone(),
            probe_timeout,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait until the gateway port opens, bounded by `timeout`
    pub async fn wait_for_port(&self, handle: &ProcessHandle, timeout: Duration) -> Result<()> {
        let waited = tokio::time::timeout(timeout, handle.wait_for_port(self.port, timeout)).await;

        match waited {
            Ok(Ok(())) => {
                debug!(id = %handle.id(), port = self.port, "Gateway port is open");
                Ok(())
            }
            Ok(Err(HostError::PortTimeout { .. })) => Err(TetherError::PortTimeout {
                port: self.port,
                timeout,
            }),
            Ok(Err(e)) => {
                debug!(id = %handle.id(), port = self.port, error = %e, "Port wait failed");
                Err(TetherError::PortWaitFailed {
                    port: self.port,
                    detail: e.to_string(),
                })
            }
            Err(_) => Err(TetherError::PortTimeout {
                port: self.port,
                timeout,
            }),
        }
    }

    /// Confirm the service on the port is the gateway and not the stub
    pub async fn identity_probe(&self, handle: &ProcessHandle) -> Result<()> {
        let request = handle
            .host()
            .http_get(self.port, &self.probe_path, self.probe_timeout);

        match tokio::time::timeout(self.probe_timeout, request).await {
            Ok(Ok(response)) => self.check_body(&response.body),
            Ok(Err(e)) => {
                // Port is already confirmed open; one failed request is not evidence
                warn!(id = %handle.id(), port = self.port, error = %e, "Identity probe request failed, assuming healthy");
                Ok(())
            }
            Err(_) => {
                warn!(id = %handle.id(), port = self.port, timeout = ?self.probe_timeout, "Identity probe timed out, assuming healthy");
                Ok(())
            }
        }
    }

    /// Port wait followed by the identity probe
    pub async fn probe(&self, handle: &ProcessHandle, timeout: Duration) -> Result<()> {
        self.wait_for_port(handle, timeout).await?;
        self.identity_probe(handle).await
    }

    fn check_body(&self, body: &str) -> Result<()> {
        if let Some(marker) = self.stub_markers.iter().find(|m| body.contains(m.as_str())) {
            return Err(TetherError::ServingWrongService {
                port: self.port,
                detail: format!("response contains stub marker '{}'", marker),
            });
        }

        if !self.gateway_markers.is_empty()
            && !self.gateway_markers.iter().any(|m| body.contains(m.as_str()))
        {
            return Err(TetherError::ServingWrongService {
                port: self.port,
                detail: "response lacks every gateway marker".to_string(),
            });
        }

        Ok(())
    }
}
