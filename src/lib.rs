/*!
 * Tether - sandboxed gateway supervision behind a reconnecting edge proxy
 *
 * The library holds everything that does not need a socket:
 * - Gateway supervision (fingerprint restarts, identity probes, zombie reaping)
 * - Reconnecting client sessions over in-memory frame links
 * - Durable backup mirroring of gateway state into a mounted bucket
 * - Scheduled job reconciliation against the gateway's job registry
 *
 * Everything talks to the sandbox through `tether_host_interface::SandboxHost`.
 */

pub mod backup;
pub mod config;
pub mod cron;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod shell;
pub mod supervisor;
pub mod system;

// Re-export commonly used types
pub use backup::{BackupSynchronizer, SubtreeSpec, SyncResult};
pub use config::TetherConfig;
pub use cron::{CliJobRegistry, CronSpec, JobRegistry, Reconciler};
pub use error::{Result, TetherError};
pub use proxy::{BackendConnector, ReconnectingProxy};
pub use supervisor::{GatewayStatus, HealthOutcome, Supervisor};
pub use system::{LocalHost, MockHost};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
