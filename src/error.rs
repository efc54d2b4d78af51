/*!
 * Error types for Tether
 */

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tether_host_interface::{HostError, ProcessId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TetherError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug, Error)]
pub enum TetherError {
    /// The gateway never opened its port within the budget
    #[error("Gateway port {port} did not open within {timeout:?}")]
    PortTimeout { port: u16, timeout: Duration },

    /// The port wait ended early: the process exited or left the table
    #[error("Gateway port {port} never opened: {detail}")]
    PortWaitFailed { port: u16, detail: String },

    /// Something is listening on the gateway port, but it is not the gateway
    #[error("Port {port} is served by something other than the gateway: {detail}")]
    ServingWrongService { port: u16, detail: String },

    /// The host refused to spawn the gateway
    #[error("Failed to start gateway process: {reason}")]
    ProcessStartFailed { reason: String },

    /// The gateway was spawned but never became healthy
    #[error(
        "Gateway process {id} failed to become healthy: {reason}\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}"
    )]
    StartupFailed {
        id: ProcessId,
        reason: String,
        stdout: String,
        stderr: String,
    },

    /// Backup source is missing its required marker file
    #[error("Backup source is incomplete: {0} not found")]
    SourceIncomplete(PathBuf),

    /// Mirror ran but the destination marker could not be confirmed
    #[error("Backup sync failed: {0}")]
    SyncFailed(String),

    /// Storage credentials are not configured
    #[error("Storage credentials are not configured (missing {0})")]
    MissingCredentials(String),

    /// The bucket could not be mounted
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The job registry could not be read or written
    #[error("Job registry error: {0}")]
    Registry(String),

    /// A reconcile pass was handed a process that is not running
    #[error("Gateway process {0} is not running")]
    GatewayNotRunning(ProcessId),

    /// The backend stayed unreachable after every reconnect attempt
    #[error("Gateway unreachable after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Backend transport failure
    #[error("Backend connection error: {0}")]
    Backend(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Sandbox host error
    #[error("Sandbox host error: {0}")]
    Host(#[from] HostError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TetherError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            TetherError::Config(_)
            | TetherError::MissingCredentials(_)
            | TetherError::ProcessStartFailed { .. }
            | TetherError::StartupFailed { .. } => EXIT_FATAL,
            _ => EXIT_PARTIAL,
        }
    }

    /// Check if this error is fatal (retrying in-process will not help)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TetherError::Config(_)
                | TetherError::MissingCredentials(_)
                | TetherError::ProcessStartFailed { .. }
                | TetherError::StartupFailed { .. }
                | TetherError::ReconnectExhausted { .. }
        )
    }

    /// Check if this error is transient (worth retrying on the next tick)
    pub fn is_transient(&self) -> bool {
        match self {
            TetherError::PortTimeout { .. }
            | TetherError::PortWaitFailed { .. }
            | TetherError::ServingWrongService { .. }
            | TetherError::SyncFailed(_)
            | TetherError::StorageUnavailable(_)
            | TetherError::Registry(_)
            | TetherError::GatewayNotRunning(_)
            | TetherError::Backend(_) => true,
            TetherError::Host(host_err) => matches!(
                host_err,
                HostError::Timeout(_) | HostError::Http(_) | HostError::PortTimeout { .. }
            ),
            TetherError::Io(io_err) => Self::is_io_transient(io_err),
            _ => false,
        }
    }

    fn is_io_transient(io_err: &std::io::Error) -> bool {
        use std::io::ErrorKind::*;
        matches!(
            io_err.kind(),
            ConnectionRefused
                | ConnectionReset
                | ConnectionAborted
                | NotConnected
                | BrokenPipe
                | TimedOut
                | Interrupted
        )
    }

    /// Short operator-facing hint for request-path failures
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            TetherError::PortTimeout { .. } | TetherError::StartupFailed { .. } => {
                Some("The gateway is taking too long to start. Check the gateway logs and retry.")
            }
            TetherError::PortWaitFailed { .. } => {
                Some("The gateway exited before opening its port. Check the gateway logs.")
            }
            TetherError::ServingWrongService { .. } => {
                Some("A fallback service is bound to the gateway port. Restart the gateway.")
            }
            TetherError::ProcessStartFailed { .. } => {
                Some("The sandbox refused to start the gateway. Verify the start command.")
            }
            TetherError::MissingCredentials(_) => {
                Some("Set the storage access key and secret to enable backups.")
            }
            TetherError::ReconnectExhausted { .. } => {
                Some("The gateway is unavailable. Refresh to try again.")
            }
            _ => None,
        }
    }

    /// Get error category for logging and instrumentation
    pub fn category(&self) -> ErrorCategory {
        match self {
            TetherError::PortTimeout { .. }
            | TetherError::PortWaitFailed { .. }
            | TetherError::ServingWrongService { .. }
            | TetherError::GatewayNotRunning(_) => ErrorCategory::Health,
            TetherError::ProcessStartFailed { .. } | TetherError::StartupFailed { .. } => {
                ErrorCategory::Startup
            }
            TetherError::SourceIncomplete(_) | TetherError::SyncFailed(_) => ErrorCategory::Backup,
            TetherError::MissingCredentials(_) | TetherError::StorageUnavailable(_) => {
                ErrorCategory::Storage
            }
            TetherError::Registry(_) => ErrorCategory::Scheduling,
            TetherError::ReconnectExhausted { .. } | TetherError::Backend(_) => {
                ErrorCategory::Network
            }
            TetherError::Config(_) => ErrorCategory::Configuration,
            TetherError::Host(_) => ErrorCategory::Host,
            TetherError::Io(_) => ErrorCategory::IoError,
        }
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Gateway liveness and identity
    Health,
    /// Spawning the gateway
    Startup,
    /// Backup sanity and mirror verification
    Backup,
    /// Object storage access
    Storage,
    /// Scheduled job registry
    Scheduling,
    /// Client/backend transport
    Network,
    /// Configuration errors
    Configuration,
    /// Sandbox host failures
    Host,
    /// I/O operation errors
    IoError,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Health => write!(f, "health"),
            ErrorCategory::Startup => write!(f, "startup"),
            ErrorCategory::Backup => write!(f, "backup"),
            ErrorCategory::Storage => write!(f, "storage"),
            ErrorCategory::Scheduling => write!(f, "scheduling"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Host => write!(f, "host"),
            ErrorCategory::IoError => write!(f, "io"),
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::Config(format!("JSON parse error: {}", err))
    }
}

impl From<toml::ser::Error> for TetherError {
    fn from(err: toml::ser::Error) -> Self {
        TetherError::Config(format!("TOML serialize error: {}", err))
    }
}

impl From<toml::de::Error> for TetherError {
    fn from(err: toml::de::Error) -> Self {
        TetherError::Config(format!("TOML parse error: {}", err))
    }
}
