//! Tether Host Interface: Sandbox Host Abstraction
//!
//! This crate defines the `SandboxHost` trait, which abstracts every operation
//! Tether performs against the ephemeral sandbox that hosts the gateway:
//!
//! 1. **Process table**: list, start, inspect, kill, wait for a port, read logs
//! 2. **Shell**: one-shot command execution with captured output
//! 3. **Filesystem**: existence checks, small file reads and writes
//! 4. **Storage**: mounting an object-storage bucket at a local path
//! 5. **Loopback HTTP**: probing a port from inside the sandbox
//!
//! The host owns process state. Callers hold [`ProcessHandle`]s, which are
//! snapshots plus a reference back to the host; the only mutation a caller can
//! request is [`ProcessHandle::kill`].
//!
//! # Example
//!
//! ```rust,no_run
//! use tether_host_interface::{ProcessStatus, SandboxHost};
//!
//! async fn count_running(host: &dyn SandboxHost) -> tether_host_interface::Result<usize> {
//!     let procs = host.list_processes().await?;
//!     Ok(procs
//!         .iter()
//!         .filter(|p| p.status == ProcessStatus::Running)
//!         .count())
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("Process not found: {0}")]
    ProcessNotFound(ProcessId),

    #[error("Failed to spawn '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("Port {port} did not open within {timeout:?}")]
    PortTimeout { port: u16, timeout: Duration },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Bucket mount failed: {0}")]
    Mount(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Host error: {0}")]
    System(String),
}

pub type Result<T> = std::result::Result<T, HostError>;

/// Identifier the host assigns to a tracked process
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(String);

impl ProcessId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProcessId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle status as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Completed,
    Failed,
}

impl ProcessStatus {
    /// `true` for `Starting` and `Running`
    pub fn is_alive(&self) -> bool {
        matches!(self, ProcessStatus::Starting | ProcessStatus::Running)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Starting => write!(f, "starting"),
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Completed => write!(f, "completed"),
            ProcessStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Snapshot of one row in the host's process table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub id: ProcessId,
    /// Full command line as the host reports it
    pub command: String,
    pub status: ProcessStatus,
    pub start_time: SystemTime,
    pub exit_code: Option<i32>,
}

/// Captured output streams of a process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessLogs {
    pub stdout: String,
    pub stderr: String,
}

/// Result of a one-shot shell command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` when the host could not report an exit status
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Whether the host reported a zero exit status.
    ///
    /// Some mounts do not propagate exit codes reliably; callers that need
    /// ground truth must verify side effects independently.
    pub fn reported_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout and stderr joined for diagnostics
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (true, true) => String::new(),
            (false, true) => self.stdout.trim().to_string(),
            (true, false) => self.stderr.trim().to_string(),
            (false, false) => format!("{}\n{}", self.stdout.trim(), self.stderr.trim()),
        }
    }
}

/// Response of a loopback HTTP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Object storage credentials for a bucket mount
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    /// S3-compatible endpoint URL
    pub endpoint: Option<String>,
}

impl fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// The sandbox host seen from Tether
///
/// Implementations must be `Send + Sync + 'static`; one host instance is shared
/// by every supervisor call, proxy session and background tick.
#[async_trait]
pub trait SandboxHost: Send + Sync + 'static {
    // ═══════════════════════════════════════════════════════════════════════
    // 1. Process Table
    // ═══════════════════════════════════════════════════════════════════════

    /// List every process the host tracks, in any status
    async fn list_processes(&self) -> Result<Vec<ProcessInfo>>;

    /// Start a long-running process
    ///
    /// # Errors
    ///
    /// Returns `HostError::SpawnFailed` if the host refuses to start it.
    async fn start_process(
        &self,
        command: &str,
        env: &HashMap<String, String>,
    ) -> Result<ProcessInfo>;

    /// Current snapshot of one process
    async fn process(&self, id: &ProcessId) -> Result<ProcessInfo>;

    /// Terminate a process. The process may already be gone.
    async fn kill_process(&self, id: &ProcessId) -> Result<()>;

    /// Wait until `port` accepts TCP connections on behalf of `id`
    ///
    /// # Errors
    ///
    /// Returns `HostError::PortTimeout` when the budget elapses, or an error
    /// if the process exits first.
    async fn wait_for_port(&self, id: &ProcessId, port: u16, timeout: Duration) -> Result<()>;

    /// Captured stdout/stderr of a process
    async fn process_logs(&self, id: &ProcessId) -> Result<ProcessLogs>;

    // ═══════════════════════════════════════════════════════════════════════
    // 2. Shell
    // ═══════════════════════════════════════════════════════════════════════

    /// Run a shell command to completion
    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput>;

    // ═══════════════════════════════════════════════════════════════════════
    // 3. Filesystem
    // ═══════════════════════════════════════════════════════════════════════

    async fn exists(&self, path: &Path) -> bool;

    /// Read a small text file. `Ok(None)` when it does not exist.
    async fn read_file(&self, path: &Path) -> Result<Option<String>>;

    /// Create or truncate a file, creating parent directories as needed
    async fn write_file(&self, path: &Path, contents: &str) -> Result<()>;

    // ═══════════════════════════════════════════════════════════════════════
    // 4. Storage
    // ═══════════════════════════════════════════════════════════════════════

    /// Mount `bucket` at `path`. Must be idempotent.
    async fn mount_bucket(
        &self,
        bucket: &str,
        path: &Path,
        credentials: &StorageCredentials,
    ) -> Result<()>;

    // ═══════════════════════════════════════════════════════════════════════
    // 5. Loopback HTTP
    // ═══════════════════════════════════════════════════════════════════════

    /// GET `http://127.0.0.1:{port}{path}` from inside the sandbox
    async fn http_get(&self, port: u16, path: &str, timeout: Duration) -> Result<HttpResponse>;
}

/// A tracked process plus the host that owns it
///
/// Cloning a handle clones the snapshot; it never duplicates the process.
#[derive(Clone)]
pub struct ProcessHandle {
    info: ProcessInfo,
    host: Arc<dyn SandboxHost>,
}

impl ProcessHandle {
    pub fn new(info: ProcessInfo, host: Arc<dyn SandboxHost>) -> Self {
        Self { info, host }
    }

    pub fn id(&self) -> &ProcessId {
        &self.info.id
    }

    pub fn command(&self) -> &str {
        &self.info.command
    }

    /// Status as of the last snapshot. Call [`refresh`](Self::refresh) for a live value.
    pub fn status(&self) -> ProcessStatus {
        self.info.status
    }

    pub fn start_time(&self) -> SystemTime {
        self.info.start_time
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.info.exit_code
    }

    pub fn info(&self) -> &ProcessInfo {
        &self.info
    }

    pub fn host(&self) -> &Arc<dyn SandboxHost> {
        &self.host
    }

    /// Re-read this process from the host and update the snapshot
    pub async fn refresh(&mut self) -> Result<&ProcessInfo> {
        self.info = self.host.process(&self.info.id).await?;
        Ok(&self.info)
    }

    pub async fn kill(&self) -> Result<()> {
        self.host.kill_process(&self.info.id).await
    }

    pub async fn wait_for_port(&self, port: u16, timeout: Duration) -> Result<()> {
        self.host.wait_for_port(&self.info.id, port, timeout).await
    }

    pub async fn logs(&self) -> Result<ProcessLogs> {
        self.host.process_logs(&self.info.id).await
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alive_statuses() {
        assert!(ProcessStatus::Starting.is_alive());
        assert!(ProcessStatus::Running.is_alive());
        assert!(!ProcessStatus::Completed.is_alive());
        assert!(!ProcessStatus::Failed.is_alive());
    }

    #[test]
    fn test_exec_output_combined() {
        let out = ExecOutput {
            exit_code: Some(1),
            stdout: "copied 3 files\n".to_string(),
            stderr: "rsync: warning\n".to_string(),
        };
        assert!(!out.reported_success());
        assert_eq!(out.combined(), "copied 3 files\nrsync: warning");

        assert!(ExecOutput::ok("").reported_success());
        assert_eq!(ExecOutput::ok("  ").combined(), "");
    }

    #[test]
    fn test_unknown_exit_code_is_not_success() {
        let out = ExecOutput {
            exit_code: None,
            ..Default::default()
        };
        assert!(!out.reported_success());
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = StorageCredentials {
            access_key_id: "AKIA123".to_string(),
            secret_access_key: "super-secret".to_string(),
            endpoint: None,
        };
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("AKIA123"));
        assert!(!rendered.contains("super-secret"));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(ProcessStatus::Running.to_string(), "running");
        assert_eq!(ProcessId::from("proc-1").as_str(), "proc-1");
    }
}
