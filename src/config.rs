/*!
 * Configuration types for Tether
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_host_interface::StorageCredentials;

use crate::backup::SubtreeSpec;
use crate::cron::CronSpec;
use crate::error::{Result, TetherError};

/// Environment variable carrying the gateway secret
pub const ENV_GATEWAY_TOKEN: &str = "TETHER_GATEWAY_TOKEN";
/// Environment variable overriding the gateway version tag
pub const ENV_GATEWAY_VERSION: &str = "TETHER_GATEWAY_VERSION";
pub const ENV_STORAGE_ACCESS_KEY_ID: &str = "TETHER_STORAGE_ACCESS_KEY_ID";
pub const ENV_STORAGE_SECRET_ACCESS_KEY: &str = "TETHER_STORAGE_SECRET_ACCESS_KEY";
pub const ENV_STORAGE_ENDPOINT: &str = "TETHER_STORAGE_ENDPOINT";

/// Top-level configuration, usually loaded from `tether.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub cron: CronConfig,

    #[serde(default)]
    pub sentinel: SentinelConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Desired gateway configuration. Its fingerprint decides restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Command the sandbox runs to start the gateway
    #[serde(default = "default_start_command")]
    pub start_command: String,

    /// Name of the gateway CLI binary (shared by the server and one-shot commands)
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Port the gateway serves on inside the sandbox
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Version tag; bumping it forces a restart
    #[serde(default = "default_version")]
    pub version: String,

    /// Shared secret handed to the gateway. Read from `TETHER_GATEWAY_TOKEN`.
    #[serde(default, skip_serializing)]
    pub secret: Option<String>,

    /// Name of the environment variable the gateway reads its secret from
    #[serde(default = "default_secret_env_var")]
    pub secret_env_var: String,

    /// Extra environment passed to the gateway process
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Where the fingerprint of the running gateway is persisted in the sandbox
    #[serde(default = "default_fingerprint_path")]
    pub fingerprint_path: PathBuf,

    /// Path requested by the identity probe
    #[serde(default = "default_probe_path")]
    pub probe_path: String,

    /// Body substrings proving the real gateway answered (empty = not required)
    #[serde(default)]
    pub gateway_markers: Vec<String>,

    /// Body substrings identifying a fallback stub bound to the same port
    #[serde(default = "default_stub_markers")]
    pub stub_markers: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            start_command: default_start_command(),
            binary: default_binary(),
            port: default_gateway_port(),
            version: default_version(),
            secret: None,
            secret_env_var: default_secret_env_var(),
            env: BTreeMap::new(),
            fingerprint_path: default_fingerprint_path(),
            probe_path: default_probe_path(),
            gateway_markers: Vec::new(),
            stub_markers: default_stub_markers(),
        }
    }
}

impl GatewayConfig {
    /// Environment for a freshly started gateway
    pub fn composed_env(&self) -> std::collections::HashMap<String, String> {
        let mut env: std::collections::HashMap<String, String> =
            self.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        if let Some(ref secret) = self.secret {
            env.insert(self.secret_env_var.clone(), secret.clone());
        }
        env.insert("GATEWAY_PORT".to_string(), self.port.to_string());
        env
    }
}

/// Timeouts governing the supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Full startup budget. Also used when re-probing an existing process.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Budget for a single identity probe request
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Idle health checks never restart a gateway younger than this
    #[serde(default = "default_health_grace_ms")]
    pub health_grace_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: default_startup_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            health_grace_ms: default_health_grace_ms(),
        }
    }
}

impl SupervisorConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn health_grace(&self) -> Duration {
        Duration::from_millis(self.health_grace_ms)
    }
}

/// Edge proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address the edge server binds to
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Reconnect attempts after an unexpected backend close
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,

    /// Base delay; attempt `n` waits `n * reconnect_delay_ms`
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Interval between status notifications while the backend starts
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,

    /// A backend that stays up this long resets the attempt counter
    #[serde(default = "default_stable_after_ms")]
    pub stable_after_ms: u64,

    /// Path on the gateway the WebSocket connects to
    #[serde(default = "default_backend_path")]
    pub backend_path: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_reconnects: default_max_reconnects(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            status_interval_ms: default_status_interval_ms(),
            stable_after_ms: default_stable_after_ms(),
            backend_path: default_backend_path(),
        }
    }
}

/// Durable backup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bucket name in object storage
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Where the bucket is mounted inside the sandbox
    #[serde(default = "default_mount_path")]
    pub mount_path: PathBuf,

    /// Root of the gateway state tree
    #[serde(default = "default_source_root")]
    pub source_root: PathBuf,

    /// File under `source_root` that must exist before anything is mirrored
    #[serde(default = "default_required_marker")]
    pub required_marker: PathBuf,

    /// Subtrees mirrored to the bucket
    #[serde(default = "default_subtrees")]
    pub subtrees: Vec<SubtreeSpec>,

    /// rsync exclude patterns for transient files
    #[serde(default = "default_excludes")]
    pub excludes: Vec<String>,

    /// Timestamp marker written at the bucket root after a mirror
    #[serde(default = "default_sync_marker")]
    pub marker_file: String,

    /// Budget for the mirror command
    #[serde(default = "default_exec_timeout_ms")]
    pub exec_timeout_ms: u64,

    /// Read from `TETHER_STORAGE_*`
    #[serde(default, skip_serializing)]
    pub credentials: Option<StorageCredentials>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bucket: default_bucket(),
            mount_path: default_mount_path(),
            source_root: default_source_root(),
            required_marker: default_required_marker(),
            subtrees: default_subtrees(),
            excludes: default_excludes(),
            marker_file: default_sync_marker(),
            exec_timeout_ms: default_exec_timeout_ms(),
            credentials: None,
        }
    }
}

impl BackupConfig {
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }

    pub fn marker_path(&self) -> PathBuf {
        self.mount_path.join(&self.marker_file)
    }
}

/// Scheduled job reconciliation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Last-known-good job store snapshot (usually inside the backup)
    #[serde(default = "default_cron_snapshot")]
    pub snapshot_path: PathBuf,

    /// Live job store the gateway reads on start
    #[serde(default = "default_cron_store")]
    pub store_path: PathBuf,

    #[serde(default = "default_exec_timeout_ms")]
    pub exec_timeout_ms: u64,

    /// Desired jobs
    #[serde(default)]
    pub jobs: Vec<CronSpec>,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            snapshot_path: default_cron_snapshot(),
            store_path: default_cron_store(),
            exec_timeout_ms: default_exec_timeout_ms(),
            jobs: Vec::new(),
        }
    }
}

impl CronConfig {
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }
}

/// Background tick intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelConfig {
    #[serde(default = "default_backup_interval_s")]
    pub backup_interval_s: u64,

    #[serde(default = "default_cron_interval_s")]
    pub cron_interval_s: u64,

    #[serde(default = "default_health_interval_s")]
    pub health_interval_s: u64,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            backup_interval_s: default_backup_interval_s(),
            cron_interval_s: default_cron_interval_s(),
            health_interval_s: default_health_interval_s(),
        }
    }
}

/// Logging output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level for diagnostic output
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for level = debug)
    #[serde(default)]
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_start_command() -> String {
    "/usr/local/bin/start-agentd.sh".to_string()
}

fn default_binary() -> String {
    "agentd".to_string()
}

fn default_gateway_port() -> u16 {
    18789
}

fn default_version() -> String {
    "1".to_string()
}

fn default_secret_env_var() -> String {
    "GATEWAY_TOKEN".to_string()
}

fn default_fingerprint_path() -> PathBuf {
    PathBuf::from("/root/.tether/fingerprint")
}

fn default_probe_path() -> String {
    "/".to_string()
}

fn default_stub_markers() -> Vec<String> {
    vec!["fallback-server".to_string()]
}

fn default_startup_timeout_ms() -> u64 {
    180_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_health_grace_ms() -> u64 {
    120_000
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_reconnects() -> u32 {
    5
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_status_interval_ms() -> u64 {
    3_000
}

fn default_stable_after_ms() -> u64 {
    60_000
}

fn default_backend_path() -> String {
    "/".to_string()
}

fn default_bucket() -> String {
    "gateway-data".to_string()
}

fn default_mount_path() -> PathBuf {
    PathBuf::from("/data/backup")
}

fn default_source_root() -> PathBuf {
    PathBuf::from("/root/.agentd")
}

fn default_required_marker() -> PathBuf {
    PathBuf::from("agentd.json")
}

fn default_subtrees() -> Vec<SubtreeSpec> {
    vec![
        SubtreeSpec::new(".", "agentd"),
        SubtreeSpec::new("/root/workspace", "workspace").optional(),
    ]
}

fn default_excludes() -> Vec<String> {
    vec![
        "*.lock".to_string(),
        "*.log".to_string(),
        "*.tmp".to_string(),
        ".git".to_string(),
    ]
}

fn default_sync_marker() -> String {
    ".last-sync".to_string()
}

fn default_exec_timeout_ms() -> u64 {
    120_000
}

fn default_cron_snapshot() -> PathBuf {
    PathBuf::from("/data/backup/agentd/cron/jobs.json")
}

fn default_cron_store() -> PathBuf {
    PathBuf::from("/root/.agentd/cron/jobs.json")
}

fn default_backup_interval_s() -> u64 {
    300
}

fn default_cron_interval_s() -> u64 {
    600
}

fn default_health_interval_s() -> u64 {
    60
}

impl TetherConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TetherError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: TetherConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file. Secrets are never written.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| TetherError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Default config location (`$XDG_CONFIG_HOME/tether/tether.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tether").join("tether.toml"))
    }

    /// Load from `path`, the default location, or fall back to defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match Self::default_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Pull secrets and deployment-specific values from the environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup(ENV_GATEWAY_TOKEN).filter(|t| !t.is_empty()) {
            self.gateway.secret = Some(token);
        }
        if let Some(version) = lookup(ENV_GATEWAY_VERSION).filter(|v| !v.is_empty()) {
            self.gateway.version = version;
        }

        let key_id = lookup(ENV_STORAGE_ACCESS_KEY_ID).filter(|v| !v.is_empty());
        let secret = lookup(ENV_STORAGE_SECRET_ACCESS_KEY).filter(|v| !v.is_empty());
        if let (Some(access_key_id), Some(secret_access_key)) = (key_id, secret) {
            self.backup.credentials = Some(StorageCredentials {
                access_key_id,
                secret_access_key,
                endpoint: lookup(ENV_STORAGE_ENDPOINT).filter(|v| !v.is_empty()),
            });
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.gateway.start_command.trim().is_empty() {
            return Err(TetherError::Config(
                "gateway.start_command must not be empty".to_string(),
            ));
        }
        if self.gateway.port == 0 {
            return Err(TetherError::Config("gateway.port must be set".to_string()));
        }
        if self.supervisor.startup_timeout_ms == 0 {
            return Err(TetherError::Config(
                "supervisor.startup_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.proxy.reconnect_delay_ms == 0 {
            return Err(TetherError::Config(
                "proxy.reconnect_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.proxy.status_interval_ms == 0 {
            return Err(TetherError::Config(
                "proxy.status_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.backup.enabled && self.backup.subtrees.is_empty() {
            return Err(TetherError::Config(
                "backup.subtrees must list at least one subtree".to_string(),
            ));
        }
        for job in &self.cron.jobs {
            if job.name.trim().is_empty() {
                return Err(TetherError::Config(
                    "cron.jobs entries need a name".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = TetherConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.gateway.port, 18789);
        assert_eq!(config.proxy.max_reconnects, 5);
        assert_eq!(config.supervisor.startup_timeout(), Duration::from_secs(180));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[gateway]
version = "2026.1"
port = 9000

[proxy]
max_reconnects = 2

[[cron.jobs]]
name = "auto-study"
interval = "6h"
message = "study the notes"
model = "small"
"#;
        let config: TetherConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.gateway.version, "2026.1");
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.binary, "agentd");
        assert_eq!(config.proxy.max_reconnects, 2);
        assert_eq!(config.proxy.reconnect_delay_ms, 1_000);
        assert_eq!(config.cron.jobs.len(), 1);
        assert_eq!(config.cron.jobs[0].name, "auto-study");
        assert!(config.backup.enabled);
    }

    #[test]
    fn test_secrets_are_not_serialized() {
        let mut config = TetherConfig::default();
        config.gateway.secret = Some("hunter2".to_string());
        let rendered = toml::to_string(&config).unwrap();
        assert!(!rendered.contains("hunter2"));

        let back: TetherConfig = toml::from_str(&rendered).unwrap();
        assert!(back.gateway.secret.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_GATEWAY_TOKEN, "tok"),
            (ENV_STORAGE_ACCESS_KEY_ID, "id"),
            (ENV_STORAGE_SECRET_ACCESS_KEY, "secret"),
            (ENV_STORAGE_ENDPOINT, "https://storage.example"),
        ]
        .into_iter()
        .collect();

        let mut config = TetherConfig::default();
        config.apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.gateway.secret.as_deref(), Some("tok"));
        let creds = config.backup.credentials.unwrap();
        assert_eq!(creds.access_key_id, "id");
        assert_eq!(creds.endpoint.as_deref(), Some("https://storage.example"));
    }

    #[test]
    fn test_partial_storage_env_leaves_credentials_unset() {
        let mut config = TetherConfig::default();
        config.apply_overrides_from(|k| (k == ENV_STORAGE_ACCESS_KEY_ID).then(|| "id".to_string()));
        assert!(config.backup.credentials.is_none());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = TetherConfig::default();
        config.gateway.start_command = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = TetherConfig::default();
        config.proxy.reconnect_delay_ms = 0;
        assert!(config.validate().is_err());

        let mut config = TetherConfig::default();
        config.proxy.status_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_composed_env_includes_secret() {
        let mut gateway = GatewayConfig::default();
        gateway.secret = Some("tok".to_string());
        gateway.env.insert("NODE_ENV".to_string(), "production".to_string());

        let env = gateway.composed_env();
        assert_eq!(env.get("GATEWAY_TOKEN").map(String::as_str), Some("tok"));
        assert_eq!(env.get("NODE_ENV").map(String::as_str), Some("production"));
        assert_eq!(env.get("GATEWAY_PORT").map(String::as_str), Some("18789"));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.toml");
        let mut config = TetherConfig::default();
        config.gateway.version = "7".to_string();
        config.to_file(&path).unwrap();

        let loaded = TetherConfig::from_file(&path).unwrap();
        assert_eq!(loaded.gateway.version, "7");
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_tracing_level(), tracing::Level::ERROR);
        assert_eq!(LogLevel::Debug.to_tracing_level(), tracing::Level::DEBUG);
    }
}
