//! Config fingerprint: detects drift that requires a gateway restart

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tether_host_interface::SandboxHost;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::error::Result;

/// Hex characters of the secret hash kept in the fingerprint
const SECRET_HASH_LEN: usize = 16;

/// Reads and writes the fingerprint file inside the sandbox
pub struct FingerprintTracker {
    host: Arc<dyn SandboxHost>,
    path: PathBuf,
}

impl FingerprintTracker {
    pub fn new(host: Arc<dyn SandboxHost>, path: impl Into<PathBuf>) -> Self {
        Self {
            host,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `{version}-{first 16 hex chars of sha256(secret)}`
    ///
    /// An unset secret hashes as the empty string, so setting one later is
    /// still drift.
    pub fn compute(config: &GatewayConfig) -> String {
        let secret = config.secret.as_deref().unwrap_or("");
        let digest = Sha256::digest(secret.as_bytes());
        let hash = hex::encode(digest);
        format!("{}-{}", config.version, &hash[..SECRET_HASH_LEN])
    }

    /// Stored fingerprint, or `None` if the file is absent or unreadable
    pub async fn stored(&self) -> Option<String> {
        match self.host.read_file(&self.path).await {
            Ok(Some(contents)) => {
                let trimmed = contents.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            Ok(None) => None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Could not read fingerprint");
                None
            }
        }
    }

    /// Absent stored fingerprint counts as a mismatch
    pub async fn matches(&self, desired: &str) -> bool {
        self.stored().await.as_deref() == Some(desired)
    }

    pub async fn persist(&self, fingerprint: &str) -> Result<()> {
        self.host.write_file(&self.path, fingerprint).await?;
        debug!(path = %self.path.display(), fingerprint, "Persisted gateway fingerprint");
        Ok(())
    }

    /// Put back the value seen before a claim; an empty file reads as absent
    pub async fn restore(&self, previous: Option<&str>) -> Result<()> {
        self.host
            .write_file(&self.path, previous.unwrap_or(""))
            .await?;
        debug!(path = %self.path.display(), previous = ?previous, "Restored gateway fingerprint");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::MockHost;

    fn gateway(version: &str, secret: Option<&str>) -> GatewayConfig {
        GatewayConfig {
            version: version.to_string(),
            secret: secret.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_compute_shape() {
        let fp = FingerprintTracker::compute(&gateway("2026.3", Some("tok")));
        let (version, hash) = fp.split_once('-').unwrap();
        assert_eq!(version, "2026.3");
        assert_eq!(hash.len(), SECRET_HASH_LEN);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_compute_detects_drift() {
        let base = FingerprintTracker::compute(&gateway("1", Some("a")));
        assert_eq!(base, FingerprintTracker::compute(&gateway("1", Some("a"))));
        assert_ne!(base, FingerprintTracker::compute(&gateway("1", Some("b"))));
        assert_ne!(base, FingerprintTracker::compute(&gateway("2", Some("a"))));
        assert_ne!(base, FingerprintTracker::compute(&gateway("1", None)));
    }

    #[test]
    fn test_secret_not_leaked() {
        let fp = FingerprintTracker::compute(&gateway("1", Some("super-secret-token")));
        assert!(!fp.contains("super-secret-token"));
    }

    #[tokio::test]
    async fn test_absent_file_is_mismatch() {
        let host = Arc::new(MockHost::new());
        let tracker = FingerprintTracker::new(host, "/root/.tether/fingerprint");
        assert_eq!(tracker.stored().await, None);
        assert!(!tracker.matches("1-abc").await);
    }

    #[tokio::test]
    async fn test_restore_to_absent() {
        let host = Arc::new(MockHost::new());
        let tracker = FingerprintTracker::new(host.clone(), "/root/.tether/fingerprint");

        tracker.persist("2-abc").await.unwrap();
        tracker.restore(None).await.unwrap();
        assert_eq!(tracker.stored().await, None);

        tracker.restore(Some("1-abc")).await.unwrap();
        assert!(tracker.matches("1-abc").await);
    }

    #[tokio::test]
    async fn test_persist_then_match() {
        let host = Arc::new(MockHost::new());
        let tracker = FingerprintTracker::new(host.clone(), "/root/.tether/fingerprint");
        tracker.persist("1-abc").await.unwrap();
        assert!(tracker.matches("1-abc").await);
        assert!(!tracker.matches("2-abc").await);

        host.add_file("/root/.tether/fingerprint", "1-abc\n");
        assert!(tracker.matches("1-abc").await);
    }
}
