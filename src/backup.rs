//! Durable Backup Synchronizer
//!
//! Mirrors gateway state into a mounted object-storage bucket. The mount does
//! not reliably propagate exit codes or timestamps, so a mirror is only
//! counted as successful once a freshly written marker is read back from the
//! destination.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tether_host_interface::{SandboxHost, StorageCredentials};
use tracing::{debug, info, warn};

use crate::config::BackupConfig;
use crate::error::{Result, TetherError};
use crate::shell;

/// One directory mirrored into the bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtreeSpec {
    /// Absolute, or relative to the backup source root (`.` is the root itself)
    pub source: PathBuf,

    /// Directory under the mount point
    pub dest: PathBuf,

    /// Skip quietly when the source directory does not exist
    #[serde(default)]
    pub optional: bool,
}

impl SubtreeSpec {
    pub fn new(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn source_path(&self, source_root: &Path) -> PathBuf {
        if self.source == Path::new(".") {
            source_root.to_path_buf()
        } else if self.source.is_absolute() {
            self.source.clone()
        } else {
            source_root.join(&self.source)
        }
    }

    pub fn dest_path(&self, mount_path: &Path) -> PathBuf {
        mount_path.join(&self.dest)
    }
}

/// Why a sync did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncErrorKind {
    /// The required marker is missing from the source; nothing was written
    SourceIncomplete,
    /// The mirror failed or its marker could not be confirmed
    SyncFailed,
}

/// Outcome of one sync pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub success: bool,
    /// Marker value confirmed at the destination
    pub last_sync: Option<String>,
    pub error: Option<SyncErrorKind>,
    /// Captured command output or other diagnostics
    pub details: Option<String>,
}

impl SyncResult {
    fn succeeded(timestamp: String) -> Self {
        Self {
            success: true,
            last_sync: Some(timestamp),
            error: None,
            details: None,
        }
    }

    fn failed(kind: SyncErrorKind, details: impl Into<String>) -> Self {
        let details = details.into();
        Self {
            success: false,
            last_sync: None,
            error: Some(kind),
            details: if details.is_empty() { None } else { Some(details) },
        }
    }

    /// Convert a failed result into the matching error
    pub fn into_result(self, source_marker: &Path) -> Result<String> {
        match (self.success, self.error) {
            (true, _) => Ok(self.last_sync.unwrap_or_default()),
            (false, Some(SyncErrorKind::SourceIncomplete)) => {
                Err(TetherError::SourceIncomplete(source_marker.to_path_buf()))
            }
            (false, _) => Err(TetherError::SyncFailed(
                self.details.unwrap_or_else(|| "no details".to_string()),
            )),
        }
    }
}

pub struct BackupSynchronizer {
    host: Arc<dyn SandboxHost>,
    config: BackupConfig,
}

impl BackupSynchronizer {
    pub fn new(host: Arc<dyn SandboxHost>, config: BackupConfig) -> Self {
        Self { host, config }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Path of the file that proves the source tree is complete
    pub fn source_marker(&self) -> PathBuf {
        self.config.source_root.join(&self.config.required_marker)
    }

    fn credentials(&self) -> Result<&StorageCredentials> {
        self.config.credentials.as_ref().ok_or_else(|| {
            TetherError::MissingCredentials(format!(
                "{} / {}",
                crate::config::ENV_STORAGE_ACCESS_KEY_ID,
                crate::config::ENV_STORAGE_SECRET_ACCESS_KEY
            ))
        })
    }

    async fn ensure_mounted(&self) -> Result<()> {
        let credentials = self.credentials()?;
        self.host
            .mount_bucket(&self.config.bucket, &self.config.mount_path, credentials)
            .await
            .map_err(|e| TetherError::StorageUnavailable(e.to_string()))
    }

    /// Mirror the source tree into the bucket and confirm it landed
    pub async fn sync(&self) -> Result<SyncResult> {
        self.ensure_mounted().await?;

        let source_marker = self.source_marker();
        if !self.host.exists(&source_marker).await {
            warn!(marker = %source_marker.display(), "Source incomplete, leaving previous backup untouched");
            return Ok(SyncResult::failed(
                SyncErrorKind::SourceIncomplete,
                format!("{} not found", source_marker.display()),
            ));
        }

        let command = self.mirror_command();
        debug!(command = %command, "Mirroring to bucket");

        let output = match self.host.exec(&command, self.config.exec_timeout()).await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "Mirror command did not complete");
                return Ok(SyncResult::failed(SyncErrorKind::SyncFailed, e.to_string()));
            }
        };

        // Zero is not trusted, but a reported failure is believed
        if let Some(code) = output.exit_code.filter(|c| *c != 0) {
            warn!(exit_code = code, "Mirror command failed");
            return Ok(SyncResult::failed(
                SyncErrorKind::SyncFailed,
                format!("mirror exited with {}: {}", code, output.combined()),
            ));
        }

        let marker = self.config.marker_path();
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        if let Err(e) = self.host.write_file(&marker, &timestamp).await {
            return Ok(SyncResult::failed(
                SyncErrorKind::SyncFailed,
                format!("could not write {}: {}\n{}", marker.display(), e, output.combined()),
            ));
        }

        let confirmed = match self.host.read_file(&marker).await {
            Ok(Some(value)) => value.trim() == timestamp,
            Ok(None) => false,
            Err(e) => {
                debug!(error = %e, "Marker read-back failed");
                false
            }
        };

        if confirmed {
            info!(last_sync = %timestamp, "Backup sync confirmed");
            Ok(SyncResult::succeeded(timestamp))
        } else {
            warn!(marker = %marker.display(), "Backup marker not confirmed after mirror");
            Ok(SyncResult::failed(
                SyncErrorKind::SyncFailed,
                format!(
                    "marker {} was not confirmed\n{}",
                    marker.display(),
                    output.combined()
                ),
            ))
        }
    }

    /// Timestamp of the last confirmed sync, if any
    pub async fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        let raw = self.host.read_file(&self.config.marker_path()).await?;
        Ok(raw.and_then(|value| match DateTime::parse_from_rfc3339(value.trim()) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(e) => {
                warn!(value = %value.trim(), error = %e, "Unreadable sync marker");
                None
            }
        }))
    }

    /// Copy the backup back into an empty source tree
    ///
    /// Only runs when the backup has a marker and the source lacks its
    /// required file. Returns whether anything was restored.
    pub async fn restore(&self) -> Result<bool> {
        self.ensure_mounted().await?;

        let source_marker = self.source_marker();
        if self.host.exists(&source_marker).await {
            debug!("Source tree present, no restore needed");
            return Ok(false);
        }
        if !self.host.exists(&self.config.marker_path()).await {
            info!("No confirmed backup to restore from");
            return Ok(false);
        }

        let command = self.restore_command();
        let output = self.host.exec(&command, self.config.exec_timeout()).await?;
        if let Some(code) = output.exit_code.filter(|c| *c != 0) {
            return Err(TetherError::SyncFailed(format!(
                "restore exited with {}: {}",
                code,
                output.combined()
            )));
        }

        if !self.host.exists(&source_marker).await {
            return Err(TetherError::SyncFailed(format!(
                "restore finished but {} is still missing\n{}",
                source_marker.display(),
                output.combined()
            )));
        }

        info!(source = %self.config.source_root.display(), "Restored gateway state from backup");
        Ok(true)
    }

    fn exclude_flags(&self) -> String {
        self.config
            .excludes
            .iter()
            .map(|pattern| format!("--exclude={}", shell::quote(pattern)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// One shell invocation mirroring every subtree, stopping at the first failure
    pub fn mirror_command(&self) -> String {
        let excludes = self.exclude_flags();
        let steps = self.config.subtrees.iter().map(|subtree| {
            let src = subtree.source_path(&self.config.source_root);
            let dest = subtree.dest_path(&self.config.mount_path);
            copy_step(&src, &dest, &excludes, true, subtree.optional)
        });
        shell::chain_strict(steps)
    }

    fn restore_command(&self) -> String {
        let excludes = self.exclude_flags();
        let steps = self.config.subtrees.iter().map(|subtree| {
            let src = subtree.dest_path(&self.config.mount_path);
            let dest = subtree.source_path(&self.config.source_root);
            copy_step(&src, &dest, &excludes, false, true)
        });
        shell::chain_strict(steps)
    }
}

fn copy_step(src: &Path, dest: &Path, excludes: &str, delete: bool, optional: bool) -> String {
    let mut rsync = String::from("rsync -r --no-times");
    if delete {
        rsync.push_str(" --delete");
    }
    if !excludes.is_empty() {
        rsync.push(' ');
        rsync.push_str(excludes);
    }

    let copy = format!(
        "mkdir -p {dest} && {rsync} {src_slash} {dest_slash}",
        dest = shell::quote_path(dest, false),
        rsync = rsync,
        src_slash = shell::quote_path(src, true),
        dest_slash = shell::quote_path(dest, true),
    );

    if optional {
        format!(
            "{{ if [ -d {src} ]; then {copy}; fi; }}",
            src = shell::quote_path(src, false),
            copy = copy
        )
    } else {
        copy
    }
}
