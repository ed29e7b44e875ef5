//! Retention sweep for driver session logs.
//!
//! Logs live at `<log_dir>/<device_id>/<request_id>.log`. Files untouched
//! for longer than the retention period are deleted, and device
//! directories left empty go with them.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::config::LogRetentionConfig;

/// Counts from one retention sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSweepStats {
    pub removed_files: usize,
    pub removed_dirs: usize,
}

pub struct LogJanitor {
    log_dir: PathBuf,
    config: LogRetentionConfig,
}

impl LogJanitor {
    pub fn new(log_dir: PathBuf, config: LogRetentionConfig) -> Self {
        Self { log_dir, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            log_dir = %self.log_dir.display(),
            retention_secs = self.config.retention.as_secs(),
            interval_secs = self.config.sweep_interval.as_secs(),
            "Starting log retention worker"
        );

        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sweep(SystemTime::now()).await {
                        Ok(stats) if stats.removed_files > 0 => {
                            info!(
                                removed_files = stats.removed_files,
                                removed_dirs = stats.removed_dirs,
                                "Removed expired driver logs"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Driver log sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Log retention worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Delete logs older than the retention period as of `now`.
    pub async fn sweep(&self, now: SystemTime) -> Result<LogSweepStats> {
        let mut stats = LogSweepStats::default();
        let mut devices = match tokio::fs::read_dir(&self.log_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(stats),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read log directory {}", self.log_dir.display())
                })
            }
        };

        while let Some(entry) = devices.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match self.sweep_device_dir(&path, now).await {
                Ok((files, emptied)) => {
                    stats.removed_files += files;
                    if emptied {
                        stats.removed_dirs += 1;
                    }
                }
                Err(e) => warn!(dir = %path.display(), error = %e, "Failed to sweep device logs"),
            }
        }

        Ok(stats)
    }

    /// Returns the number of files removed and whether the directory was
    /// removed too.
    async fn sweep_device_dir(&self, dir: &Path, now: SystemTime) -> Result<(usize, bool)> {
        let mut removed = 0;
        let mut kept = 0;
        let mut files = tokio::fs::read_dir(dir).await?;

        while let Some(entry) = files.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                kept += 1;
                continue;
            }
            let expired = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age >= self.config.retention);
            if !expired {
                kept += 1;
                continue;
            }

            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(file = %entry.path().display(), error = %e, "Failed to remove driver log");
                    kept += 1;
                }
            }
        }

        if kept > 0 {
            return Ok((removed, false));
        }
        // A driver starting right now may have recreated the directory.
        match tokio::fs::remove_dir(dir).await {
            Ok(()) => Ok((removed, true)),
            Err(_) => Ok((removed, false)),
        }
    }
}
