// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-run lock
//!
//! The lock file records `{pid, acquired_at, step}`. A lock whose process is
//! gone, or which is older than [`MAX_LOCK_AGE_SECS`], is stale and replaced.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, Result};

/// Locks older than this are stale even if the PID is alive (PID reuse)
pub const MAX_LOCK_AGE_SECS: i64 = 3600;

/// Lock file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    /// Last step the holder reported
    pub step: String,
}

impl LockInfo {
    fn new(step: &str) -> Self {
        Self {
            pid: process::id(),
            acquired_at: Utc::now(),
            step: step.to_string(),
        }
    }

    pub fn age(&self) -> Duration {
        Utc::now().signed_duration_since(self.acquired_at)
    }

    fn is_stale(&self) -> bool {
        self.age().num_seconds() > MAX_LOCK_AGE_SECS || !process_exists(self.pid)
    }
}

fn process_exists(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Take the lock at `path`, replacing a stale one
    pub fn acquire<P: AsRef<Path>>(path: P, step: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        if let Some(holder) = read_lock(&path)? {
            if holder.is_stale() {
                warn!(
                    pid = holder.pid,
                    age_secs = holder.age().num_seconds(),
                    step = %holder.step,
                    "Replacing stale provisioning lock"
                );
                remove_if_exists(&path)?;
            } else {
                return Err(ProvisionError::AlreadyRunning {
                    pid: holder.pid,
                    age_secs: holder.age().num_seconds().max(0) as u64,
                });
            }
        }

        let info = LockInfo::new(step);
        let content = serde_json::to_string_pretty(&info)?;
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Lost a race with another run starting at the same moment
                let pid = read_lock(&path)?.map(|h| h.pid).unwrap_or_default();
                return Err(ProvisionError::AlreadyRunning { pid, age_secs: 0 });
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(content.as_bytes())?;
        file.sync_all()?;

        info!(path = %path.display(), pid = info.pid, "Provisioning lock acquired");
        Ok(Self { path })
    }

    /// Record the step currently running
    pub fn update_step(&self, step: &str) -> Result<()> {
        if let Some(mut info) = read_lock(&self.path)? {
            if info.pid == process::id() {
                info.step = step.to_string();
                fs::write(&self.path, serde_json::to_string_pretty(&info)?)?;
            }
        }
        Ok(())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let ours = matches!(read_lock(&self.path), Ok(Some(info)) if info.pid == process::id());
        if ours {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to release provisioning lock");
            } else {
                debug!(path = %self.path.display(), "Provisioning lock released");
            }
        }
    }
}

/// Current holder, `None` when there is no lock. A corrupt lock file is
/// reported as a dead holder so it gets replaced.
fn read_lock(path: &Path) -> Result<Option<LockInfo>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_str::<LockInfo>(&content) {
        Ok(info) => Ok(Some(info)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt provisioning lock");
            Ok(Some(LockInfo {
                pid: 0,
                acquired_at: DateTime::<Utc>::MIN_UTC,
                step: String::new(),
            }))
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
