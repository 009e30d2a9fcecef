//! One run per environment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

use pipeline_core::{Error, Result, RunKey};

const LOCK_FILE: &str = ".run.lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockOwner {
    run: RunKey,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Whether a process with `pid` exists, when the platform can tell.
#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> Option<bool> {
    Some(Path::new("/proc").join(pid.to_string()).exists())
}

#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> Option<bool> {
    None
}

fn older_than(since: SystemTime, max_age: Duration) -> bool {
    since.elapsed().is_ok_and(|age| age > max_age)
}

/// Exclusive per-environment lock, released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    fn path_for(root: &Path, environment: &str) -> PathBuf {
        root.join(environment).join(LOCK_FILE)
    }

    /// Acquire the lock for `run.environment`. Fails with `RunInProgress`
    /// when another live run holds it. A lock whose holder process is gone,
    /// or that is older than `max_age`, is broken and taken over.
    pub fn acquire(root: &Path, run: &RunKey, max_age: Duration) -> Result<Self> {
        let path = Self::path_for(root, &run.environment);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut broke_stale = false;
        let file = loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(&path).unwrap_or_default();
                    match Self::abandoned_reason(&path, &holder, max_age) {
                        Some(reason) if !broke_stale => {
                            warn!(run = %run, reason = %reason, "breaking abandoned run lock");
                            match fs::remove_file(&path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == ErrorKind::NotFound => {}
                                Err(e) => return Err(e.into()),
                            }
                            broke_stale = true;
                        }
                        _ => {
                            return Err(Error::RunInProgress(format!(
                                "environment {} is locked by {}",
                                run.environment,
                                holder.trim()
                            )))
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        };

        let owner = LockOwner {
            run: run.clone(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        if let Err(e) = Self::write_owner(file, &owner) {
            // no RunLock exists yet to clean up on drop
            if let Err(rm) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %rm, "failed to remove partial run lock");
            }
            return Err(e);
        }
        info!(run = %run, "acquired run lock");
        Ok(Self { path })
    }

    fn write_owner(mut file: File, owner: &LockOwner) -> Result<()> {
        file.write_all(&serde_json::to_vec(owner)?)?;
        file.sync_all()?;
        Ok(())
    }

    /// Why the current lock file no longer protects a live run, if it
    /// doesn't. Unreadable contents fall back to the file's age.
    fn abandoned_reason(path: &Path, holder: &str, max_age: Duration) -> Option<String> {
        match serde_json::from_str::<LockOwner>(holder) {
            Ok(owner) => {
                if pid_alive(owner.pid) == Some(false) {
                    return Some(format!("holder pid {} is not running", owner.pid));
                }
                let acquired: SystemTime = owner.acquired_at.into();
                older_than(acquired, max_age).then(|| {
                    format!("held by pid {} since {}", owner.pid, owner.acquired_at)
                })
            }
            Err(_) => {
                let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
                older_than(modified, max_age).then(|| "unreadable lock file".to_string())
            }
        }
    }

    /// Remove a lock left behind by a crashed run. Returns whether a lock
    /// file existed.
    pub fn break_stale(root: &Path, environment: &str) -> Result<bool> {
        let path = Self::path_for(root, environment);
        match fs::remove_file(&path) {
            Ok(()) => {
                warn!(environment, "removed stale run lock");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release run lock");
        }
    }
}
