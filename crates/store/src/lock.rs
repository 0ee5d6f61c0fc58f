//! Advisory single-writer lock for one context directory.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use emesh_core::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const LOCK_FILE: &str = ".lock";
const POLL: Duration = Duration::from_millis(50);
/// A holder that has not released after this long is assumed dead.
const STALE_AFTER_SECS: i64 = 300;

#[derive(Debug, Serialize, Deserialize)]
struct LockBody {
    owner: String,
    pid: u32,
    acquired_at: String,
}

/// Held while a process mutates a context's manifest and broker config.
/// Released on drop.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
    owner: String,
}

impl StoreLock {
    /// Wait up to `timeout` for the lock of `dir`.
    pub async fn acquire(dir: &Path, timeout: Duration) -> MeshResult<Self> {
        let started = Instant::now();
        loop {
            if let Some(lock) = Self::try_acquire(dir)? {
                return Ok(lock);
            }
            if started.elapsed() >= timeout {
                return Err(MeshError::LockTimeout {
                    path: dir.join(LOCK_FILE),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(POLL).await;
        }
    }

    /// One attempt; `Ok(None)` when another live writer holds the lock.
    pub fn try_acquire(dir: &Path) -> MeshResult<Option<Self>> {
        std::fs::create_dir_all(dir).map_err(|e| MeshError::store_io(dir, e))?;
        let path = dir.join(LOCK_FILE);
        let owner = uuid::Uuid::new_v4().to_string();
        match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut f) => {
                let body = LockBody { owner: owner.clone(), pid: std::process::id(), acquired_at: Utc::now().to_rfc3339() };
                let bytes = serde_json::to_vec(&body)?;
                f.write_all(&bytes).map_err(|e| MeshError::store_io(&path, e))?;
                debug!(path = %path.display(), "store lock acquired");
                Ok(Some(Self { path, owner }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if is_stale(&path) {
                    break_stale(&path, &owner);
                }
                Ok(None)
            }
            Err(e) => Err(MeshError::store_io(path, e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_body(path: &Path) -> Option<LockBody> {
    let raw = std::fs::read(path).ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Move the lock aside before judging it again. The rename is atomic, so of several waiters that
/// all saw a stale lock only one gets the file, and a lock re-taken in between is linked back.
fn break_stale(path: &Path, owner: &str) {
    let aside = path.with_file_name(format!("{}.{}", LOCK_FILE, owner));
    if std::fs::rename(path, &aside).is_err() {
        return;
    }
    if is_stale(&aside) {
        warn!(path = %path.display(), "breaking stale store lock");
    } else if let Err(e) = std::fs::hard_link(&aside, path) {
        warn!(path = %path.display(), error = %e, "live store lock displaced and already replaced");
    }
    let _ = std::fs::remove_file(&aside);
}

fn is_stale(path: &Path) -> bool {
    let Some(body) = read_body(path) else {
        // Half-written by a crashed holder, or mid-write right now; only the former ages.
        return std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .map(|age| age.as_secs() as i64 > STALE_AFTER_SECS)
            .unwrap_or(false);
    };
    match DateTime::parse_from_rfc3339(&body.acquired_at) {
        Ok(at) => (Utc::now() - at.with_timezone(&Utc)).num_seconds() > STALE_AFTER_SECS,
        Err(_) => true,
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        // Never remove a lock that was broken and re-taken by someone else.
        match read_body(&self.path) {
            Some(body) if body.owner == self.owner => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "failed to release store lock");
                }
            }
            _ => debug!(path = %self.path.display(), "store lock no longer ours; leaving it"),
        }
    }
}
