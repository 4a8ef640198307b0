//! Advisory marker-file locks for serializing writers within and across processes.
//!
//! A lock is a sibling `<name>.lock` file created with create-if-absent semantics.
//! Contended acquisition polls with the tokio timer so the lock wait never blocks a
//! runtime worker thread.

use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_LOCK_STALE_MS: u64 = 30_000;
const LOCK_POLL_INTERVAL_MS: u64 = 50;

/// Acquisition bounds for a marker-file lock. A zero `stale_after` disables reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLockPolicy {
    pub timeout: Duration,
    pub stale_after: Duration,
}

impl FileLockPolicy {
    pub fn from_millis(timeout_ms: u64, stale_ms: u64) -> Self {
        Self {
            timeout: Duration::from_millis(timeout_ms),
            stale_after: Duration::from_millis(stale_ms),
        }
    }
}

impl Default for FileLockPolicy {
    fn default() -> Self {
        Self::from_millis(DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_LOCK_STALE_MS)
    }
}

#[derive(Debug, Error)]
pub enum FileLockError {
    #[error("timed out acquiring lock {}", path.display())]
    Timeout { path: PathBuf },
    #[error("failed to acquire lock {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Held lock; the marker file is removed on drop.
#[derive(Debug)]
pub struct FileLockGuard {
    path: PathBuf,
}

impl FileLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Returns the marker path guarding `base_path` (`state.json` -> `state.json.lock`).
pub fn lock_path_for(base_path: &Path) -> PathBuf {
    let mut name = base_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "state".into());
    name.push(".lock");
    base_path.with_file_name(name)
}

pub async fn acquire_file_lock(
    base_path: &Path,
    policy: FileLockPolicy,
) -> Result<FileLockGuard, FileLockError> {
    let path = lock_path_for(base_path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| FileLockError::Io {
                path: path.clone(),
                source,
            })?;
        }
    }

    let start = Instant::now();
    loop {
        match OpenOptions::new().create_new(true).write(true).open(&path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                return Ok(FileLockGuard { path });
            }
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                if policy.stale_after > Duration::ZERO
                    && reclaim_stale_lock(&path, policy.stale_after)
                {
                    warn!(lock = %path.display(), "reclaimed stale lock file");
                    continue;
                }
                if start.elapsed() >= policy.timeout {
                    return Err(FileLockError::Timeout { path });
                }
                debug!(lock = %path.display(), "lock contended; retrying");
                tokio::time::sleep(Duration::from_millis(LOCK_POLL_INTERVAL_MS)).await;
            }
            Err(source) => return Err(FileLockError::Io { path, source }),
        }
    }
}

/// Runs `operation` while holding the lock guarding `base_path`.
pub async fn with_file_lock<F, Fut, T>(
    base_path: &Path,
    policy: FileLockPolicy,
    operation: F,
) -> anyhow::Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let _guard = acquire_file_lock(base_path, policy).await?;
    operation().await
}

fn reclaim_stale_lock(path: &Path, stale_after: Duration) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = metadata.modified() else {
        return false;
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    if age < stale_after {
        return false;
    }

    fs::remove_file(path).is_ok()
}
