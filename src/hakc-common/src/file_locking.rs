//! Marker-file locking and atomic writes.
//!
//! Removable FAT volumes do not reliably support `flock`, so exclusive
//! ownership of a volume is expressed as a marker file created with
//! create-new semantics. The marker records who holds it and since when, which
//! lets a later run tell a live lock from one left behind by a crash.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error type for locking and atomic write operations.
#[derive(Debug, thiserror::Error)]
pub enum FileLockError {
    /// Another process holds a fresh lock.
    #[error("Lock {path} is held by {} (age {age_secs}s)", holder(.pid))]
    Held {
        path: PathBuf,
        /// Unknown while the holder has not written the marker yet
        pid: Option<u32>,
        age_secs: u64,
    },

    /// Atomic write failed.
    #[error("Atomic write failed: {0}")]
    AtomicWriteFailed(String),

    /// I/O error during operation.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn holder(pid: &Option<u32>) -> String {
    pid.map_or_else(|| "an unknown process".to_string(), |pid| format!("pid {pid}"))
}

/// Result type for file locking operations.
pub type FileLockResult<T> = Result<T, FileLockError>;

/// Content of a lock marker file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process that created the marker
    pub pid: u32,
    /// When the marker was created
    pub created_at: DateTime<Utc>,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            created_at: Utc::now(),
        }
    }

    /// Age of the marker relative to now. Markers from the future count as fresh.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// An exclusive marker-file lock. The marker is removed on drop.
#[derive(Debug)]
pub struct MarkerLock {
    path: PathBuf,
}

impl MarkerLock {
    /// Acquire the lock at `path`.
    ///
    /// A marker younger than `stale_after` makes this fail with
    /// [`FileLockError::Held`]; an older one is taken over. Markers that cannot
    /// be parsed (including one another process has created but not written
    /// yet) are aged by their modification time.
    pub fn acquire(path: impl AsRef<Path>, stale_after: Duration) -> FileLockResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Second attempt only happens after removing a stale marker.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let body = serde_json::to_vec_pretty(&LockInfo::current())
                        .map_err(|e| FileLockError::Io(io::Error::other(e)))?;
                    file.write_all(&body)?;
                    file.sync_all()?;
                    tracing::debug!("Acquired lock {}", path.display());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let (pid, age) = match Self::inspect(&path)? {
                        Some(info) => (Some(info.pid), info.age()),
                        None => (None, marker_age(&path)?),
                    };
                    if age < stale_after {
                        return Err(FileLockError::Held {
                            path,
                            pid,
                            age_secs: age.as_secs(),
                        });
                    }
                    tracing::warn!(
                        "Removing stale lock {} ({}, age {}s)",
                        path.display(),
                        holder(&pid),
                        age.as_secs()
                    );
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(FileLockError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("lock {} was re-created concurrently", path.display()),
        )))
    }

    /// Read the marker at `path` without taking it.
    ///
    /// Returns `None` when the file is missing or cannot be parsed.
    pub fn inspect(path: impl AsRef<Path>) -> FileLockResult<Option<LockInfo>> {
        match fs::read(path.as_ref()) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Path of the marker file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Time since the marker was last modified. A vanished marker counts as
/// infinitely old so that the caller retries creating it.
fn marker_age(path: &Path) -> FileLockResult<Duration> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or(Duration::ZERO)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Duration::MAX),
        Err(e) => Err(e.into()),
    }
}

impl Drop for MarkerLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Atomically write content to a file.
///
/// Writes to a temporary sibling, syncs it, then renames over the target, so
/// readers see either the old or the new content and never a torn write.
pub fn atomic_write(path: impl AsRef<Path>, content: &[u8]) -> FileLockResult<()> {
    let path = path.as_ref();
    let parent = path.parent().ok_or_else(|| {
        FileLockError::AtomicWriteFailed("Cannot determine parent directory".to_string())
    })?;

    if !parent.exists() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        std::process::id()
    ));

    {
        let mut temp_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;

        temp_file.write_all(content)?;
        temp_file.sync_all()?;
    }

    // FAT and Windows refuse to rename over an existing file.
    #[cfg(windows)]
    if path.exists() {
        let _ = fs::remove_file(path);
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        FileLockError::AtomicWriteFailed(format!("rename failed: {}", e))
    })?;

    Ok(())
}
