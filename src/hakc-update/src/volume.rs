//! Handle on the mounted SD card.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hakc_common::{FileLockError, MarkerLock};

use crate::category::Category;
use crate::error::{SyncError, SyncResult};

/// Directory on the volume holding the run state.
pub const STATE_DIR: &str = ".hakc";

const LOCK_FILE: &str = "lock";
const RECORD_FILE: &str = "install_record.json";
const SENTINEL_DIR: &str = "sentinels";

/// The live volume. Nothing about its content is assumed; every lookup reads
/// the filesystem.
#[derive(Debug, Clone)]
pub struct VolumeTree {
    root: PathBuf,
}

impl VolumeTree {
    /// Open the volume mounted at `mount_point`.
    pub fn open(mount_point: impl AsRef<Path>) -> SyncResult<Self> {
        let root = mount_point.as_ref();
        if !root.is_dir() {
            return Err(SyncError::VolumeNotFound {
                path: root.to_path_buf(),
            });
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn record_path(&self) -> PathBuf {
        self.state_dir().join(RECORD_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir().join(LOCK_FILE)
    }

    /// Resumability sentinel of a REPLACE category.
    pub fn sentinel_path(&self, category: Category) -> PathBuf {
        self.state_dir()
            .join(SENTINEL_DIR)
            .join(format!("{}.json", category.as_str()))
    }

    /// Existing folder of `category`, whatever its case on the card.
    pub fn category_dir(&self, category: Category) -> io::Result<Option<PathBuf>> {
        let found = hakc_common::find_entry_case_insensitive(&self.root, category.dir_name())?;
        Ok(found.filter(|p| p.is_dir()))
    }

    /// Folder `category` is written to: the existing one, or the canonical name.
    pub fn category_target(&self, category: Category) -> io::Result<PathBuf> {
        Ok(self
            .category_dir(category)?
            .unwrap_or_else(|| self.root.join(category.dir_name())))
    }

    /// Take the advisory run lock.
    pub fn lock(&self, stale_after: Duration) -> SyncResult<VolumeLock> {
        match MarkerLock::acquire(self.lock_path(), stale_after) {
            Ok(lock) => Ok(VolumeLock { _lock: lock }),
            Err(FileLockError::Held {
                path,
                pid,
                age_secs,
            }) => Err(SyncError::LockHeld {
                path,
                pid,
                age_secs,
            }),
            Err(FileLockError::Io(e)) => Err(SyncError::Io(e)),
            Err(e) => Err(SyncError::Io(io::Error::other(e.to_string()))),
        }
    }

    /// Free space on the volume in MiB.
    pub fn free_space_mb(&self) -> io::Result<u64> {
        Ok(available_disk_space(&self.root)? / (1024 * 1024))
    }

    /// Flush pending writes before the card is ejected.
    pub fn sync(&self) {
        #[cfg(unix)]
        unsafe {
            libc::sync();
        }
        tracing::debug!("Synced filesystem for {}", self.root.display());
    }
}

/// Held run lock; released on drop.
#[derive(Debug)]
pub struct VolumeLock {
    _lock: MarkerLock,
}

/// Available disk space in bytes.
#[cfg(unix)]
#[allow(clippy::unnecessary_cast)] // macOS has u32 f_bavail, Linux u64
fn available_disk_space(path: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    let c_path = CString::new(path.to_string_lossy().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    unsafe {
        let mut statvfs = MaybeUninit::<libc::statvfs>::uninit();
        if libc::statvfs(c_path.as_ptr(), statvfs.as_mut_ptr()) == 0 {
            let statvfs = statvfs.assume_init();
            Ok((statvfs.f_bavail as u64) * (statvfs.f_frsize as u64))
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(not(unix))]
fn available_disk_space(_path: &Path) -> io::Result<u64> {
    Ok(u64::MAX)
}
