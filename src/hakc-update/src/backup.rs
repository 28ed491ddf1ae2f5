//! Snapshots of user data taken before a run touches the volume.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::category::Category;
use crate::config::SyncConfig;
use crate::error::BackupError;
use crate::volume::VolumeTree;

const BACKUP_PREFIX: &str = "PORTAPACK_BACKUP_";
const MANIFEST_FILE: &str = "backup.json";

/// One category copied into a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub category: Category,
    /// Folder name as found on the volume
    pub dir: String,
    pub files: usize,
    pub bytes: u64,
}

/// A completed backup. Never modified after it is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSet {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub source: PathBuf,
    pub entries: Vec<BackupEntry>,
}

impl BackupSet {
    pub fn total_files(&self) -> usize {
        self.entries.iter().map(|e| e.files).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.bytes).sum()
    }
}

/// Copies user-data categories to a timestamped folder outside the volume.
#[derive(Debug, Clone)]
pub struct BackupManager {
    root: PathBuf,
}

impl BackupManager {
    /// Back up under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Back up under the configured root, or the desktop.
    pub fn from_config(config: &SyncConfig) -> Result<Self, BackupError> {
        config
            .backup_root()
            .map(Self::new)
            .ok_or(BackupError::NoLocation)
    }

    /// Destination a backup taken now would be written to.
    pub fn destination(&self) -> PathBuf {
        self.root.join(format!(
            "{}{}",
            BACKUP_PREFIX,
            Local::now().format("%Y%m%d_%H%M%S")
        ))
    }

    /// Copy `categories` from `volume`, preserving layout and modification
    /// times. Categories absent from the volume are skipped.
    pub fn snapshot(
        &self,
        volume: &VolumeTree,
        categories: impl IntoIterator<Item = Category>,
    ) -> Result<BackupSet, BackupError> {
        let dest = self.destination();
        if hakc_common::is_inside(&dest, volume.root()) {
            return Err(BackupError::InsideVolume { path: dest });
        }
        if dest.exists() {
            return Err(BackupError::AlreadyExists { path: dest });
        }
        fs::create_dir_all(&dest).map_err(|source| BackupError::Destination {
            path: dest.clone(),
            source,
        })?;

        let mut entries = Vec::new();
        for category in categories {
            let live = volume
                .category_dir(category)
                .map_err(|source| BackupError::Copy {
                    path: volume.root().to_path_buf(),
                    source,
                })?;
            let Some(live) = live else {
                continue;
            };
            let dir = live
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| category.dir_name().to_string());

            let (files, bytes) = copy_tree(&live, &dest.join(&dir))?;
            tracing::info!("Backed up {} ({} files)", dir, files);
            entries.push(BackupEntry {
                category,
                dir,
                files,
                bytes,
            });
        }

        let set = BackupSet {
            path: dest.clone(),
            created_at: Utc::now(),
            source: volume.root().to_path_buf(),
            entries,
        };
        let manifest = serde_json::to_vec_pretty(&set).map_err(|e| BackupError::Manifest {
            message: e.to_string(),
        })?;
        hakc_common::atomic_write(dest.join(MANIFEST_FILE), &manifest).map_err(|e| {
            BackupError::Manifest {
                message: e.to_string(),
            }
        })?;

        Ok(set)
    }
}

fn copy_tree(src: &Path, dest: &Path) -> Result<(usize, u64), BackupError> {
    let copy_err = |path: &Path, source: std::io::Error| BackupError::Copy {
        path: path.to_path_buf(),
        source,
    };

    let mut files = 0;
    let mut bytes = 0;
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| copy_err(src, std::io::Error::other(e)))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| copy_err(entry.path(), std::io::Error::other(e)))?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| copy_err(&target, e))?;
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }

        bytes += fs::copy(entry.path(), &target).map_err(|e| copy_err(entry.path(), e))?;
        let modified = entry
            .metadata()
            .map_err(|e| copy_err(entry.path(), std::io::Error::other(e)))?
            .modified()
            .map_err(|e| copy_err(entry.path(), e))?;
        File::options()
            .write(true)
            .open(&target)
            .and_then(|f| f.set_modified(modified))
            .map_err(|e| copy_err(&target, e))?;
        files += 1;
    }
    Ok((files, bytes))
}
