//! Run configuration types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hakc_common::timeout::{
    DEFAULT_FEED_TIMEOUT_SECS, DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_LOCK_STALE_MINUTES,
    DEFAULT_UNPACK_TIMEOUT_SECS,
};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Default mount point of the SD card.
pub const DEFAULT_MOUNT_POINT: &str = "/Volumes/PORTAPACK";

/// Firmware releases endpoint (GitHub REST shape).
pub const DEFAULT_RELEASES_URL: &str =
    "https://api.github.com/repos/portapack-mayhem/mayhem-firmware/releases";

/// Frequency manager files listing endpoint (GitHub contents API).
pub const DEFAULT_FREQMAN_API_URL: &str =
    "https://api.github.com/repos/portapack-mayhem/mayhem-freqman-files/contents";

/// Release channel to follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseChannel {
    /// Tagged releases (default)
    #[default]
    Stable,
    /// Nightly builds
    Nightly,
}

impl ReleaseChannel {
    /// Get the channel as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Nightly => "nightly",
        }
    }
}

impl std::fmt::Display for ReleaseChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User configuration, loaded from `~/.hakc/config.json` and overridden by
/// command-line flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Where the SD card is mounted
    pub mount_point: PathBuf,

    /// Firmware releases endpoint
    pub releases_url: String,

    /// Frequency files listing endpoint
    pub freqman_api_url: String,

    /// Release channel to follow
    pub channel: ReleaseChannel,

    /// Timeout for release feed queries
    pub feed_timeout_secs: u64,

    /// Timeout for fetching a single artifact
    pub fetch_timeout_secs: u64,

    /// Timeout for unpacking a single artifact
    pub unpack_timeout_secs: u64,

    /// Upper bound on concurrent non-firmware downloads
    pub max_concurrent_fetches: usize,

    /// Free space required on the volume before a firmware install
    pub min_free_space_mb: u64,

    /// Age after which a volume lock is considered abandoned
    pub lock_stale_minutes: u64,

    /// Parent directory for backups (default: ~/Desktop)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_root: Option<PathBuf>,

    /// Persistent staging directory; a temporary one is used when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mount_point: PathBuf::from(DEFAULT_MOUNT_POINT),
            releases_url: DEFAULT_RELEASES_URL.to_string(),
            freqman_api_url: DEFAULT_FREQMAN_API_URL.to_string(),
            channel: ReleaseChannel::Stable,
            feed_timeout_secs: DEFAULT_FEED_TIMEOUT_SECS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            unpack_timeout_secs: DEFAULT_UNPACK_TIMEOUT_SECS,
            max_concurrent_fetches: 4,
            min_free_space_mb: 700,
            lock_stale_minutes: DEFAULT_LOCK_STALE_MINUTES,
            backup_root: None,
            staging_dir: None,
        }
    }
}

impl SyncConfig {
    /// Load config from the standard location, falling back to defaults when
    /// the file does not exist.
    pub fn load() -> SyncResult<Self> {
        match hakc_common::get_app_dirs() {
            Some(dirs) => Self::load_from(&dirs.config_file()),
            None => Ok(Self::default()),
        }
    }

    /// Load config from an explicit path. A missing file yields defaults; an
    /// unreadable or malformed one is a configuration error.
    pub fn load_from(path: &Path) -> SyncResult<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(SyncError::config(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )));
            }
        };
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| SyncError::config(format!("invalid {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a run meaningless.
    pub fn validate(&self) -> SyncResult<()> {
        if self.max_concurrent_fetches == 0 {
            return Err(SyncError::config("max_concurrent_fetches must be at least 1"));
        }
        if self.fetch_timeout_secs == 0 || self.unpack_timeout_secs == 0 {
            return Err(SyncError::config("timeouts must be non-zero"));
        }
        Ok(())
    }

    pub fn feed_timeout(&self) -> Duration {
        Duration::from_secs(self.feed_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn unpack_timeout(&self) -> Duration {
        Duration::from_secs(self.unpack_timeout_secs)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_minutes * 60)
    }

    /// Backup parent directory, defaulting to the user's desktop.
    pub fn backup_root(&self) -> Option<PathBuf> {
        self.backup_root
            .clone()
            .or_else(|| dirs::home_dir().map(|h| h.join("Desktop")))
    }
}
