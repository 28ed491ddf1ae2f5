//! Content categories of the SD card and their merge policies.

use serde::{Deserialize, Serialize};

/// How a category is reconciled against the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergePolicy {
    /// Fully substituted from the staging tree.
    Replace,
    /// Union of staged and existing entries; user entries win conflicts.
    Merge,
    /// Never touched.
    Preserve,
}

impl std::fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Replace => "REPLACE",
            Self::Merge => "MERGE",
            Self::Preserve => "PRESERVE",
        })
    }
}

/// A top-level folder of the SD card.
///
/// Declaration order is the apply order: firmware first, then shipped
/// content, then user data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Firmware,
    Resources,
    Hackrf,
    Apps,
    Adsb,
    Ais,
    Osm,
    Macaddress,
    Gps,
    Samples,
    Splash,
    Remotes,
    Freqman,
    Captures,
    Recordings,
    Screenshots,
    Logs,
    Debug,
}

impl Category {
    /// Every category, in apply order.
    pub const ALL: [Category; 18] = [
        Self::Firmware,
        Self::Resources,
        Self::Hackrf,
        Self::Apps,
        Self::Adsb,
        Self::Ais,
        Self::Osm,
        Self::Macaddress,
        Self::Gps,
        Self::Samples,
        Self::Splash,
        Self::Remotes,
        Self::Freqman,
        Self::Captures,
        Self::Recordings,
        Self::Screenshots,
        Self::Logs,
        Self::Debug,
    ];

    /// Folder name on the volume.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Firmware => "FIRMWARE",
            Self::Resources => "pp_res",
            Self::Hackrf => "hackrf",
            Self::Apps => "APPS",
            Self::Adsb => "ADSB",
            Self::Ais => "AIS",
            Self::Osm => "OSM",
            Self::Macaddress => "MACADDRESS",
            Self::Gps => "GPS",
            Self::Samples => "SAMPLES",
            Self::Splash => "SPLASH",
            Self::Remotes => "REMOTES",
            Self::Freqman => "FREQMAN",
            Self::Captures => "CAPTURES",
            Self::Recordings => "RECORDINGS",
            Self::Screenshots => "SCREENSHOTS",
            Self::Logs => "LOGS",
            Self::Debug => "DEBUG",
        }
    }

    /// Canonical upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resources => "RESOURCES",
            Self::Hackrf => "HACKRF",
            other => other.dir_name(),
        }
    }

    pub fn policy(&self) -> MergePolicy {
        match self {
            Self::Firmware
            | Self::Resources
            | Self::Hackrf
            | Self::Apps
            | Self::Adsb
            | Self::Ais
            | Self::Osm
            | Self::Macaddress => MergePolicy::Replace,
            Self::Gps | Self::Samples | Self::Splash | Self::Remotes | Self::Freqman => {
                MergePolicy::Merge
            }
            Self::Captures | Self::Recordings | Self::Screenshots | Self::Logs | Self::Debug => {
                MergePolicy::Preserve
            }
        }
    }

    /// Whether the folder holds content authored on the device or by the user.
    pub fn is_user_data(&self) -> bool {
        matches!(
            self,
            Self::Remotes
                | Self::Freqman
                | Self::Captures
                | Self::Recordings
                | Self::Screenshots
                | Self::Logs
                | Self::Debug
        )
    }

    /// Categories snapshotted by a backup.
    pub fn user_data() -> impl Iterator<Item = Category> {
        Self::ALL.into_iter().filter(Category::is_user_data)
    }

    /// Resolve a volume or archive folder name, ignoring case.
    pub fn from_dir_name(name: &str) -> Option<Category> {
        Self::ALL
            .into_iter()
            .find(|c| c.dir_name().eq_ignore_ascii_case(name))
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
