//! hakc-update - SD card reconciliation for PortaPack Mayhem
//!
//! Brings a mounted SD card to the state described by the latest Mayhem
//! release without destroying user data:
//! - Release feed resolution (stable tags or nightly builds)
//! - Artifact planning from the firmware bundle and frequency file listings
//! - Bounded-concurrency downloads with size and checksum verification
//! - Per-category REPLACE / MERGE / PRESERVE reconciliation with resumable
//!   REPLACE and fingerprint-based MERGE
//! - Optional user-data backup and a persisted install record
//!
//! # Example
//!
//! ```rust,ignore
//! use hakc_update::{ContentScope, FeatureSet, RunOptions, SyncConfig, SyncManager};
//!
//! let config = SyncConfig::load()?;
//! let features = FeatureSet::new(true, &["USA"], ContentScope::Full)?;
//! let manager = SyncManager::new(config)?;
//!
//! let summary = manager.run(&RunOptions::new(config.channel, features)).await?;
//! println!("{:?}", summary.outcome);
//! ```

mod api;
mod backup;
mod catalog;
mod category;
mod config;
mod download;
mod error;
mod manager;
mod reconcile;
mod record;
mod staging;
mod unpack;
mod verify;
mod version;
mod volume;

pub use api::{FeedEntry, FeedEntryKind, GithubFeed, ReleaseAsset, ReleaseFeed, ReleaseInfo};
pub use backup::{BackupEntry, BackupManager, BackupSet};
pub use catalog::{
    Artifact, ArtifactCatalog, ArtifactKind, ContentScope, FREQ_COUNTRIES, FeatureGate,
    FeatureSet, Plan,
};
pub use category::{Category, MergePolicy};
pub use config::{DEFAULT_MOUNT_POINT, ReleaseChannel, SyncConfig};
pub use download::{DownloadProgress, FetchOutcome, Fetcher, ProgressFn, format_bytes};
pub use error::{ApplyError, BackupError, FetchError, SyncError, SyncResult, UnpackError};
pub use manager::{CheckReport, RunOptions, RunOutcome, RunSummary, SyncManager};
pub use reconcile::{
    CategoryReport, MergeAction, MergeSkip, ReconcileReport, ReconcilerEngine, merge_decision,
};
pub use record::{Fingerprints, InstallRecord};
pub use staging::StagingTree;
pub use unpack::{StagedSubtree, Unpacker};
pub use version::{Comparison, Resolved, Version, VersionKey, VersionOracle, compare};
pub use volume::{STATE_DIR, VolumeLock, VolumeTree};
