//! Error types for hakc-update.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::category::Category;

/// Result type for reconciliation runs.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Run-level errors. Every variant except `Io`/`Json` maps to one class of the
/// failure taxonomy and decides the process exit code.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Release feed unavailable: {message}")]
    FeedUnavailable { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Fetching {artifact} failed: {source}")]
    Fetch {
        artifact: String,
        #[source]
        source: FetchError,
    },

    #[error("Unpacking {artifact} failed: {source}")]
    Unpack {
        artifact: String,
        #[source]
        source: UnpackError,
    },

    #[error("Volume not found at {path}")]
    VolumeNotFound { path: PathBuf },

    #[error("Volume is locked by another run ({}, {age_secs}s old): {path}", holder(.pid))]
    LockHeld {
        path: PathBuf,
        pid: Option<u32>,
        age_secs: u64,
    },

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error("Insufficient space on volume: {available_mb} MB available, {required_mb} MB required")]
    InsufficientSpace { available_mb: u64, required_mb: u64 },

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn holder(pid: &Option<u32>) -> String {
    pid.map_or_else(|| "pid unknown".to_string(), |pid| format!("pid {pid}"))
}

impl SyncError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub(crate) fn feed(message: impl Into<String>) -> Self {
        Self::FeedUnavailable {
            message: message.into(),
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => 2,
            Self::VolumeNotFound { .. } => 3,
            Self::LockHeld { .. } => 4,
            Self::FeedUnavailable { .. } => 5,
            Self::Fetch {
                source: FetchError::Cancelled,
                ..
            }
            | Self::Unpack {
                source: UnpackError::Cancelled,
                ..
            }
            | Self::Apply(ApplyError::Cancelled { .. })
            | Self::Cancelled => 130,
            Self::Fetch { .. } | Self::Unpack { .. } => 6,
            Self::Apply(_) => 7,
            Self::Backup(_) => 8,
            Self::InsufficientSpace { .. } => 9,
            Self::Io(_) | Self::Json(_) => 1,
        }
    }
}

/// Failure to retrieve one artifact.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Not found: {url}")]
    NotFound { url: String },

    #[error("Network failure for {url}: {message}")]
    NetworkFailure { url: String, message: String },

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("SHA256 verification failed: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Timed out after {after_secs}s")]
    Timeout { after_secs: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("Staging I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure to expand one artifact into the staging tree.
#[derive(Debug, Error)]
pub enum UnpackError {
    #[error("Corrupt archive: {message}")]
    Corrupt { message: String },

    #[error("Archive entry {path} does not belong to any known category")]
    UnknownEntry { path: String },

    #[error("Archive entry {path} escapes the staging tree")]
    UnsafePath { path: String },

    #[error("Timed out after {after_secs}s")]
    Timeout { after_secs: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Fatal failure while applying a REPLACE category.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("Applying {category} failed at {path}: {source}")]
    Io {
        category: Category,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Applying {category} was cancelled")]
    Cancelled { category: Category },
}

impl ApplyError {
    /// Category whose apply failed.
    pub fn category(&self) -> Category {
        match self {
            Self::Io { category, .. } | Self::Cancelled { category } => *category,
        }
    }
}

/// Failure to snapshot user data.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Backup destination {path} lies inside the volume")]
    InsideVolume { path: PathBuf },

    #[error("Backup destination {path} already exists")]
    AlreadyExists { path: PathBuf },

    #[error("No backup location available (no home directory)")]
    NoLocation,

    #[error("Cannot create backup destination {path}: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Backing up {path} failed: {source}")]
    Copy {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write backup manifest: {message}")]
    Manifest { message: String },
}
