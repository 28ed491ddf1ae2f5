//! Centralized timeout and threshold defaults.

/// Timeout for a release feed query in seconds.
pub const DEFAULT_FEED_TIMEOUT_SECS: u64 = 15;

/// Timeout for fetching one artifact in seconds.
///
/// Firmware bundles with the world map are several hundred megabytes.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 600;

/// Timeout for unpacking one artifact in seconds.
pub const DEFAULT_UNPACK_TIMEOUT_SECS: u64 = 300;

/// Age after which a volume lock marker is considered abandoned, in minutes.
pub const DEFAULT_LOCK_STALE_MINUTES: u64 = 30;
