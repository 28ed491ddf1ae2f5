//! Firmware versions and comparison against the installed record.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::api::{ReleaseFeed, ReleaseInfo};
use crate::config::ReleaseChannel;
use crate::error::{SyncError, SyncResult};

/// Comparable part of a version. Keys of different channels do not compare.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "lowercase")]
pub enum VersionKey {
    Stable {
        major: u32,
        minor: u32,
        patch: u32,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        pre: String,
    },
    Nightly {
        /// Build date as `YYYYMMDD`
        build_date: u32,
    },
}

impl VersionKey {
    pub fn channel(&self) -> ReleaseChannel {
        match self {
            Self::Stable { .. } => ReleaseChannel::Stable,
            Self::Nightly { .. } => ReleaseChannel::Nightly,
        }
    }
}

impl PartialOrd for VersionKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (
                Self::Stable {
                    major,
                    minor,
                    patch,
                    pre,
                },
                Self::Stable {
                    major: o_major,
                    minor: o_minor,
                    patch: o_patch,
                    pre: o_pre,
                },
            ) => Some(
                (major, minor, patch)
                    .cmp(&(o_major, o_minor, o_patch))
                    .then_with(|| compare_prerelease(pre, o_pre)),
            ),
            (Self::Nightly { build_date }, Self::Nightly { build_date: other }) => {
                Some(build_date.cmp(other))
            }
            _ => None,
        }
    }
}

/// A release without a pre-release suffix sorts after any pre-release of the
/// same number.
fn compare_prerelease(a: &str, b: &str) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.cmp(b),
    }
}

/// A firmware version on one channel.
///
/// Stable versions are equal when their numbers are (`v2.0.2` == `2.0.2`).
/// Nightlies are equal only when their tags are too: two builds of the same
/// date with different tags do not compare.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    /// Tag as published by the feed
    pub tag: String,
    #[serde(flatten)]
    pub key: VersionKey,
}

impl Version {
    /// Parse a release tag for `channel`.
    ///
    /// Nightly tags carry their build date (`nightly-tag-20241012`); when they
    /// don't, `published_at` supplies it.
    pub fn parse(
        tag: &str,
        channel: ReleaseChannel,
        published_at: Option<DateTime<Utc>>,
    ) -> Option<Self> {
        let key = match channel {
            ReleaseChannel::Stable => parse_stable(tag)?,
            ReleaseChannel::Nightly => VersionKey::Nightly {
                build_date: date_in_tag(tag)
                    .or_else(|| published_at.map(|p| date_key(p.date_naive())))?,
            },
        };
        Some(Self {
            tag: tag.to_string(),
            key,
        })
    }

    /// Version of a release returned by the feed.
    pub fn from_release(release: &ReleaseInfo) -> SyncResult<Self> {
        Self::parse(&release.tag, release.channel, release.published_at).ok_or_else(|| {
            SyncError::feed(format!(
                "unrecognised {} release tag '{}'",
                release.channel, release.tag
            ))
        })
    }

    pub fn channel(&self) -> ReleaseChannel {
        self.key.channel()
    }

    fn is_nightly(&self) -> bool {
        matches!(self.key, VersionKey::Nightly { .. })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.key.partial_cmp(&other.key)? {
            Ordering::Equal if self.is_nightly() && self.tag != other.tag => None,
            ordering => Some(ordering),
        }
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.partial_cmp(other) == Some(Ordering::Equal)
    }
}

impl Eq for Version {}


impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.tag, self.channel())
    }
}

fn parse_stable(tag: &str) -> Option<VersionKey> {
    let version = tag.trim();
    let version = version
        .strip_prefix('v')
        .or_else(|| version.strip_prefix('V'))
        .unwrap_or(version);

    let (version_part, pre) = version
        .split_once('-')
        .map(|(v, p)| (v, p.to_string()))
        .unwrap_or((version, String::new()));

    let mut parts = version_part.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let patch = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);

    Some(VersionKey::Stable {
        major,
        minor,
        patch,
        pre,
    })
}

/// First run of eight digits in the tag that forms a valid calendar date.
fn date_in_tag(tag: &str) -> Option<u32> {
    let bytes = tag.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        if !bytes[start].is_ascii_digit() {
            start += 1;
            continue;
        }
        let end = bytes[start..]
            .iter()
            .position(|b| !b.is_ascii_digit())
            .map_or(bytes.len(), |p| start + p);
        let digits = &tag[start..end];
        if digits.len() == 8 && NaiveDate::parse_from_str(digits, "%Y%m%d").is_ok() {
            return digits.parse().ok();
        }
        start = end;
    }
    None
}

fn date_key(date: NaiveDate) -> u32 {
    use chrono::Datelike;
    date.year() as u32 * 10_000 + date.month() * 100 + date.day()
}

/// Outcome of comparing the installed version with the desired one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    UpToDate,
    UpdateAvailable,
    NoPriorRecord,
}

/// Compare an installed version against the desired one.
///
/// Switching channels always counts as an update.
pub fn compare(current: Option<&Version>, desired: &Version) -> Comparison {
    match current {
        None => Comparison::NoPriorRecord,
        Some(current) => match current.partial_cmp(desired) {
            Some(Ordering::Equal | Ordering::Greater) => Comparison::UpToDate,
            Some(Ordering::Less) | None => Comparison::UpdateAvailable,
        },
    }
}

/// A desired version together with the release it was read from.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub version: Version,
    pub release: ReleaseInfo,
}

/// Resolves the desired firmware version from the release feed.
#[derive(Clone)]
pub struct VersionOracle {
    feed: Arc<dyn ReleaseFeed>,
}

impl VersionOracle {
    pub fn new(feed: Arc<dyn ReleaseFeed>) -> Self {
        Self { feed }
    }

    /// Latest version published on `channel`.
    pub async fn resolve(&self, channel: ReleaseChannel) -> SyncResult<Resolved> {
        let release = self.feed.latest_release(channel).await?;
        let version = Version::from_release(&release)?;
        tracing::debug!("Resolved {} to {}", channel, version);
        Ok(Resolved { version, release })
    }
}
