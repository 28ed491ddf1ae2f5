//! Release feed client.
//!
//! The feed is consumed in the GitHub REST shape: firmware releases with
//! downloadable assets, and a contents listing for the frequency files
//! repository. The engine only sees the [`ReleaseFeed`] trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::{ReleaseChannel, SyncConfig};
use crate::error::{SyncError, SyncResult};

/// A downloadable file attached to a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    /// Asset file name
    pub name: String,
    /// Download URL
    pub url: String,
    /// File size in bytes
    pub size: u64,
    /// SHA256 checksum when the feed publishes one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Release information from the feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseInfo {
    /// Release tag (`v2.0.2`, `nightly-tag-20241012`)
    pub tag: String,
    /// Channel the release was resolved for
    pub channel: ReleaseChannel,
    /// Publish timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    /// Attached assets
    pub assets: Vec<ReleaseAsset>,
}

/// Kind of a listed feed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedEntryKind {
    File,
    Dir,
    #[serde(other)]
    Other,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: FeedEntryKind,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub download_url: Option<String>,
}

/// Provider of releases and content listings.
#[async_trait]
pub trait ReleaseFeed: Send + Sync {
    /// Latest published release for a channel.
    async fn latest_release(&self, channel: ReleaseChannel) -> SyncResult<ReleaseInfo>;

    /// Entries of a content directory. A directory the feed does not have is
    /// [`SyncError::FeedUnavailable`] like any other listing failure.
    async fn list_directory(&self, path: &str) -> SyncResult<Vec<FeedEntry>>;
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    digest: Option<String>,
}

impl GithubRelease {
    fn into_info(self, channel: ReleaseChannel) -> ReleaseInfo {
        ReleaseInfo {
            tag: self.tag_name,
            channel,
            published_at: self.published_at,
            assets: self
                .assets
                .into_iter()
                .map(|a| ReleaseAsset {
                    sha256: a
                        .digest
                        .as_deref()
                        .and_then(|d| d.strip_prefix("sha256:"))
                        .map(|d| d.to_lowercase()),
                    name: a.name,
                    url: a.browser_download_url,
                    size: a.size,
                })
                .collect(),
        }
    }

    fn is_nightly(&self) -> bool {
        !self.draft
            && self.prerelease
            && self.tag_name.to_ascii_lowercase().starts_with("nightly")
    }
}

/// Client for GitHub-shaped release and contents endpoints.
#[derive(Clone)]
pub struct GithubFeed {
    client: Client,
    releases_url: String,
    contents_url: String,
}

impl GithubFeed {
    /// Create a client from the run configuration.
    pub fn from_config(config: &SyncConfig) -> SyncResult<Self> {
        let client = hakc_common::create_client_with_timeout(config.feed_timeout())
            .map_err(SyncError::feed)?;
        Ok(Self {
            client,
            releases_url: config.releases_url.trim_end_matches('/').to_string(),
            contents_url: config.freqman_api_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> SyncResult<Option<T>> {
        tracing::debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| SyncError::feed(format!("{url}: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SyncError::feed(format!(
                "{url} returned {}: {}",
                status.as_u16(),
                message.trim()
            )));
        }

        let body = response
            .json::<T>()
            .await
            .map_err(|e| SyncError::feed(format!("{url}: unparseable response: {e}")))?;
        Ok(Some(body))
    }
}

#[async_trait]
impl ReleaseFeed for GithubFeed {
    async fn latest_release(&self, channel: ReleaseChannel) -> SyncResult<ReleaseInfo> {
        match channel {
            ReleaseChannel::Stable => {
                let url = format!("{}/latest", self.releases_url);
                let release: GithubRelease = self
                    .get_json(&url)
                    .await?
                    .ok_or_else(|| SyncError::feed("no stable release published"))?;
                Ok(release.into_info(channel))
            }
            ReleaseChannel::Nightly => {
                let url = format!("{}?per_page=30", self.releases_url);
                let releases: Vec<GithubRelease> =
                    self.get_json(&url).await?.unwrap_or_default();
                releases
                    .into_iter()
                    .filter(GithubRelease::is_nightly)
                    .max_by(|a, b| {
                        a.published_at
                            .cmp(&b.published_at)
                            .then_with(|| a.tag_name.cmp(&b.tag_name))
                    })
                    .map(|r| r.into_info(channel))
                    .ok_or_else(|| SyncError::feed("no nightly build published"))
            }
        }
    }

    async fn list_directory(&self, path: &str) -> SyncResult<Vec<FeedEntry>> {
        let url = format!("{}/{}", self.contents_url, path.trim_matches('/'));
        self.get_json::<Vec<FeedEntry>>(&url)
            .await?
            .ok_or_else(|| SyncError::feed(format!("{url} not found")))
    }
}
