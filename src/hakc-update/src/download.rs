//! Artifact downloads into the staging area.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;
use reqwest::{Client, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::catalog::Artifact;
use crate::config::SyncConfig;
use crate::error::{FetchError, SyncError, SyncResult};
use crate::verify;

/// Progress information during download.
#[derive(Debug, Clone, Copy)]
pub struct DownloadProgress {
    /// Bytes downloaded so far
    pub downloaded: u64,
    /// Total bytes to download
    pub total: u64,
}

impl DownloadProgress {
    /// Get download progress as a percentage (0-100).
    pub fn percentage(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        (self.downloaded as f32 / self.total as f32) * 100.0
    }

    /// Get human-readable downloaded size.
    pub fn downloaded_human(&self) -> String {
        format_bytes(self.downloaded)
    }

    /// Get human-readable total size.
    pub fn total_human(&self) -> String {
        format_bytes(self.total)
    }
}

/// Format bytes as human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Callback invoked as an artifact streams in.
pub type ProgressFn = Arc<dyn Fn(&Artifact, DownloadProgress) + Send + Sync>;

/// Result of fetching one artifact of a batch.
#[derive(Debug)]
pub struct FetchOutcome {
    pub artifact: Artifact,
    pub result: Result<PathBuf, FetchError>,
}

/// Downloads artifacts with per-artifact timeout, integrity checks and a
/// bound on concurrent transfers.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    timeout: Duration,
    limiter: Arc<Semaphore>,
    cancel: CancellationToken,
    on_progress: Option<ProgressFn>,
}

impl Fetcher {
    pub fn new(config: &SyncConfig, cancel: CancellationToken) -> SyncResult<Self> {
        let client = hakc_common::create_client_builder()
            .connect_timeout(config.feed_timeout())
            .build()
            .map_err(|e| SyncError::config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            timeout: config.fetch_timeout(),
            limiter: Arc::new(Semaphore::new(config.max_concurrent_fetches.max(1))),
            cancel,
            on_progress: None,
        })
    }

    /// Report streaming progress to `callback`.
    pub fn with_progress(mut self, callback: ProgressFn) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Fetch one artifact into `dest_dir`, returning the staged file.
    ///
    /// A file already staged with the expected size (and digest, when known)
    /// is reused without a request.
    pub async fn fetch(&self, artifact: &Artifact, dest_dir: &Path) -> Result<PathBuf, FetchError> {
        let dest = dest_dir.join(&artifact.name);
        if self.is_already_staged(artifact, &dest).await {
            tracing::debug!("{} already staged", artifact.name);
            return Ok(dest);
        }

        let after_secs = self.timeout.as_secs();
        tokio::select! {
            _ = self.cancel.cancelled() => Err(FetchError::Cancelled),
            result = tokio::time::timeout(self.timeout, self.download(artifact, &dest)) => {
                match result {
                    Ok(inner) => inner.map(|()| dest),
                    Err(_) => Err(FetchError::Timeout { after_secs }),
                }
            }
        }
    }

    /// Fetch a batch concurrently. Outcomes are returned in input order.
    pub async fn fetch_all(&self, artifacts: &[Artifact], dest_dir: &Path) -> Vec<FetchOutcome> {
        let tasks = artifacts.iter().map(|artifact| async move {
            let result = match self.limiter.acquire().await {
                Ok(_permit) => self.fetch(artifact, dest_dir).await,
                Err(_) => Err(FetchError::Cancelled),
            };
            if let Err(e) = &result {
                tracing::warn!("Fetching {} failed: {}", artifact.name, e);
            }
            FetchOutcome {
                artifact: artifact.clone(),
                result,
            }
        });
        join_all(tasks).await
    }

    async fn is_already_staged(&self, artifact: &Artifact, dest: &Path) -> bool {
        if artifact.size == 0 {
            return false;
        }
        match tokio::fs::metadata(dest).await {
            Ok(meta) if meta.is_file() && meta.len() == artifact.size => {}
            _ => return false,
        }
        match &artifact.sha256 {
            Some(expected) => verify::verify_sha256(dest, expected).await.is_ok(),
            None => true,
        }
    }

    async fn download(&self, artifact: &Artifact, dest: &Path) -> Result<(), FetchError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = part_path(dest);

        let result = self.stream_to(artifact, &part).await;
        let result = match result {
            Ok(()) => self.check(artifact, &part).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e);
        }

        tokio::fs::rename(&part, dest).await?;
        tracing::debug!("Staged {} at {}", artifact.name, dest.display());
        Ok(())
    }

    async fn stream_to(&self, artifact: &Artifact, part: &Path) -> Result<(), FetchError> {
        let network = |message: String| FetchError::NetworkFailure {
            url: artifact.url.clone(),
            message,
        };

        let response = self
            .client
            .get(&artifact.url)
            .send()
            .await
            .map_err(|e| network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                url: artifact.url.clone(),
            });
        }
        if !status.is_success() {
            return Err(network(format!("HTTP {}", status)));
        }

        let total = if artifact.size > 0 {
            artifact.size
        } else {
            response.content_length().unwrap_or(0)
        };
        let mut downloaded: u64 = 0;

        let mut file = tokio::fs::File::create(part).await?;
        let mut stream = response.bytes_stream();

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| network(e.to_string()))?;

            file.write_all(&chunk).await?;

            downloaded += chunk.len() as u64;
            if let Some(callback) = &self.on_progress {
                callback(artifact, DownloadProgress { downloaded, total });
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        Ok(())
    }

    async fn check(&self, artifact: &Artifact, part: &Path) -> Result<(), FetchError> {
        let actual = tokio::fs::metadata(part).await?.len();
        if artifact.size > 0 && actual != artifact.size {
            return Err(FetchError::SizeMismatch {
                expected: artifact.size,
                actual,
            });
        }
        if let Some(expected) = &artifact.sha256 {
            verify::verify_sha256(part, expected).await?;
        }
        Ok(())
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}
