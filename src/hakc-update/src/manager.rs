//! Sync manager - main API for reconciliation runs.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::api::{GithubFeed, ReleaseFeed};
use crate::backup::{BackupManager, BackupSet};
use crate::catalog::{Artifact, ArtifactCatalog, FeatureSet, Plan};
use crate::category::Category;
use crate::config::{ReleaseChannel, SyncConfig};
use crate::download::{Fetcher, ProgressFn};
use crate::error::{ApplyError, FetchError, SyncError, SyncResult, UnpackError};
use crate::reconcile::{ReconcileReport, ReconcilerEngine};
use crate::record::InstallRecord;
use crate::staging::StagingTree;
use crate::unpack::Unpacker;
use crate::version::{Comparison, Version, VersionOracle, compare};
use crate::volume::VolumeTree;

/// What a run should install.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub channel: ReleaseChannel,
    pub features: FeatureSet,
    /// Snapshot user data before applying
    pub backup: bool,
    /// Reconcile even when the volume is up to date
    pub force: bool,
}

impl RunOptions {
    pub fn new(channel: ReleaseChannel, features: FeatureSet) -> Self {
        Self {
            channel,
            features,
            backup: false,
            force: false,
        }
    }
}

/// Result of a read-only check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub desired: Version,
    pub installed: Option<Version>,
    pub comparison: Comparison,
    pub volume_present: bool,
    pub artifacts: Vec<Artifact>,
    pub total_size: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unlisted: Vec<String>,
}

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    /// Completed, but some artifacts or files were skipped
    PartialSuccess,
    Failure,
}

/// Everything a run did.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub desired: Version,
    pub installed: Option<Version>,
    pub comparison: Comparison,
    /// Whether the volume was reconciled at all
    pub applied: bool,
    pub artifacts: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupSet>,
    pub report: ReconcileReport,
    /// Whether the install record was written; unchanged records are not
    pub record_committed: bool,
}

impl RunSummary {
    /// Process exit code for the run.
    pub fn exit_code(&self) -> i32 {
        match &self.report.fatal {
            Some(ApplyError::Cancelled { .. }) => 130,
            Some(_) => 7,
            None => 0,
        }
    }

    pub fn fatal_message(&self) -> Option<String> {
        self.report.fatal.as_ref().map(ToString::to_string)
    }
}

/// Manager for reconciliation runs.
pub struct SyncManager {
    config: SyncConfig,
    feed: Arc<dyn ReleaseFeed>,
    cancel: CancellationToken,
    on_progress: Option<ProgressFn>,
}

impl SyncManager {
    /// Create a manager talking to the configured release feed.
    pub fn new(config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        let feed = Arc::new(GithubFeed::from_config(&config)?);
        Ok(Self::with_feed(config, feed))
    }

    /// Create a manager with a specific feed.
    pub fn with_feed(config: SyncConfig, feed: Arc<dyn ReleaseFeed>) -> Self {
        Self {
            config,
            feed,
            cancel: CancellationToken::new(),
            on_progress: None,
        }
    }

    /// Stop the run when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Report download progress to `callback`.
    pub fn with_progress(mut self, callback: ProgressFn) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Get the current configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Resolve and plan without touching the volume.
    pub async fn check(&self, options: &RunOptions) -> SyncResult<CheckReport> {
        let (volume_present, prior) = match VolumeTree::open(&self.config.mount_point) {
            Ok(volume) => (true, InstallRecord::load(&volume)?),
            Err(SyncError::VolumeNotFound { path }) => {
                tracing::warn!("No volume at {}, comparing against nothing", path.display());
                (false, None)
            }
            Err(e) => return Err(e),
        };
        let installed = prior.and_then(|r| r.installed_for(options.features.scope).cloned());

        let resolved = VersionOracle::new(self.feed.clone())
            .resolve(options.channel)
            .await?;
        let comparison = compare(installed.as_ref(), &resolved.version);
        let plan = ArtifactCatalog::new(self.feed.clone())
            .plan(&resolved.release, &options.features)
            .await?;

        Ok(CheckReport {
            desired: resolved.version,
            installed,
            comparison,
            volume_present,
            total_size: plan.total_size(),
            artifacts: plan.artifacts,
            unlisted: plan.unlisted,
        })
    }

    /// Full run: resolve -> plan -> fetch -> unpack -> backup -> apply -> commit.
    pub async fn run(&self, options: &RunOptions) -> SyncResult<RunSummary> {
        self.config.validate()?;
        let features = &options.features;
        let volume = VolumeTree::open(&self.config.mount_point)?;
        let prior = InstallRecord::load(&volume)?;
        let installed = prior
            .as_ref()
            .and_then(|r| r.installed_for(features.scope).cloned());

        let resolved = VersionOracle::new(self.feed.clone())
            .resolve(options.channel)
            .await?;
        let comparison = compare(installed.as_ref(), &resolved.version);
        tracing::info!(
            "Installed: {}, latest: {}",
            installed
                .as_ref()
                .map_or_else(|| "none".to_string(), ToString::to_string),
            resolved.version
        );

        if self.is_up_to_date(prior.as_ref(), comparison, options) {
            tracing::info!("Volume is up to date");
            return Ok(RunSummary {
                outcome: RunOutcome::Success,
                desired: resolved.version,
                installed,
                comparison,
                applied: false,
                artifacts: 0,
                degraded: Vec::new(),
                backup: None,
                report: ReconcileReport::default(),
                record_committed: false,
            });
        }

        let plan = ArtifactCatalog::new(self.feed.clone())
            .plan(&resolved.release, features)
            .await?;
        tracing::info!(
            "Planned {} artifacts ({})",
            plan.artifacts.len(),
            crate::download::format_bytes(plan.total_size())
        );

        if features.scope.includes_firmware() {
            self.check_free_space(&volume)?;
        }

        let _lock = volume.lock(self.config.lock_stale_after())?;
        let staging = StagingTree::create(self.config.staging_dir.as_deref())?;

        let (staged, degraded) = self.stage(&plan, &staging).await?;
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let backup = if options.backup {
            Some(self.backup(&volume).await?)
        } else {
            None
        };

        let engine = ReconcilerEngine::new(self.cancel.clone());
        let apply_volume = volume.clone();
        let (report, prior) = tokio::task::spawn_blocking(move || {
            let report = engine.apply(&staging, &apply_volume, &staged, prior.as_ref());
            (report, prior)
        })
        .await
        .map_err(|e| SyncError::Io(std::io::Error::other(e.to_string())))?;

        volume.sync();

        let firmware_installed = features.scope.includes_firmware()
            && !report.is_fatal()
            && report.category(Category::Firmware).is_some();
        let record = InstallRecord::next(
            prior.as_ref(),
            &resolved.version,
            firmware_installed,
            features,
            &report,
            degraded.clone(),
        );
        let record_committed = record.commit(&volume, &report, prior.as_ref())?;

        let outcome = if report.is_fatal() {
            RunOutcome::Failure
        } else if !report.merge_skips.is_empty() || !degraded.is_empty() {
            RunOutcome::PartialSuccess
        } else {
            RunOutcome::Success
        };

        Ok(RunSummary {
            outcome,
            desired: resolved.version,
            installed,
            comparison,
            applied: true,
            artifacts: plan.artifacts.len(),
            degraded,
            backup,
            report,
            record_committed,
        })
    }

    /// A run is skipped when the installed version and features match and
    /// nothing was degraded last time.
    fn is_up_to_date(
        &self,
        prior: Option<&InstallRecord>,
        comparison: Comparison,
        options: &RunOptions,
    ) -> bool {
        if options.force {
            return false;
        }
        match prior {
            Some(prior) => {
                comparison == Comparison::UpToDate
                    && prior.features == options.features
                    && prior.degraded.is_empty()
            }
            None => false,
        }
    }

    fn check_free_space(&self, volume: &VolumeTree) -> SyncResult<()> {
        let required_mb = self.config.min_free_space_mb;
        match volume.free_space_mb() {
            Ok(available_mb) if available_mb < required_mb => Err(SyncError::InsufficientSpace {
                available_mb,
                required_mb,
            }),
            Ok(available_mb) => {
                tracing::debug!("{} MB free on volume", available_mb);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Cannot determine free space: {}", e);
                Ok(())
            }
        }
    }

    /// Fetch and unpack the plan. The bundle archive goes first and alone;
    /// its failure aborts the run. Other artifacts that fail are reported as
    /// degraded.
    async fn stage(
        &self,
        plan: &Plan,
        staging: &StagingTree,
    ) -> SyncResult<(BTreeSet<Category>, Vec<String>)> {
        let mut fetcher = Fetcher::new(&self.config, self.cancel.clone())?;
        if let Some(callback) = &self.on_progress {
            fetcher = fetcher.with_progress(callback.clone());
        }
        let unpacker = Unpacker::new(self.config.unpack_timeout(), self.cancel.clone());

        let mut staged = BTreeSet::new();
        let mut degraded = plan.unlisted.clone();

        let primary = plan.primary();
        if let Some(artifact) = primary {
            tracing::info!("Fetching {}", artifact.name);
            let fetched = fetcher
                .fetch(artifact, &staging.downloads_dir(artifact.category))
                .await
                .map_err(|e| fetch_failure(artifact, e))?;
            let subtree = unpacker
                .unpack(&fetched, artifact, staging)
                .await
                .map_err(|e| unpack_failure(artifact, e))?;
            staged.extend(subtree.categories);
        }

        let rest: Vec<Artifact> = plan
            .artifacts
            .iter()
            .filter(|a| Some(*a) != primary)
            .cloned()
            .collect();
        if rest.is_empty() {
            return Ok((staged, degraded));
        }

        tracing::info!("Fetching {} files", rest.len());
        let mut outcomes = Vec::with_capacity(rest.len());
        for category in rest.iter().map(|a| a.category).collect::<BTreeSet<_>>() {
            let batch: Vec<Artifact> = rest
                .iter()
                .filter(|a| a.category == category)
                .cloned()
                .collect();
            outcomes.extend(
                fetcher
                    .fetch_all(&batch, &staging.downloads_dir(category))
                    .await,
            );
        }

        for outcome in outcomes {
            let artifact = outcome.artifact;
            let fetched = match outcome.result {
                Ok(path) => path,
                Err(FetchError::Cancelled) => return Err(SyncError::Cancelled),
                Err(_) => {
                    degraded.push(artifact.name);
                    continue;
                }
            };
            match unpacker.unpack(&fetched, &artifact, staging).await {
                Ok(subtree) => staged.extend(subtree.categories),
                Err(UnpackError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e) => {
                    tracing::warn!("Unpacking {} failed: {}", artifact.name, e);
                    degraded.push(artifact.name);
                }
            }
        }

        if !degraded.is_empty() {
            tracing::warn!("{} artifacts degraded: {}", degraded.len(), degraded.join(", "));
        }
        Ok((staged, degraded))
    }

    async fn backup(&self, volume: &VolumeTree) -> SyncResult<BackupSet> {
        let manager = BackupManager::from_config(&self.config)?;
        let volume = volume.clone();
        let set = tokio::task::spawn_blocking(move || {
            manager.snapshot(&volume, Category::user_data())
        })
        .await
        .map_err(|e| SyncError::Io(std::io::Error::other(e.to_string())))??;
        tracing::info!(
            "Backed up {} files to {}",
            set.total_files(),
            set.path.display()
        );
        Ok(set)
    }
}

fn fetch_failure(artifact: &Artifact, source: FetchError) -> SyncError {
    match source {
        FetchError::Cancelled => SyncError::Cancelled,
        source => SyncError::Fetch {
            artifact: artifact.name.clone(),
            source,
        },
    }
}

fn unpack_failure(artifact: &Artifact, source: UnpackError) -> SyncError {
    match source {
        UnpackError::Cancelled => SyncError::Cancelled,
        source => SyncError::Unpack {
            artifact: artifact.name.clone(),
            source,
        },
    }
}
