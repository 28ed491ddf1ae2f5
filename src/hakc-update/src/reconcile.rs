//! Applying the staged tree to the volume.
//!
//! Categories are processed in [`Category`] order. REPLACE categories are
//! substituted wholesale and guarded by a per-category sentinel so that an
//! interrupted run can resume without redoing completed work. MERGE
//! categories are reconciled file by file against the fingerprints shipped by
//! the previous run, so that files the user edited are never overwritten.
//! PRESERVE categories are only reported.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::category::{Category, MergePolicy};
use crate::error::ApplyError;
use crate::record::{Fingerprints, InstallRecord};
use crate::staging::StagingTree;
use crate::verify::{sha256_file, tree_digest};
use crate::volume::VolumeTree;

/// What to do with one staged file of a MERGE category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeAction {
    /// Not on the volume yet
    Add,
    /// Volume already has the staged content
    Unchanged,
    /// Volume still has what we shipped last time
    Overwrite,
    /// Volume content was changed by the user
    KeepUser,
}

/// Decide a MERGE action from the existing, previously shipped and staged
/// digests of one file.
pub fn merge_decision(
    existing: Option<&str>,
    last_shipped: Option<&str>,
    staged: &str,
) -> MergeAction {
    match existing {
        None => MergeAction::Add,
        Some(existing) if existing == staged => MergeAction::Unchanged,
        Some(existing) if Some(existing) == last_shipped => MergeAction::Overwrite,
        Some(_) => MergeAction::KeepUser,
    }
}

/// A MERGE file that could not be processed. Never aborts the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeSkip {
    pub category: Category,
    pub path: String,
    pub reason: String,
}

/// Per-category outcome counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryReport {
    pub category: Category,
    pub policy: MergePolicy,
    pub added: usize,
    pub replaced: usize,
    pub skipped: usize,
    pub preserved: usize,
    pub failed: usize,
}

impl CategoryReport {
    fn new(category: Category) -> Self {
        Self {
            category,
            policy: category.policy(),
            added: 0,
            replaced: 0,
            skipped: 0,
            preserved: 0,
            failed: 0,
        }
    }
}

/// Outcome of one apply.
#[derive(Debug, Default, Serialize)]
pub struct ReconcileReport {
    pub categories: Vec<CategoryReport>,
    pub merge_skips: Vec<MergeSkip>,
    /// Fatal failure; processing stopped at this category
    #[serde(skip)]
    pub fatal: Option<ApplyError>,
    /// Fingerprints of the MERGE files this run shipped or found in place
    #[serde(skip)]
    pub shipped: Fingerprints,
}

impl ReconcileReport {
    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    pub fn category(&self, category: Category) -> Option<&CategoryReport> {
        self.categories.iter().find(|c| c.category == category)
    }
}

/// Resumability marker of a completed REPLACE.
#[derive(Debug, Serialize, Deserialize)]
struct Sentinel {
    category: Category,
    digest: String,
    files: usize,
    written_at: DateTime<Utc>,
}

/// Applies staged categories to the volume.
#[derive(Debug, Clone)]
pub struct ReconcilerEngine {
    cancel: CancellationToken,
}

impl ReconcilerEngine {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Apply the `staged` categories of `staging` to `volume`.
    ///
    /// `prior` supplies the fingerprints MERGE decisions are made against.
    /// PRESERVE categories present on the volume are reported untouched.
    pub fn apply(
        &self,
        staging: &StagingTree,
        volume: &VolumeTree,
        staged: &BTreeSet<Category>,
        prior: Option<&InstallRecord>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let no_fingerprints = Fingerprints::new();
        let prior_shipped = prior.map_or(&no_fingerprints, |r| &r.fingerprints);

        for category in Category::ALL {
            let result = match category.policy() {
                MergePolicy::Preserve => {
                    report_preserved(volume, category, &mut report);
                    Ok(())
                }
                _ if !staged.contains(&category) => continue,
                MergePolicy::Replace => self
                    .replace(staging, volume, category)
                    .map(|cat| report.categories.push(cat)),
                MergePolicy::Merge => {
                    let empty = BTreeMap::new();
                    let last = prior_shipped.get(&category).unwrap_or(&empty);
                    self.merge(staging, volume, category, last, &mut report)
                }
            };

            if let Err(e) = result {
                tracing::error!("{}", e);
                report.fatal = Some(e);
                break;
            }
        }

        report
    }

    fn replace(
        &self,
        staging: &StagingTree,
        volume: &VolumeTree,
        category: Category,
    ) -> Result<CategoryReport, ApplyError> {
        let io_err = |path: &Path, source: io::Error| ApplyError::Io {
            category,
            path: path.to_path_buf(),
            source,
        };
        let mut cat = CategoryReport::new(category);

        let staged_dir = staging.category_dir(category);
        let staged = digest_tree(&staged_dir).map_err(|e| io_err(&staged_dir, e))?;
        let digest = digest_of(&staged);

        let sentinel_path = volume.sentinel_path(category);
        let live = volume
            .category_dir(category)
            .map_err(|e| io_err(volume.root(), e))?;

        if let (Some(recorded), Some(live)) = (read_sentinel(&sentinel_path), &live) {
            if recorded.digest == digest
                && digest_tree(live).map(|t| digest_of(&t)).ok().as_deref() == Some(&*digest)
            {
                tracing::info!("{} already in place, skipping", category);
                cat.skipped = staged.len();
                return Ok(cat);
            }
        }

        match std::fs::remove_file(&sentinel_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&sentinel_path, e)),
        }

        let target = match live {
            Some(live) => {
                std::fs::remove_dir_all(&live).map_err(|e| io_err(&live, e))?;
                live
            }
            None => volume.root().join(category.dir_name()),
        };
        std::fs::create_dir_all(&target).map_err(|e| io_err(&target, e))?;

        for relative in staged.keys() {
            if self.cancel.is_cancelled() {
                return Err(ApplyError::Cancelled { category });
            }
            let src = staged_dir.join(relative);
            let dest = target.join(relative);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
            std::fs::copy(&src, &dest).map_err(|e| io_err(&dest, e))?;
            cat.replaced += 1;
        }

        let sentinel = Sentinel {
            category,
            digest,
            files: staged.len(),
            written_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&sentinel)
            .map_err(|e| io_err(&sentinel_path, io::Error::other(e)))?;
        hakc_common::atomic_write(&sentinel_path, &body)
            .map_err(|e| io_err(&sentinel_path, io::Error::other(e.to_string())))?;

        tracing::info!("Replaced {} ({} files)", category, cat.replaced);
        Ok(cat)
    }

    fn merge(
        &self,
        staging: &StagingTree,
        volume: &VolumeTree,
        category: Category,
        last_shipped: &BTreeMap<String, String>,
        report: &mut ReconcileReport,
    ) -> Result<(), ApplyError> {
        let mut cat = CategoryReport::new(category);
        let mut shipped = last_shipped.clone();

        let staged_dir = staging.category_dir(category);
        let staged = match digest_tree(&staged_dir) {
            Ok(staged) => staged,
            Err(e) => {
                report.merge_skips.push(MergeSkip {
                    category,
                    path: category.dir_name().to_string(),
                    reason: format!("cannot read staged files: {e}"),
                });
                cat.failed += 1;
                report.categories.push(cat);
                return Ok(());
            }
        };

        let target_dir = match volume.category_target(category) {
            Ok(dir) => dir,
            Err(e) => {
                report.merge_skips.push(MergeSkip {
                    category,
                    path: category.dir_name().to_string(),
                    reason: e.to_string(),
                });
                cat.failed += staged.len();
                report.categories.push(cat);
                return Ok(());
            }
        };

        for (relative, staged_digest) in &staged {
            if self.cancel.is_cancelled() {
                report.categories.push(cat);
                return Err(ApplyError::Cancelled { category });
            }

            let outcome = merge_file(
                &staged_dir.join(relative),
                &target_dir,
                relative,
                staged_digest,
                last_shipped.get(relative).map(String::as_str),
            );
            match outcome {
                Ok(action) => {
                    tracing::debug!("{}/{}: {:?}", category, relative, action);
                    match action {
                        MergeAction::Add => cat.added += 1,
                        MergeAction::Overwrite => cat.replaced += 1,
                        MergeAction::Unchanged => cat.skipped += 1,
                        MergeAction::KeepUser => cat.preserved += 1,
                    }
                    if action != MergeAction::KeepUser {
                        shipped.insert(relative.clone(), staged_digest.clone());
                    }
                }
                Err(e) => {
                    tracing::warn!("Skipping {}/{}: {}", category, relative, e);
                    cat.failed += 1;
                    report.merge_skips.push(MergeSkip {
                        category,
                        path: relative.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            "Merged {}: {} added, {} updated, {} unchanged, {} kept, {} failed",
            category,
            cat.added,
            cat.replaced,
            cat.skipped,
            cat.preserved,
            cat.failed
        );
        report.shipped.insert(category, shipped);
        report.categories.push(cat);
        Ok(())
    }
}

fn merge_file(
    staged_path: &Path,
    target_dir: &Path,
    relative: &str,
    staged_digest: &str,
    last_shipped: Option<&str>,
) -> io::Result<MergeAction> {
    let existing = find_existing(target_dir, relative)?;
    let existing_digest = existing.as_deref().map(sha256_file).transpose()?;

    let action = merge_decision(existing_digest.as_deref(), last_shipped, staged_digest);
    match action {
        MergeAction::Add | MergeAction::Overwrite => {
            let dest = existing.unwrap_or_else(|| target_dir.join(relative));
            let content = std::fs::read(staged_path)?;
            hakc_common::atomic_write(&dest, &content)
                .map_err(|e| io::Error::other(e.to_string()))?;
        }
        MergeAction::Unchanged | MergeAction::KeepUser => {}
    }
    Ok(action)
}

/// Resolve `relative` under `root` one component at a time, ignoring case.
fn find_existing(root: &Path, relative: &str) -> io::Result<Option<PathBuf>> {
    let mut current = root.to_path_buf();
    for part in relative.split('/') {
        match hakc_common::find_entry_case_insensitive(&current, part)? {
            Some(found) => current = found,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

fn report_preserved(volume: &VolumeTree, category: Category, report: &mut ReconcileReport) {
    if let Ok(Some(dir)) = volume.category_dir(category) {
        let mut cat = CategoryReport::new(category);
        cat.preserved = WalkDir::new(&dir)
            .min_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .count();
        report.categories.push(cat);
    }
}

/// SHA256 of every file below `dir`, keyed by `/`-separated relative path.
/// A missing directory is empty.
pub fn digest_tree(dir: &Path) -> io::Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(io::Error::other)?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.insert(relative, sha256_file(entry.path())?);
    }
    Ok(files)
}

fn digest_of(files: &BTreeMap<String, String>) -> String {
    tree_digest(files.iter().map(|(p, d)| (p.as_str(), d.as_str())))
}

fn read_sentinel(path: &Path) -> Option<Sentinel> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}
