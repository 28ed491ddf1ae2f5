//! Expansion of fetched artifacts into the staging tree.

use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::catalog::{Artifact, ArtifactKind};
use crate::category::{Category, MergePolicy};
use crate::error::UnpackError;
use crate::staging::StagingTree;

/// What one artifact added to the staging tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StagedSubtree {
    pub categories: BTreeSet<Category>,
    pub files: usize,
    pub bytes: u64,
    /// Entries dropped because their category is never written
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dropped: Vec<String>,
}

/// Places fetched artifacts into the staging tree.
#[derive(Debug, Clone)]
pub struct Unpacker {
    timeout: Duration,
    cancel: CancellationToken,
}

impl Unpacker {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }

    /// Unpack `fetched` (as produced for `artifact`) into `staging`.
    pub async fn unpack(
        &self,
        fetched: &Path,
        artifact: &Artifact,
        staging: &StagingTree,
    ) -> Result<StagedSubtree, UnpackError> {
        let fetched = fetched.to_path_buf();
        let tree = staging.tree_dir();
        let artifact = artifact.clone();
        let cancel = self.cancel.child_token();
        let stop = cancel.clone();

        let task = tokio::task::spawn_blocking(move || match artifact.kind {
            ArtifactKind::Archive => {
                extract_archive(&fetched, &tree, artifact.only.as_deref(), &stop)
            }
            ArtifactKind::SingleFile => place_file(&fetched, &tree, &artifact),
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(UnpackError::Io(io::Error::other(join.to_string()))),
            Err(_) => {
                // The blocking task cannot be aborted; make it stop at the next entry.
                cancel.cancel();
                Err(UnpackError::Timeout {
                    after_secs: self.timeout.as_secs(),
                })
            }
        }
    }
}

fn place_file(
    fetched: &Path,
    tree: &Path,
    artifact: &Artifact,
) -> Result<StagedSubtree, UnpackError> {
    let mut staged = StagedSubtree::default();
    if artifact.category.policy() == MergePolicy::Preserve {
        tracing::warn!(
            "Not staging {}: {} is never written",
            artifact.name,
            artifact.category
        );
        staged.dropped.push(artifact.name.clone());
        return Ok(staged);
    }

    let relative = safe_relative_path(&artifact.name)?;
    let dest = tree.join(artifact.category.dir_name()).join(relative);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    staged.bytes = std::fs::copy(fetched, &dest)?;
    staged.files = 1;
    staged.categories.insert(artifact.category);
    Ok(staged)
}

/// Expand a zip archive whose top-level folders are volume categories.
fn extract_archive(
    archive_path: &Path,
    tree: &Path,
    only: Option<&[Category]>,
    cancel: &CancellationToken,
) -> Result<StagedSubtree, UnpackError> {
    let corrupt = |e: zip::result::ZipError| UnpackError::Corrupt {
        message: e.to_string(),
    };

    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(corrupt)?;
    let mut staged = StagedSubtree::default();

    for i in 0..archive.len() {
        if cancel.is_cancelled() {
            return Err(UnpackError::Cancelled);
        }

        let mut entry = archive.by_index(i).map_err(corrupt)?;
        let entry_name = entry.name().to_string();

        let relative = safe_relative_path(&entry_name)?;
        if entry.enclosed_name().is_none() {
            return Err(UnpackError::UnsafePath { path: entry_name });
        }

        let mut components = relative.iter();
        let Some(top) = components.next() else {
            continue;
        };
        let rest: PathBuf = components.collect();

        let category = top
            .to_str()
            .and_then(Category::from_dir_name)
            .filter(|_| entry.is_dir() || !rest.as_os_str().is_empty())
            .ok_or_else(|| UnpackError::UnknownEntry {
                path: entry_name.clone(),
            })?;

        if only.is_some_and(|only| !only.contains(&category)) {
            continue;
        }
        if category.policy() == MergePolicy::Preserve {
            tracing::warn!("Dropping {}: {} is never written", entry_name, category);
            staged.dropped.push(entry_name);
            continue;
        }

        // Canonical folder name so that case variants land together.
        let outpath = tree.join(category.dir_name()).join(&rest);
        staged.categories.insert(category);

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath)?;
            continue;
        }

        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&outpath)?;
        let written = io::copy(&mut entry, &mut outfile).map_err(|e| {
            if e.kind() == io::ErrorKind::InvalidData {
                UnpackError::Corrupt {
                    message: format!("{}: {}", entry_name, e),
                }
            } else {
                UnpackError::Io(e)
            }
        })?;
        staged.files += 1;
        staged.bytes += written;
    }

    tracing::debug!(
        "Unpacked {} files ({} bytes) from {}",
        staged.files,
        staged.bytes,
        archive_path.display()
    );
    Ok(staged)
}

/// Relative path of an archive entry, rejecting absolute and parent components.
fn safe_relative_path(name: &str) -> Result<PathBuf, UnpackError> {
    let unsafe_path = || UnpackError::UnsafePath {
        path: name.to_string(),
    };

    let normalized = name.replace('\\', "/");
    if normalized.contains('\0') || normalized.starts_with('/') {
        return Err(unsafe_path());
    }

    let mut out = PathBuf::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => {}
            ".." => return Err(unsafe_path()),
            p if p.contains(':') => return Err(unsafe_path()),
            p => out.push(p),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        for (name, body) in entries {
            if name.ends_with('/') {
                zip.add_directory(*name, options).unwrap();
            } else {
                zip.start_file(*name, options).unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
        }
        zip.finish().unwrap();
    }

    fn bundle_artifact() -> Artifact {
        Artifact {
            name: "bundle.zip".to_string(),
            url: String::new(),
            category: Category::Firmware,
            kind: ArtifactKind::Archive,
            gate: None,
            size: 0,
            sha256: None,
            only: None,
        }
    }

    fn unpacker() -> Unpacker {
        Unpacker::new(Duration::from_secs(30), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_archive_expands_by_category() {
        let dir = TempDir::new().unwrap();
        let staging = StagingTree::create(None).unwrap();
        let archive = dir.path().join("bundle.zip");
        write_zip(
            &archive,
            &[
                ("FIRMWARE/", ""),
                ("FIRMWARE/portapack.bin", "fw"),
                ("apps/audio.ppma", "app"),
                ("FREQMAN/ham.txt", "f=1"),
            ],
        );

        let staged = unpacker()
            .unpack(&archive, &bundle_artifact(), &staging)
            .await
            .unwrap();
        assert_eq!(staged.files, 3);
        assert_eq!(
            staged.categories.iter().copied().collect::<Vec<_>>(),
            vec![Category::Firmware, Category::Apps, Category::Freqman]
        );
        assert!(staging.category_dir(Category::Apps).join("audio.ppma").is_file());
        assert!(
            staging
                .category_dir(Category::Firmware)
                .join("portapack.bin")
                .is_file()
        );
    }

    #[tokio::test]
    async fn test_unknown_top_level_entry() {
        let dir = TempDir::new().unwrap();
        let staging = StagingTree::create(None).unwrap();
        let archive = dir.path().join("bundle.zip");
        write_zip(&archive, &[("README.md", "hi")]);

        let result = unpacker().unpack(&archive, &bundle_artifact(), &staging).await;
        assert!(matches!(result, Err(UnpackError::UnknownEntry { .. })));
    }

    #[tokio::test]
    async fn test_parent_traversal_is_unsafe() {
        let dir = TempDir::new().unwrap();
        let staging = StagingTree::create(None).unwrap();
        let archive = dir.path().join("bundle.zip");
        write_zip(&archive, &[("APPS/../../evil.txt", "x")]);

        let result = unpacker().unpack(&archive, &bundle_artifact(), &staging).await;
        assert!(matches!(result, Err(UnpackError::UnsafePath { .. })));
        assert!(!staging.root().join("evil.txt").exists());
    }

    #[tokio::test]
    async fn test_corrupt_archive() {
        let dir = TempDir::new().unwrap();
        let staging = StagingTree::create(None).unwrap();
        let archive = dir.path().join("bundle.zip");
        std::fs::write(&archive, b"this is not a zip file").unwrap();

        let result = unpacker().unpack(&archive, &bundle_artifact(), &staging).await;
        assert!(matches!(result, Err(UnpackError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_preserve_entries_are_dropped() {
        let dir = TempDir::new().unwrap();
        let staging = StagingTree::create(None).unwrap();
        let archive = dir.path().join("bundle.zip");
        write_zip(
            &archive,
            &[("CAPTURES/sample.C16", "iq"), ("APPS/a.ppma", "a")],
        );

        let staged = unpacker()
            .unpack(&archive, &bundle_artifact(), &staging)
            .await
            .unwrap();
        assert_eq!(staged.dropped, vec!["CAPTURES/sample.C16"]);
        assert!(!staging.has_category(Category::Captures));
        assert_eq!(staged.files, 1);
    }

    #[tokio::test]
    async fn test_category_filter() {
        let dir = TempDir::new().unwrap();
        let staging = StagingTree::create(None).unwrap();
        let archive = dir.path().join("bundle.zip");
        write_zip(
            &archive,
            &[("pp_res/theme.bmp", "bmp"), ("FIRMWARE/fw.bin", "fw")],
        );

        let mut artifact = bundle_artifact();
        artifact.category = Category::Resources;
        artifact.only = Some(vec![Category::Resources]);
        let staged = unpacker()
            .unpack(&archive, &artifact, &staging)
            .await
            .unwrap();
        assert_eq!(staged.files, 1);
        assert!(staging.has_category(Category::Resources));
        assert!(!staging.has_category(Category::Firmware));
    }

    #[tokio::test]
    async fn test_single_file_placed_under_category() {
        let dir = TempDir::new().unwrap();
        let staging = StagingTree::create(None).unwrap();
        let fetched = dir.path().join("police.txt");
        std::fs::write(&fetched, b"f=460000000").unwrap();

        let artifact = Artifact {
            name: "police.txt".to_string(),
            kind: ArtifactKind::SingleFile,
            category: Category::Freqman,
            ..bundle_artifact()
        };
        let staged = unpacker().unpack(&fetched, &artifact, &staging).await.unwrap();
        assert_eq!(staged.files, 1);
        assert_eq!(
            std::fs::read(staging.category_dir(Category::Freqman).join("police.txt")).unwrap(),
            b"f=460000000"
        );
    }

    #[test]
    fn test_safe_relative_path() {
        assert_eq!(
            safe_relative_path("APPS/./x.ppma").unwrap(),
            PathBuf::from("APPS/x.ppma")
        );
        assert!(safe_relative_path("/etc/passwd").is_err());
        assert!(safe_relative_path("C:/windows").is_err());
        assert!(safe_relative_path("APPS\\..\\x").is_err());
    }
}
