//! Per-run staging area for downloads and the unpacked desired tree.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::category::Category;

const DOWNLOADS_DIR: &str = "downloads";
const TREE_DIR: &str = "tree";

/// Staging area owned by one run.
///
/// A temporary directory is removed on drop. A configured directory keeps its
/// downloads between runs so that interrupted fetches are not repeated, but
/// its unpacked tree always starts empty.
#[derive(Debug)]
pub struct StagingTree {
    root: PathBuf,
    _temp: Option<TempDir>,
}

impl StagingTree {
    /// Create the staging area under `dir`, or in a fresh temporary directory.
    pub fn create(dir: Option<&Path>) -> io::Result<Self> {
        let (root, temp) = match dir {
            Some(dir) => (dir.to_path_buf(), None),
            None => {
                let temp = tempfile::Builder::new().prefix("hakc-staging-").tempdir()?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };

        let tree = root.join(TREE_DIR);
        match std::fs::remove_dir_all(&tree) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        std::fs::create_dir_all(&tree)?;
        std::fs::create_dir_all(root.join(DOWNLOADS_DIR))?;

        tracing::debug!("Staging in {}", root.display());
        Ok(Self { root, _temp: temp })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory downloads for `category` are written to.
    pub fn downloads_dir(&self, category: Category) -> PathBuf {
        self.root.join(DOWNLOADS_DIR).join(category.dir_name())
    }

    /// Root of the unpacked tree.
    pub fn tree_dir(&self) -> PathBuf {
        self.root.join(TREE_DIR)
    }

    /// Unpacked content of `category`.
    pub fn category_dir(&self, category: Category) -> PathBuf {
        self.tree_dir().join(category.dir_name())
    }

    /// Whether anything was staged for `category`.
    pub fn has_category(&self, category: Category) -> bool {
        self.category_dir(category).is_dir()
    }
}
