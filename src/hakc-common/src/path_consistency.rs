//! Path helpers for volumes whose filesystem ignores case.
//!
//! SD cards are FAT formatted: `firmware` and `FIRMWARE` are the same
//! directory on the device, but a Linux host mounts them case-sensitively.
//! Lookups here always fall back to a case-insensitive scan so that an
//! existing directory is reused instead of a sibling being created.

use std::io;
use std::path::{Component, Path, PathBuf};

/// Find an entry named `name` in `dir`, ignoring ASCII case.
///
/// Exact matches win. Returns `Ok(None)` when `dir` does not exist.
pub fn find_entry_case_insensitive(
    dir: impl AsRef<Path>,
    name: &str,
) -> io::Result<Option<PathBuf>> {
    let dir = dir.as_ref();

    let exact = dir.join(name);
    if exact.symlink_metadata().is_ok() {
        return Ok(Some(exact));
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut matches: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Some(entry_name) = entry.file_name().to_str() {
            if entry_name.eq_ignore_ascii_case(name) {
                matches.push(entry.path());
            }
        }
    }
    // read_dir order is unspecified; keep the choice stable.
    matches.sort();
    Ok(matches.into_iter().next())
}

/// Whether `path` is `root` or lies beneath it.
///
/// Both paths are canonicalised when they exist; otherwise the comparison is
/// lexical after removing `.` components.
pub fn is_inside(path: &Path, root: &Path) -> bool {
    let path = canonical_or_lexical(path);
    let root = canonical_or_lexical(root);
    path.starts_with(&root)
}

fn canonical_or_lexical(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    // Canonicalise the deepest existing ancestor and append the rest.
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match existing.file_name() {
            Some(name) => tail.push(name.to_os_string()),
            None => break,
        }
        if !existing.pop() {
            break;
        }
    }
    let mut base = existing.canonicalize().unwrap_or(existing);
    for part in tail.into_iter().rev() {
        base.push(part);
    }
    base.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}
