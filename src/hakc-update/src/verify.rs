//! SHA256 digests of staged and live files.

use sha2::{Digest, Sha256};
use std::io::{self, Read};
use std::path::Path;
use tokio::io::AsyncReadExt;

use crate::error::FetchError;

/// Verify the SHA256 checksum of a downloaded file.
pub async fn verify_sha256(path: &Path, expected: &str) -> Result<(), FetchError> {
    let actual = calculate_sha256(path).await?;

    // Normalize expected (remove any whitespace, lowercase)
    let expected = expected.trim().to_lowercase();

    if actual != expected {
        return Err(FetchError::ChecksumMismatch { expected, actual });
    }

    Ok(())
}

/// Calculate the SHA256 hash of a file.
pub async fn calculate_sha256(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Calculate the SHA256 hash of a file synchronously, for use on the
/// blocking pool.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash of a list of `(relative path, file digest)` pairs. The list must be
/// sorted by path.
pub fn tree_digest<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut hasher = Sha256::new();
    for (path, digest) in entries {
        hasher.update(path.as_bytes());
        hasher.update([0]);
        hasher.update(digest.as_bytes());
        hasher.update([b'\n']);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[tokio::test]
    async fn test_verify_sha256() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "hello world").unwrap();

        assert!(verify_sha256(file.path(), HELLO_WORLD).await.is_ok());
        assert!(
            verify_sha256(file.path(), &format!("  {}\n", HELLO_WORLD.to_uppercase()))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_verify_sha256_mismatch() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "hello world").unwrap();

        let result = verify_sha256(file.path(), &"0".repeat(64)).await;
        assert!(matches!(result, Err(FetchError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_sync_and_async_agree() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "hello world").unwrap();
        assert_eq!(sha256_file(file.path()).unwrap(), HELLO_WORLD);
    }

    #[test]
    fn test_tree_digest_depends_on_paths() {
        let a = tree_digest([("a.txt", "11"), ("b.txt", "22")]);
        let b = tree_digest([("a.txt", "11"), ("c.txt", "22")]);
        assert_ne!(a, b);
        assert_eq!(a, tree_digest([("a.txt", "11"), ("b.txt", "22")]));
    }
}
