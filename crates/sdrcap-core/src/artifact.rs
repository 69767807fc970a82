//! Artifact references with content digests.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Files larger than this are referenced without a digest.
pub const DIGEST_SIZE_CAP: u64 = 50_000_000;

/// A file produced by a device process, referenced from a device outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRef {
    pub path: PathBuf,
    /// Size at capture time; None if the file was missing or unreadable.
    pub size_bytes: Option<u64>,
    /// SHA-256 hex digest; None when missing, unreadable, or above the cap.
    pub sha256: Option<String>,
}

impl ArtifactRef {
    /// Record a reference to `path`, hashing it when feasible.
    ///
    /// Never fails: a missing or unreadable file is still a valid
    /// reference, just without size or digest.
    pub fn capture(path: &Path) -> Self {
        let size_bytes = std::fs::metadata(path).ok().map(|m| m.len());
        let sha256 = match size_bytes {
            Some(len) if len <= DIGEST_SIZE_CAP => sha256_file(path),
            _ => None,
        };
        Self {
            path: path.to_path_buf(),
            size_bytes,
            sha256,
        }
    }

    /// Reference a path without touching the filesystem (remote artifacts
    /// before retrieval).
    pub fn unresolved(path: PathBuf) -> Self {
        Self {
            path,
            size_bytes: None,
            sha256: None,
        }
    }
}

fn sha256_file(path: &Path) -> Option<String> {
    let data = std::fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Some(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn capture_hashes_small_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture_1.iq");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"iq-bytes").unwrap();

        let artifact = ArtifactRef::capture(&path);
        assert_eq!(artifact.size_bytes, Some(8));
        let digest = artifact.sha256.expect("digest");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn capture_of_missing_file_is_unresolved() {
        let artifact = ArtifactRef::capture(Path::new("/no/such/capture.iq"));
        assert!(artifact.size_bytes.is_none());
        assert!(artifact.sha256.is_none());
    }

    #[test]
    fn same_content_same_digest() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.iq");
        let b = dir.path().join("b.iq");
        std::fs::write(&a, b"pulse").unwrap();
        std::fs::write(&b, b"pulse").unwrap();
        assert_eq!(ArtifactRef::capture(&a).sha256, ArtifactRef::capture(&b).sha256);
    }
}
