//! Content fingerprinting
//!
//! Hashes files and file trees into stable cache keys. A fingerprint is
//! recomputed in full on every invocation and compared by equality; it is the
//! only signal used to decide whether an input changed.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::FingerprintError;

/// Hash recorded for zero-length files, distinct from an absent entry
pub const EMPTY_FILE_HASH: &str = "empty";

/// Mapping of path to content hash for a set of inputs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileSetFingerprint(BTreeMap<String, String>);

impl FileSetFingerprint {
    /// Fingerprint every file under `paths`, expanding directories recursively.
    ///
    /// A path that does not exist, or disappears while being scanned, is an
    /// error: skipping it could turn a torn scan into a false cache hit.
    pub fn compute<P: AsRef<Path>>(paths: &[P]) -> Result<Self, FingerprintError> {
        let mut hashes = BTreeMap::new();

        for root in paths {
            let root = root.as_ref();
            let metadata = std::fs::metadata(root).map_err(|source| FingerprintError::Io {
                path: root.to_path_buf(),
                source,
            })?;

            if metadata.is_dir() {
                for entry in walkdir::WalkDir::new(root).follow_links(true) {
                    let entry = entry.map_err(|e| FingerprintError::Io {
                        path: e.path().map_or_else(|| root.to_path_buf(), Path::to_path_buf),
                        source: io::Error::from(e),
                    })?;
                    if entry.file_type().is_file() {
                        let hash = hash_file(entry.path())?;
                        hashes.insert(entry.path().display().to_string(), hash);
                    }
                }
            } else {
                hashes.insert(root.display().to_string(), hash_file(root)?);
            }
        }

        Ok(Self(hashes))
    }

    /// Number of fingerprinted files
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no files were fingerprinted
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Hash recorded for a path
    pub fn get(&self, path: &str) -> Option<&str> {
        self.0.get(path).map(String::as_str)
    }

    /// Iterate over `(path, hash)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl FromIterator<(String, String)> for FileSetFingerprint {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// SHA256 of a file's contents, or [`EMPTY_FILE_HASH`] for an empty file
pub fn hash_file(path: &Path) -> Result<String, FingerprintError> {
    let io_err = |source: io::Error| FingerprintError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(io_err)?;
    let mut hasher = Sha256::new();
    let copied = io::copy(&mut file, &mut hasher).map_err(io_err)?;

    if copied == 0 {
        return Ok(EMPTY_FILE_HASH.to_string());
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Fingerprint of a previously written artifact, `None` when it is missing
pub fn artifact_fingerprint(path: &Path) -> Result<Option<String>, FingerprintError> {
    if !path.exists() {
        return Ok(None);
    }
    hash_file(path).map(Some)
}

/// Resolve a possibly relative path against a base directory
pub fn absolute(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
