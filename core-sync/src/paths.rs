//! Storage path helpers.
//!
//! Origin paths look like `bucket/dir/file.png`. A trailing `/` marks a
//! folder. Local cache files are named after the SHA-256 of the full path,
//! so any origin path maps to a flat, filesystem-safe name.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

/// Whether the path denotes a folder rather than a leaf file.
pub fn is_folder(path: &str) -> bool {
    path.ends_with('/')
}

/// Parent folder of a path, with the folder marker re-appended.
///
/// `bucket/dir/file` yields `bucket/dir/`, `bucket/dir/` yields `bucket/`,
/// and a path with no separator has no parent.
pub fn parent_folder(path: &str) -> Option<&str> {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    trimmed.rfind('/').map(|idx| &path[..=idx])
}

/// Check that `path` is a well-formed `bucket/object` storage path.
///
/// Rejects empty buckets, absolute paths, empty inner segments and
/// `.`/`..` segments. `bucket/` on its own is accepted as the bucket root
/// folder.
pub fn validate_storage_path(path: &str) -> Result<()> {
    let invalid = |reason: &str| SyncError::InvalidPath(format!("{:?}: {}", path, reason));

    if path.is_empty() {
        return Err(invalid("path is empty"));
    }
    if path.starts_with('/') {
        return Err(invalid("path must not start with '/'"));
    }
    if path.contains('\0') {
        return Err(invalid("path contains a NUL byte"));
    }

    let Some((bucket, object)) = path.split_once('/') else {
        return Err(invalid("path has no bucket"));
    };
    if bucket.is_empty() {
        return Err(invalid("bucket is empty"));
    }

    let object = object.strip_suffix('/').unwrap_or(object);
    if object.is_empty() {
        return Ok(());
    }
    for segment in object.split('/') {
        match segment {
            "" => return Err(invalid("path contains an empty segment")),
            "." | ".." => return Err(invalid("path contains a relative segment")),
            _ => {}
        }
    }

    Ok(())
}

/// Local file name for a storage path: lowercase hex SHA-256 of the path.
pub fn cache_file_name(path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Smallest string greater than every string starting with `prefix`.
///
/// Used as the exclusive upper bound of a range scan. Returns `None` when no
/// such bound exists (empty prefix), meaning the scan is unbounded above.
pub fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let mut next = last as u32 + 1;
        while next <= char::MAX as u32 {
            if let Some(c) = char::from_u32(next) {
                chars.push(c);
                return Some(chars.into_iter().collect());
            }
            next += 1;
        }
    }
    None
}

/// Where cached and in-progress files live on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    cache_dir: PathBuf,
    download_dir: PathBuf,
}

impl CacheLayout {
    pub fn new(cache_dir: impl Into<PathBuf>, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            download_dir: download_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Promoted location of `file_path`.
    pub fn cache_path(&self, file_path: &str) -> PathBuf {
        self.cache_dir.join(cache_file_name(file_path))
    }

    /// Staging location of `file_path` while it downloads.
    pub fn staging_path(&self, file_path: &str) -> PathBuf {
        self.download_dir.join(cache_file_name(file_path))
    }
}
