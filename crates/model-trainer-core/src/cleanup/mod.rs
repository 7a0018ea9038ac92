//! Out-of-band eviction of local caches and uploaded artifacts.
//!
//! Each pass is idempotent and all-or-nothing: the first filesystem error
//! aborts the pass with a [`CleanupError`] carrying the path and operation.

mod artifact;
mod corpus_cache;
mod tokenizer;

pub use artifact::{ArtifactCleanupResult, ArtifactCleanupService, SkipReason};
pub use corpus_cache::{CorpusCacheCleanupResult, CorpusCacheCleanupService};
pub use tokenizer::{TokenizerCleanupResult, TokenizerCleanupService};

use std::path::{Path, PathBuf};
use sysinfo::Disks;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("corpus cache cleanup failed: {operation} {path}: {reason}")]
    CorpusCache { path: PathBuf, operation: &'static str, reason: String },

    #[error("tokenizer cleanup failed: {operation} {path}: {reason}")]
    Tokenizer { path: PathBuf, operation: &'static str, reason: String },

    #[error("artifact cleanup failed: {operation} {path}: {reason}")]
    Artifact { path: PathBuf, operation: &'static str, reason: String },

    #[error("artifact cleanup state lookup failed: {0}")]
    State(#[from] crate::store::StoreError),
}

pub type CleanupResult<T> = std::result::Result<T, CleanupError>;

/// Source of free-space figures for the filesystem holding a path.
pub trait DiskSpaceProbe: Send + Sync {
    fn free_bytes(&self, path: &Path) -> std::io::Result<u64>;
}

/// Reads free space from the mounted disk whose mount point is the longest
/// prefix of the (canonicalized) path.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDiskProbe;

impl DiskSpaceProbe for SystemDiskProbe {
    fn free_bytes(&self, path: &Path) -> std::io::Result<u64> {
        let path = path.canonicalize()?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(sysinfo::Disk::available_space)
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no mounted disk contains {}", path.display()),
                )
            })
    }
}

/// Fixed free-space answer.
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct FixedDiskProbe(pub u64);

#[cfg(test)]
impl DiskSpaceProbe for FixedDiskProbe {
    fn free_bytes(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.0)
    }
}

/// Total size and file count under `path`, recursively.
pub(crate) fn dir_stats(path: &Path) -> std::io::Result<(u64, u64)> {
    let mut bytes = 0;
    let mut files = 0;
    for entry in WalkDir::new(path) {
        let entry = entry?;
        if entry.file_type().is_file() {
            bytes += entry.metadata()?.len();
            files += 1;
        }
    }
    Ok((bytes, files))
}
