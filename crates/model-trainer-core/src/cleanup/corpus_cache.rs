use super::{CleanupError, CleanupResult, DiskSpaceProbe};
use crate::config::{CorpusCacheCleanupConfig, EvictionPolicy};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CorpusCacheCleanupResult {
    pub deleted_files: u64,
    pub bytes_freed: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    path: PathBuf,
    size: u64,
    accessed: SystemTime,
    modified: SystemTime,
}

/// Evicts cached corpus files until size and free-space thresholds hold.
///
/// Every file in the cache can be re-downloaded, so any of them may go.
pub struct CorpusCacheCleanupService {
    config: CorpusCacheCleanupConfig,
    cache_dir: PathBuf,
    disk: Arc<dyn DiskSpaceProbe>,
}

fn fail(path: &Path, operation: &'static str, e: &dyn std::fmt::Display) -> CleanupError {
    CleanupError::CorpusCache { path: path.to_path_buf(), operation, reason: e.to_string() }
}

impl CorpusCacheCleanupService {
    #[must_use]
    pub fn new(
        config: CorpusCacheCleanupConfig,
        cache_dir: PathBuf,
        disk: Arc<dyn DiskSpaceProbe>,
    ) -> Self {
        Self { config, cache_dir, disk }
    }

    pub fn clean(&self) -> CleanupResult<CorpusCacheCleanupResult> {
        let cfg = &self.config;
        if !cfg.enabled {
            info!(event = "corpus_cache_cleanup_skipped", reason = "disabled", "corpus cache cleanup skipped");
            return Ok(CorpusCacheCleanupResult::default());
        }

        let dir = &self.cache_dir;
        if !dir.exists() {
            info!(
                event = "corpus_cache_cleanup_completed",
                deleted_files = 0,
                bytes_freed = 0,
                reason = "directory_missing",
                "corpus cache directory missing"
            );
            return Ok(CorpusCacheCleanupResult::default());
        }
        if !dir.is_dir() {
            return Err(fail(dir, "inspect", &"corpus cache path is not a directory"));
        }

        info!(
            event = "corpus_cache_cleanup_started",
            path = %dir.display(),
            max_bytes = cfg.max_bytes,
            min_free_bytes = cfg.min_free_bytes,
            eviction_policy = %cfg.eviction_policy,
            "corpus cache cleanup started"
        );

        let mut free = self.disk.free_bytes(dir).map_err(|e| {
            error!(event = "corpus_cache_cleanup_failed", path = %dir.display(), error = %e, "disk usage unavailable");
            fail(dir, "disk_usage", &e)
        })?;
        let (mut entries, mut total) = scan(dir)?;

        let satisfied = |total: u64, free: u64| total <= cfg.max_bytes && free >= cfg.min_free_bytes;
        if satisfied(total, free) {
            info!(
                event = "corpus_cache_cleanup_completed",
                deleted_files = 0,
                bytes_freed = 0,
                total_bytes = total,
                free_bytes = free,
                "corpus cache within thresholds"
            );
            return Ok(CorpusCacheCleanupResult::default());
        }

        match cfg.eviction_policy {
            EvictionPolicy::Lru => entries.sort_by_key(|e| e.accessed),
            EvictionPolicy::Oldest => entries.sort_by_key(|e| e.modified),
        }

        let mut result = CorpusCacheCleanupResult::default();
        for entry in entries {
            if satisfied(total, free) {
                break;
            }
            std::fs::remove_file(&entry.path).map_err(|e| {
                error!(event = "corpus_cache_cleanup_failed", path = %entry.path.display(), error = %e, "failed to delete cached corpus");
                fail(&entry.path, "delete", &e)
            })?;
            result.deleted_files += 1;
            result.bytes_freed += entry.size;
            total = total.saturating_sub(entry.size);
            free = free.saturating_add(entry.size);
        }

        info!(
            event = "corpus_cache_cleanup_completed",
            deleted_files = result.deleted_files,
            bytes_freed = result.bytes_freed,
            total_bytes_after = total,
            free_bytes_after = free,
            "corpus cache cleanup completed"
        );
        Ok(result)
    }
}

/// Regular files directly inside `dir`, with their total size.
fn scan(dir: &Path) -> CleanupResult<(Vec<CacheEntry>, u64)> {
    let mut entries = Vec::new();
    let mut total = 0;
    let read = std::fs::read_dir(dir).map_err(|e| fail(dir, "scan", &e))?;
    for dirent in read {
        let dirent = dirent.map_err(|e| fail(dir, "scan", &e))?;
        let path = dirent.path();
        let meta = dirent.metadata().map_err(|e| fail(&path, "stat", &e))?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().map_err(|e| fail(&path, "stat", &e))?;
        let accessed = meta.accessed().unwrap_or(modified);
        total += meta.len();
        entries.push(CacheEntry { path, size: meta.len(), accessed, modified });
    }
    Ok((entries, total))
}
