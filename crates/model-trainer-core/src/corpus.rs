//! Cache-aside corpus fetching keyed by artifact store file id.

use crate::transfer::{DownloadOptions, TransferClient, TransferError, TransferResult};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Downloads corpus files into a local cache directory.
///
/// A cached file is `{cache_dir}/{file_id}.txt`. Partial downloads live in
/// `{cache_dir}/{file_id}.tmp` and are resumed on the next fetch; the rename
/// into place happens only after size and hash checks pass. A temp file that
/// fails those checks is deleted so the next fetch starts over.
#[derive(Debug, Clone)]
pub struct CorpusFetcher {
    client: TransferClient,
    cache_dir: PathBuf,
}

impl CorpusFetcher {
    #[must_use]
    pub fn new(client: TransferClient, cache_dir: PathBuf) -> Self {
        Self { client, cache_dir }
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    #[must_use]
    pub fn cache_path(&self, file_id: &str) -> PathBuf {
        self.cache_dir.join(format!("{file_id}.txt"))
    }

    #[must_use]
    pub fn temp_path(&self, file_id: &str) -> PathBuf {
        self.cache_dir.join(format!("{file_id}.tmp"))
    }

    /// Return the local path of `file_id`, downloading it on a cache miss.
    pub async fn fetch(&self, file_id: &str) -> TransferResult<PathBuf> {
        let cache_path = self.cache_path(file_id);
        if tokio::fs::try_exists(&cache_path).await? {
            debug!(file_id, path = %cache_path.display(), "corpus cache hit");
            return Ok(cache_path);
        }

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let temp_path = self.temp_path(file_id);
        let head = match self.client.download_to_path(file_id, &temp_path, DownloadOptions::default()).await {
            Ok(head) => head,
            Err(e @ (TransferError::Integrity(_) | TransferError::RangeNotSatisfiable(_))) => {
                discard_temp(file_id, &temp_path).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let actual = tokio::fs::metadata(&temp_path).await?.len();
        if actual != head.size {
            discard_temp(file_id, &temp_path).await;
            return Err(TransferError::Integrity(format!(
                "size mismatch: expected {}, got {actual}",
                head.size
            )));
        }

        tokio::fs::rename(&temp_path, &cache_path).await?;
        info!(file_id, size = head.size, path = %cache_path.display(), "corpus fetched");
        Ok(cache_path)
    }
}

async fn discard_temp(file_id: &str, temp_path: &Path) {
    match tokio::fs::remove_file(temp_path).await {
        Ok(()) => info!(file_id, path = %temp_path.display(), "discarded unusable partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(file_id, path = %temp_path.display(), error = %e, "failed to remove partial download"),
    }
}
