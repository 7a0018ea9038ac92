use super::{dir_stats, CleanupError, CleanupResult};
use crate::config::ArtifactCleanupConfig;
use crate::store::SharedState;
use model_trainer_training::{is_terminal_status_str, keys, MANIFEST_FILE};
use serde::Serialize;
use std::path::Path;
use tracing::{error, info};

/// Why a run directory was left in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    CleanupDisabled,
    DirectoryNotFound,
    UploadNotVerified,
    RunNotTerminal,
    DryRun,
}

impl SkipReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CleanupDisabled => "cleanup_disabled",
            Self::DirectoryNotFound => "directory_not_found",
            Self::UploadNotVerified => "upload_not_verified",
            Self::RunNotTerminal => "run_not_terminal",
            Self::DryRun => "dry_run",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactCleanupResult {
    pub run_id: String,
    pub deleted: bool,
    pub bytes_freed: u64,
    pub files_deleted: u64,
    pub reason: Option<SkipReason>,
}

impl ArtifactCleanupResult {
    fn skipped(run_id: &str, reason: SkipReason) -> Self {
        Self { run_id: run_id.to_string(), deleted: false, bytes_freed: 0, files_deleted: 0, reason: Some(reason) }
    }
}

/// Deletes a run's local artifacts once they are safely uploaded.
///
/// Gates are checked in order: enabled, directory present, upload recorded
/// (when `verify_upload`), run terminal. A failed gate is a reason-coded
/// result rather than an error.
///
/// Everything under the run directory goes except the run manifest, which
/// tokenizer cleanup and evaluation still read after the upload.
#[derive(Debug, Clone)]
pub struct ArtifactCleanupService {
    config: ArtifactCleanupConfig,
    state: SharedState,
}

impl ArtifactCleanupService {
    #[must_use]
    pub fn new(config: ArtifactCleanupConfig, state: SharedState) -> Self {
        Self { config, state }
    }

    pub async fn cleanup_run_artifacts(
        &self,
        run_id: &str,
        artifact_dir: &Path,
    ) -> CleanupResult<ArtifactCleanupResult> {
        let cfg = &self.config;
        if !cfg.enabled {
            return Ok(skip(run_id, SkipReason::CleanupDisabled));
        }
        if !artifact_dir.exists() {
            return Ok(skip(run_id, SkipReason::DirectoryNotFound));
        }

        if cfg.verify_upload {
            let file_id = self.state.get_string(&keys::artifact_file_id(run_id)).await?;
            if file_id.as_deref().is_none_or(|id| id.trim().is_empty()) {
                return Ok(skip(run_id, SkipReason::UploadNotVerified));
            }
        }

        let status = self.state.get_string(&keys::run_status(run_id)).await?;
        if !status.as_deref().is_some_and(is_terminal_status_str) {
            return Ok(skip(run_id, SkipReason::RunNotTerminal));
        }

        let grace = cfg.grace_period();
        if !grace.is_zero() {
            info!(run_id, grace_seconds = cfg.grace_period_seconds, "waiting grace period before cleanup");
            tokio::time::sleep(grace).await;
        }

        let (bytes, files) = prunable_stats(artifact_dir).map_err(|e| CleanupError::Artifact {
            path: artifact_dir.to_path_buf(),
            operation: "measure",
            reason: e.to_string(),
        })?;

        if cfg.dry_run {
            info!(event = "cleanup_dry_run", run_id, path = %artifact_dir.display(), bytes, files, "dry run, nothing deleted");
            return Ok(skip(run_id, SkipReason::DryRun));
        }

        prune_run_dir(artifact_dir).await.map_err(|e| {
            error!(event = "cleanup_failed", run_id, path = %artifact_dir.display(), error = %e, "failed to delete artifacts");
            CleanupError::Artifact { path: artifact_dir.to_path_buf(), operation: "delete", reason: e.to_string() }
        })?;

        info!(event = "cleanup_completed", run_id, path = %artifact_dir.display(), bytes_freed = bytes, files_deleted = files, "artifacts deleted");
        Ok(ArtifactCleanupResult {
            run_id: run_id.to_string(),
            deleted: true,
            bytes_freed: bytes,
            files_deleted: files,
            reason: None,
        })
    }
}

fn skip(run_id: &str, reason: SkipReason) -> ArtifactCleanupResult {
    info!(event = "cleanup_skipped", run_id, reason = reason.as_str(), "artifact cleanup skipped");
    ArtifactCleanupResult::skipped(run_id, reason)
}

/// Size and file count of everything [`prune_run_dir`] would remove.
fn prunable_stats(run_dir: &Path) -> std::io::Result<(u64, u64)> {
    let (mut bytes, mut files) = dir_stats(run_dir)?;
    let manifest = run_dir.join(MANIFEST_FILE);
    if manifest.is_file() {
        bytes = bytes.saturating_sub(std::fs::metadata(&manifest)?.len());
        files = files.saturating_sub(1);
    }
    Ok((bytes, files))
}

/// Remove every entry of `run_dir` except the run manifest.
async fn prune_run_dir(run_dir: &Path) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(run_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_dir = entry.file_type().await?.is_dir();
        if is_dir {
            tokio::fs::remove_dir_all(&path).await?;
        } else if entry.file_name() != MANIFEST_FILE {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}
