//! Packing run directories into tar archives and moving them through the
//! artifact store.

use crate::config::DataBankConfig;
use crate::transfer::{DownloadOptions, TransferClient, TransferError};
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("data bank configuration missing")]
    NotConfigured,

    #[error("artifact directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("unexpected archive layout: {0}")]
    Layout(String),

    #[error("destination already exists: {0}")]
    DestinationExists(PathBuf),

    #[error("invalid file id: {0}")]
    InvalidFileId(String),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("artifact io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive task failed: {0}")]
    Task(String),
}

pub type ArtifactResult<T> = std::result::Result<T, ArtifactError>;

fn ensure_configured(cfg: &DataBankConfig) -> ArtifactResult<()> {
    if cfg.url.trim().is_empty() || cfg.api_key.trim().is_empty() {
        return Err(ArtifactError::NotConfigured);
    }
    Ok(())
}

/// Archive name used for a run's model directory.
#[must_use]
pub fn model_archive_name(run_id: &str) -> String {
    format!("model-{run_id}")
}

/// Write every file under `dir` into a tar at `out`, rooted at `name/`.
///
/// Entries are added in sorted path order so identical trees give identical archives.
pub fn write_dir_tar(dir: &Path, name: &str, out: &Path) -> ArtifactResult<u64> {
    let file = File::create(out)?;
    let mut builder = tar::Builder::new(file);
    let mut count = 0;
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| ArtifactError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| ArtifactError::Layout(e.to_string()))?;
        builder.append_path_with_name(entry.path(), Path::new(name).join(rel))?;
        count += 1;
    }
    builder.into_inner()?.sync_all()?;
    Ok(count)
}

/// Top-level names of every entry in the tar at `path`.
fn archive_roots(path: &Path) -> ArtifactResult<BTreeSet<String>> {
    let mut archive = tar::Archive::new(File::open(path)?);
    let mut roots = BTreeSet::new();
    for entry in archive.entries()? {
        let entry = entry?;
        let entry_path = entry.path()?;
        let first = entry_path.components().find_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        });
        if let Some(root) = first {
            roots.insert(root);
        }
    }
    Ok(roots)
}

/// Uploads run directories as tar archives.
#[derive(Debug, Clone)]
pub struct ArtifactUploader {
    client: TransferClient,
}

impl ArtifactUploader {
    pub fn from_config(cfg: &DataBankConfig) -> ArtifactResult<Self> {
        ensure_configured(cfg)?;
        Ok(Self { client: TransferClient::from_config(cfg)? })
    }

    #[must_use]
    pub fn new(client: TransferClient) -> Self {
        Self { client }
    }

    /// Archive `dir` under a top-level folder `name` and upload it as `{name}.tar`.
    ///
    /// Returns the file id assigned by the store.
    pub async fn upload_dir(&self, dir: &Path, name: &str, request_id: &str) -> ArtifactResult<String> {
        if !dir.is_dir() {
            return Err(ArtifactError::DirectoryNotFound(dir.to_path_buf()));
        }

        let tmp = tempfile::Builder::new().prefix("artifact_").suffix(".tar").tempfile()?;
        let tar_path = tmp.path().to_path_buf();
        let (src, arc_name, out) = (dir.to_path_buf(), name.to_string(), tar_path.clone());
        let files = tokio::task::spawn_blocking(move || write_dir_tar(&src, &arc_name, &out))
            .await
            .map_err(|e| ArtifactError::Task(e.to_string()))??;

        let result = self
            .client
            .upload_file(&tar_path, &format!("{name}.tar"), "application/x-tar", Some(request_id))
            .await?;
        if let Err(e) = tmp.close() {
            warn!(error = %e, "failed to remove temporary archive");
        }

        info!(
            dir = %dir.display(),
            files,
            file_id = %result.file_id,
            size = result.size,
            "artifact uploaded"
        );
        Ok(result.file_id)
    }
}

/// Downloads model archives and unpacks them into a models directory.
#[derive(Debug, Clone)]
pub struct ArtifactDownloader {
    client: TransferClient,
}

impl ArtifactDownloader {
    pub fn from_config(cfg: &DataBankConfig) -> ArtifactResult<Self> {
        ensure_configured(cfg)?;
        Ok(Self { client: TransferClient::from_config(cfg)? })
    }

    #[must_use]
    pub fn new(client: TransferClient) -> Self {
        Self { client }
    }

    /// Download `file_id` and unpack it to `{target_root}/{run_id}`.
    ///
    /// The archive must contain exactly one top-level directory
    /// `model-{run_id}`, and the destination must not exist yet.
    pub async fn download_and_extract(
        &self,
        file_id: &str,
        run_id: &str,
        target_root: &Path,
    ) -> ArtifactResult<PathBuf> {
        let fid = file_id.trim();
        if fid.is_empty() {
            return Err(ArtifactError::InvalidFileId("file_id must be non-empty".to_string()));
        }

        let tmp = tempfile::Builder::new().prefix("model_artifact_").suffix(".tar").tempfile()?;
        let tar_path = tmp.path().to_path_buf();
        let opts = DownloadOptions { resume: false, verify_hash: true, request_id: Some(run_id) };
        self.client.download_to_path(fid, &tar_path, opts).await?;

        let (run, root) = (run_id.to_string(), target_root.to_path_buf());
        let dest = tokio::task::spawn_blocking(move || unpack_model_archive(&tar_path, &run, &root))
            .await
            .map_err(|e| ArtifactError::Task(e.to_string()))??;
        drop(tmp);

        info!(file_id = fid, run_id, dest = %dest.display(), "artifact extracted");
        Ok(dest)
    }
}

fn unpack_model_archive(tar_path: &Path, run_id: &str, target_root: &Path) -> ArtifactResult<PathBuf> {
    let expected_root = model_archive_name(run_id);
    let roots = archive_roots(tar_path)?;
    let mut iter = roots.iter();
    let root = match (iter.next(), iter.next()) {
        (Some(root), None) => root,
        _ => return Err(ArtifactError::Layout(format!("expected one top-level directory, found {}", roots.len()))),
    };
    if *root != expected_root {
        return Err(ArtifactError::Layout(format!(
            "unexpected archive root '{root}', expected '{expected_root}'"
        )));
    }

    let dest = target_root.join(run_id);
    if dest.exists() {
        return Err(ArtifactError::DestinationExists(dest));
    }

    std::fs::create_dir_all(target_root)?;
    tar::Archive::new(File::open(tar_path)?).unpack(target_root)?;

    let extracted = target_root.join(&expected_root);
    if !extracted.is_dir() {
        return Err(ArtifactError::Layout("extracted model directory missing after unpack".to_string()));
    }
    std::fs::rename(&extracted, &dest)?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_run(root: &Path) -> PathBuf {
        let dir = root.join("run");
        std::fs::create_dir_all(dir.join("eval")).unwrap();
        std::fs::write(dir.join("weights.bin"), b"weights").unwrap();
        std::fs::write(dir.join("eval").join("metrics.json"), b"{}").unwrap();
        dir
    }

    #[test]
    fn test_write_dir_tar_roots_entries_under_name() {
        let temp = TempDir::new().unwrap();
        let dir = sample_run(temp.path());
        let out = temp.path().join("a.tar");

        let files = write_dir_tar(&dir, "model-r1", &out).unwrap();
        assert_eq!(files, 2);

        let roots = archive_roots(&out).unwrap();
        assert_eq!(roots.into_iter().collect::<Vec<_>>(), vec!["model-r1".to_string()]);
    }

    #[test]
    fn test_unpack_model_archive_renames_to_run_id() {
        let temp = TempDir::new().unwrap();
        let dir = sample_run(temp.path());
        let out = temp.path().join("a.tar");
        write_dir_tar(&dir, "model-r1", &out).unwrap();

        let target = temp.path().join("models");
        let dest = unpack_model_archive(&out, "r1", &target).unwrap();
        assert_eq!(dest, target.join("r1"));
        assert_eq!(std::fs::read(dest.join("weights.bin")).unwrap(), b"weights");
        assert!(dest.join("eval").join("metrics.json").is_file());
        assert!(!target.join("model-r1").exists());

        let again = unpack_model_archive(&out, "r1", &target);
        assert!(matches!(again, Err(ArtifactError::DestinationExists(_))));
    }

    #[test]
    fn test_unpack_rejects_wrong_root() {
        let temp = TempDir::new().unwrap();
        let dir = sample_run(temp.path());
        let out = temp.path().join("a.tar");
        write_dir_tar(&dir, "model-other", &out).unwrap();

        let result = unpack_model_archive(&out, "r1", &temp.path().join("models"));
        assert!(matches!(result, Err(ArtifactError::Layout(_))));
        assert!(!temp.path().join("models").join("r1").exists());
    }

    #[test]
    fn test_from_config_requires_credentials() {
        let cfg = DataBankConfig { api_key: String::new(), ..DataBankConfig::default() };
        assert!(matches!(ArtifactUploader::from_config(&cfg), Err(ArtifactError::NotConfigured)));
        assert!(matches!(ArtifactDownloader::from_config(&cfg), Err(ArtifactError::NotConfigured)));
    }
}
