use super::{dir_stats, CleanupError, CleanupResult};
use crate::config::TokenizerCleanupConfig;
use model_trainer_training::{referenced_tokenizer_ids, ArtifactLayout};
use serde::Serialize;
use std::path::Path;
use std::time::SystemTime;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TokenizerCleanupResult {
    pub deleted_tokenizers: u64,
    pub bytes_freed: u64,
}

fn fail(path: &Path, operation: &'static str, e: &dyn std::fmt::Display) -> CleanupError {
    CleanupError::Tokenizer { path: path.to_path_buf(), operation, reason: e.to_string() }
}

/// Removes tokenizer directories that no run manifest references.
///
/// A tokenizer named by any `models/*/manifest.json` is never deleted, and an
/// unreferenced one is kept until its directory is older than `min_unused_days`.
pub struct TokenizerCleanupService {
    config: TokenizerCleanupConfig,
    layout: ArtifactLayout,
}

impl TokenizerCleanupService {
    #[must_use]
    pub fn new(config: TokenizerCleanupConfig, layout: ArtifactLayout) -> Self {
        Self { config, layout }
    }

    pub fn clean(&self) -> CleanupResult<TokenizerCleanupResult> {
        self.clean_at(SystemTime::now())
    }

    /// Run a pass treating `now` as the current time.
    pub fn clean_at(&self, now: SystemTime) -> CleanupResult<TokenizerCleanupResult> {
        if !self.config.enabled {
            info!(event = "tokenizer_cleanup_skipped", reason = "disabled", "tokenizer cleanup skipped");
            return Ok(TokenizerCleanupResult::default());
        }

        let root = self.layout.tokenizers_dir();
        if !root.exists() {
            info!(
                event = "tokenizer_cleanup_completed",
                deleted_tokenizers = 0,
                bytes_freed = 0,
                reason = "directory_missing",
                "tokenizers directory missing"
            );
            return Ok(TokenizerCleanupResult::default());
        }
        if !root.is_dir() {
            return Err(fail(&root, "inspect", &"tokenizers path is not a directory"));
        }

        let models_dir = self.layout.models_dir();
        let in_use = referenced_tokenizer_ids(&models_dir).map_err(|e| {
            error!(event = "tokenizer_cleanup_manifest_error", path = %models_dir.display(), error = %e, "failed to read run manifests");
            fail(&models_dir, "read_manifests", &e)
        })?;
        let min_age = self.config.min_age();

        info!(
            event = "tokenizer_cleanup_started",
            tokenizers_root = %root.display(),
            min_unused_days = self.config.min_unused_days,
            in_use_count = in_use.len(),
            "tokenizer cleanup started"
        );

        let mut result = TokenizerCleanupResult::default();
        let read = std::fs::read_dir(&root).map_err(|e| fail(&root, "scan", &e))?;
        for entry in read {
            let entry = entry.map_err(|e| fail(&root, "scan", &e))?;
            let path = entry.path();
            let meta = entry.metadata().map_err(|e| fail(&path, "stat", &e))?;
            if !meta.is_dir() {
                continue;
            }
            let tokenizer_id = entry.file_name().to_string_lossy().into_owned();
            if in_use.contains(&tokenizer_id) {
                continue;
            }
            let modified = meta.modified().map_err(|e| fail(&path, "stat", &e))?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age < min_age {
                continue;
            }

            let (bytes, _) = dir_stats(&path).map_err(|e| fail(&path, "measure", &e))?;
            std::fs::remove_dir_all(&path).map_err(|e| {
                error!(event = "tokenizer_cleanup_failed", tokenizer_id = %tokenizer_id, path = %path.display(), error = %e, "failed to delete tokenizer");
                fail(&path, "delete", &e)
            })?;
            info!(tokenizer_id = %tokenizer_id, bytes, "tokenizer deleted");
            result.deleted_tokenizers += 1;
            result.bytes_freed += bytes;
        }

        info!(
            event = "tokenizer_cleanup_completed",
            deleted_tokenizers = result.deleted_tokenizers,
            bytes_freed = result.bytes_freed,
            "tokenizer cleanup completed"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(86_400);

    fn setup() -> (TempDir, ArtifactLayout) {
        let temp = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(temp.path().to_path_buf());
        (temp, layout)
    }

    fn make_tokenizer(layout: &ArtifactLayout, id: &str, bytes: &[u8]) {
        let dir = layout.tokenizers_dir().join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("tokenizer.json"), bytes).unwrap();
    }

    fn reference(layout: &ArtifactLayout, run: &str, tokenizer_id: &str) {
        let dir = layout.models_dir().join(run);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("manifest.json"), format!(r#"{{"tokenizer_id":"{tokenizer_id}"}}"#))
            .unwrap();
    }

    fn cfg(min_unused_days: u32) -> TokenizerCleanupConfig {
        TokenizerCleanupConfig { enabled: true, min_unused_days }
    }

    #[test]
    fn test_disabled_is_noop() {
        let (_temp, layout) = setup();
        make_tokenizer(&layout, "tok-a", b"x");
        let svc = TokenizerCleanupService::new(TokenizerCleanupConfig { enabled: false, min_unused_days: 0 }, layout.clone());
        assert_eq!(svc.clean().unwrap(), TokenizerCleanupResult::default());
        assert!(layout.tokenizers_dir().join("tok-a").exists());
    }

    #[test]
    fn test_missing_directory_is_noop() {
        let (_temp, layout) = setup();
        let svc = TokenizerCleanupService::new(cfg(0), layout);
        assert_eq!(svc.clean().unwrap(), TokenizerCleanupResult::default());
    }

    #[test]
    fn test_referenced_tokenizer_is_kept() {
        let (_temp, layout) = setup();
        make_tokenizer(&layout, "tok-used", b"used");
        make_tokenizer(&layout, "tok-free", b"12345");
        reference(&layout, "gpt2-small-1", "tok-used");

        let svc = TokenizerCleanupService::new(cfg(0), layout.clone());
        let result = svc.clean_at(SystemTime::now() + DAY).unwrap();

        assert_eq!(result, TokenizerCleanupResult { deleted_tokenizers: 1, bytes_freed: 5 });
        assert!(layout.tokenizers_dir().join("tok-used").exists());
        assert!(!layout.tokenizers_dir().join("tok-free").exists());
    }

    #[test]
    fn test_recent_tokenizer_is_kept() {
        let (_temp, layout) = setup();
        make_tokenizer(&layout, "tok-new", b"x");

        let svc = TokenizerCleanupService::new(cfg(30), layout.clone());
        let result = svc.clean_at(SystemTime::now() + 29 * DAY).unwrap();
        assert_eq!(result.deleted_tokenizers, 0);
        assert!(layout.tokenizers_dir().join("tok-new").exists());

        let result = svc.clean_at(SystemTime::now() + 31 * DAY).unwrap();
        assert_eq!(result.deleted_tokenizers, 1);
        assert!(!layout.tokenizers_dir().join("tok-new").exists());
    }

    #[test]
    fn test_unreadable_manifest_aborts_without_deleting() {
        let (_temp, layout) = setup();
        make_tokenizer(&layout, "tok-a", b"x");
        let dir = layout.models_dir().join("broken");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("manifest.json"), "{oops").unwrap();

        let svc = TokenizerCleanupService::new(cfg(0), layout.clone());
        let err = svc.clean_at(SystemTime::now() + DAY).unwrap_err();
        assert!(matches!(err, CleanupError::Tokenizer { operation: "read_manifests", .. }));
        assert!(layout.tokenizers_dir().join("tok-a").exists());
    }

    #[test]
    fn test_tokenizers_path_not_a_directory() {
        let (_temp, layout) = setup();
        std::fs::write(layout.tokenizers_dir(), b"file").unwrap();
        let svc = TokenizerCleanupService::new(cfg(0), layout);
        assert!(svc.clean().is_err());
    }
}
