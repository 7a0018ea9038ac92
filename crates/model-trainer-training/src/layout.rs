use crate::error::TrainingResult;
use crate::job::{RunId, TokenizerId};
use std::path::{Path, PathBuf};

/// Run manifest file name inside a model directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Filesystem layout for models, tokenizers, and logs under the artifacts root.
///
/// ```text
/// {artifacts_root}/models/{run_id}/manifest.json
/// {artifacts_root}/models/{run_id}/logs.jsonl
/// {artifacts_root}/models/{run_id}/eval/metrics.json
/// {artifacts_root}/tokenizers/{tokenizer_id}/
/// ```
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    #[must_use]
    pub fn new(artifacts_root: PathBuf) -> Self {
        Self { root: artifacts_root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    #[must_use]
    pub fn model_dir(&self, run_id: &RunId) -> PathBuf {
        self.models_dir().join(run_id.as_str())
    }

    #[must_use]
    pub fn manifest_path(&self, run_id: &RunId) -> PathBuf {
        self.model_dir(run_id).join(MANIFEST_FILE)
    }

    #[must_use]
    pub fn logs_path(&self, run_id: &RunId) -> PathBuf {
        self.model_dir(run_id).join("logs.jsonl")
    }

    #[must_use]
    pub fn eval_dir(&self, run_id: &RunId) -> PathBuf {
        self.model_dir(run_id).join("eval")
    }

    #[must_use]
    pub fn eval_metrics_path(&self, run_id: &RunId) -> PathBuf {
        self.eval_dir(run_id).join("metrics.json")
    }

    #[must_use]
    pub fn tokenizers_dir(&self) -> PathBuf {
        self.root.join("tokenizers")
    }

    #[must_use]
    pub fn tokenizer_dir(&self, tokenizer_id: &TokenizerId) -> PathBuf {
        self.tokenizers_dir().join(tokenizer_id.as_str())
    }

    pub fn ensure_model_dir(&self, run_id: &RunId) -> TrainingResult<PathBuf> {
        let dir = self.model_dir(run_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// Directory holding fetched corpus files: `{data_root}/corpus_cache`.
#[must_use]
pub fn corpus_cache_dir(data_root: &Path) -> PathBuf {
    data_root.join("corpus_cache")
}
