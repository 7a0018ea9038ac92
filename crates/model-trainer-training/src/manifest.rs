use crate::error::{TrainingError, TrainingResult};
use crate::job::RunId;
use crate::keys;
use crate::layout::{ArtifactLayout, MANIFEST_FILE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Per-run manifest written when a training run is enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    pub model_family: String,
    pub model_size: String,
    pub tokenizer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corpus_path: Option<PathBuf>,
    pub artifacts_dir: PathBuf,
    pub logs_path: PathBuf,
    pub status_key: String,
    pub heartbeat_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training: Option<TrainingParams>,
}

/// Hyperparameters a later evaluation of the run needs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingParams {
    pub max_seq_len: u32,
    pub num_epochs: u32,
    pub batch_size: u32,
    pub learning_rate: f64,
}

impl RunManifest {
    #[must_use]
    pub fn new(
        layout: &ArtifactLayout,
        run_id: RunId,
        created_at: DateTime<Utc>,
        model_family: &str,
        model_size: &str,
        tokenizer_id: &str,
        corpus_path: Option<PathBuf>,
    ) -> Self {
        Self {
            artifacts_dir: layout.model_dir(&run_id),
            logs_path: layout.logs_path(&run_id),
            status_key: keys::run_status(run_id.as_str()),
            heartbeat_key: keys::run_heartbeat(run_id.as_str()),
            run_id,
            created_at,
            model_family: model_family.to_string(),
            model_size: model_size.to_string(),
            tokenizer_id: tokenizer_id.to_string(),
            corpus_path,
            training: None,
        }
    }

    #[must_use]
    pub fn with_training(mut self, params: TrainingParams) -> Self {
        self.training = Some(params);
        self
    }

    /// Write the manifest into its run directory, creating the directory.
    pub fn write(&self, layout: &ArtifactLayout) -> TrainingResult<PathBuf> {
        layout.ensure_model_dir(&self.run_id)?;
        let path = layout.manifest_path(&self.run_id);
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(&path, bytes)?;
        Ok(path)
    }

    pub fn read(path: &Path) -> TrainingResult<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| manifest_error(path, &e))
    }
}

#[derive(Debug, Deserialize)]
struct TokenizerRef {
    tokenizer_id: String,
}

fn manifest_error(path: &Path, reason: &dyn std::fmt::Display) -> TrainingError {
    TrainingError::Manifest { path: path.display().to_string(), reason: reason.to_string() }
}

/// Collect the tokenizer ids referenced by `{models_dir}/*/manifest.json`.
///
/// Directories without a manifest are skipped and blank ids are ignored.
/// A manifest that cannot be read or parsed fails the whole scan.
pub fn referenced_tokenizer_ids(models_dir: &Path) -> TrainingResult<BTreeSet<String>> {
    let mut out = BTreeSet::new();

    let dir = match std::fs::read_dir(models_dir) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };

    for entry in dir {
        let entry = entry?;
        let run_dir = entry.path();
        if !run_dir.is_dir() {
            continue;
        }
        let manifest_path = run_dir.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            continue;
        }
        let bytes = std::fs::read(&manifest_path).map_err(|e| manifest_error(&manifest_path, &e))?;
        let parsed: TokenizerRef =
            serde_json::from_slice(&bytes).map_err(|e| manifest_error(&manifest_path, &e))?;
        let id = parsed.tokenizer_id.trim();
        if !id.is_empty() {
            out.insert(id.to_string());
        }
    }

    Ok(out)
}

/// Hex-encoded SHA-256 of a file, read in fixed-size chunks.
pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
