//! Backend abstraction layer for Model Trainer.
//!
//! This module defines the traits and contract types that training and
//! tokenizer backends implement. The orchestration layer never looks inside a
//! backend; it only selects one by name from a registry and drives it through
//! these traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Represents an error raised by a model or tokenizer backend.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendError {
    /// The backend is registered but not configured in this deployment.
    #[error("model backend unavailable: {0}")]
    Unavailable(String),

    /// The supplied configuration is not usable by this backend.
    #[error("invalid backend configuration: {0}")]
    InvalidConfig(String),

    /// A required input (corpus, tokenizer, checkpoint) could not be read.
    #[error("backend input error: {0}")]
    Input(String),

    /// Training or evaluation failed inside the backend.
    #[error("backend failed: {0}")]
    Failed(String),
}

/// Training configuration handed to a model backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTrainConfig {
    pub model_family: String,
    pub model_size: String,
    pub max_seq_len: u32,
    pub num_epochs: u32,
    pub batch_size: u32,
    pub learning_rate: f64,
    pub tokenizer_id: String,
    pub corpus_path: PathBuf,
}

/// Result of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainOutcome {
    pub loss: f64,
    pub perplexity: f64,
    pub steps: u64,
    pub out_dir: PathBuf,
    /// Set when the backend stopped early because cancellation was observed.
    #[serde(default)]
    pub cancelled: bool,
}

/// Parameters of a single evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalRequest {
    pub split: String,
    pub artifact_dir: PathBuf,
    #[serde(default)]
    pub path_override: Option<PathBuf>,
}

/// Result of an evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalOutcome {
    pub loss: f64,
    pub perplexity: f64,
}

/// Files written by [`ModelBackend::save`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub out_dir: PathBuf,
    pub files: Vec<PathBuf>,
}

/// Backend-owned model state between `prepare`/`load` and `train`/`save`.
///
/// The orchestration layer treats the contents as opaque; each backend
/// downcasts to its own state type.
pub struct PreparedModel {
    family: String,
    state: Box<dyn Any + Send + Sync>,
}

impl PreparedModel {
    /// Wrap backend state for the given model family.
    pub fn new<T: Any + Send + Sync>(family: impl Into<String>, state: T) -> Self {
        Self { family: family.into(), state: Box::new(state) }
    }

    /// Model family that produced this state.
    #[must_use]
    pub fn family(&self) -> &str {
        &self.family
    }

    /// Borrow the backend state as `T`, if it is one.
    pub fn state<T: Any>(&self) -> Option<&T> {
        self.state.downcast_ref::<T>()
    }

    /// Mutably borrow the backend state as `T`, if it is one.
    pub fn state_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.state.downcast_mut::<T>()
    }
}

impl std::fmt::Debug for PreparedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedModel").field("family", &self.family).finish_non_exhaustive()
    }
}

/// Hooks a backend calls from inside its training loop.
///
/// Cancellation is cooperative: the backend polls [`TrainingControl::is_cancelled`]
/// at a bounded interval and stops on its own. Nothing here interrupts it.
#[async_trait]
pub trait TrainingControl: Send + Sync {
    /// Record a liveness timestamp (unix seconds).
    async fn heartbeat(&self, ts: f64);

    /// Whether cancellation has been requested for this run.
    async fn is_cancelled(&self) -> bool;

    /// Report training progress.
    fn progress(&self, _step: u64, _epoch: u32, _loss: f64) {}
}

/// A trait for model training backends.
///
/// All backends must be `Send + Sync` so a single registry can be shared
/// across worker tasks.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Registry key of this backend (e.g. "gpt2").
    fn name(&self) -> &str;

    /// Build a fresh model for training.
    async fn prepare(
        &self,
        cfg: &ModelTrainConfig,
        tokenizer: &dyn TokenizerHandle,
    ) -> Result<PreparedModel, BackendError>;

    /// Train the prepared model, reporting through `control`.
    async fn train(
        &self,
        cfg: &ModelTrainConfig,
        run_id: &str,
        prepared: &mut PreparedModel,
        control: &dyn TrainingControl,
    ) -> Result<TrainOutcome, BackendError>;

    /// Evaluate saved weights for a run.
    async fn evaluate(
        &self,
        cfg: &ModelTrainConfig,
        request: &EvalRequest,
    ) -> Result<EvalOutcome, BackendError>;

    /// Persist weights into `out_dir`.
    async fn save(&self, prepared: &PreparedModel, out_dir: &Path)
    -> Result<ModelArtifact, BackendError>;

    /// Load previously saved weights.
    async fn load(
        &self,
        artifact_dir: &Path,
        tokenizer: &dyn TokenizerHandle,
    ) -> Result<PreparedModel, BackendError>;
}

/// Tokenizer training configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizerTrainConfig {
    pub method: String,
    pub vocab_size: u32,
    pub min_frequency: u32,
    pub corpus_path: PathBuf,
    pub holdout_fraction: f64,
    pub seed: u64,
    pub out_dir: PathBuf,
    #[serde(default)]
    pub sample_max_lines: Option<usize>,
}

/// Statistics written once when tokenizer training completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizerTrainStats {
    pub coverage: f64,
    pub oov_rate: f64,
    pub token_count: u64,
    pub char_coverage: f64,
}

/// A loaded tokenizer.
pub trait TokenizerHandle: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode(&self, ids: &[u32]) -> String;
    fn token_to_id(&self, token: &str) -> Option<u32>;
    fn vocab_size(&self) -> usize;
}

/// A trait for tokenizer training backends.
#[async_trait]
pub trait TokenizerBackend: Send + Sync {
    /// Registry key of this backend (e.g. "bpe").
    fn name(&self) -> &str;

    /// Train a tokenizer and write its artifacts into `cfg.out_dir`.
    async fn train(&self, cfg: &TokenizerTrainConfig) -> Result<TokenizerTrainStats, BackendError>;

    /// Load a trained tokenizer artifact.
    fn load(&self, artifact_path: &Path) -> Result<Box<dyn TokenizerHandle>, BackendError>;
}
