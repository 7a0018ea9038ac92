//! Run and tokenizer identities, API requests, and queue payload envelopes.

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Identifier for a training run: `{model_family}-{model_size}-{unix_seconds}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a run id from the model family, size, and creation time.
    #[must_use]
    pub fn generate(model_family: &str, model_size: &str, created_at_unix: i64) -> Self {
        Self(format!("{model_family}-{model_size}-{created_at_unix}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier for a tokenizer artifact: `tok-` followed by ten digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenizerId(pub String);

impl TokenizerId {
    /// Derive the tokenizer id from the request fields that define its output.
    ///
    /// Identical requests map to the same id, so a repeated request targets the
    /// existing artifact directory. The id keeps only ten decimal digits of the
    /// hash: two different requests can collide, and a collision silently
    /// merges them into one tokenizer id.
    #[must_use]
    pub fn derive(method: &str, vocab_size: u32, corpus_ref: &str, seed: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(method.as_bytes());
        hasher.update([0x1f]);
        hasher.update(vocab_size.to_be_bytes());
        hasher.update([0x1f]);
        hasher.update(corpus_ref.as_bytes());
        hasher.update([0x1f]);
        hasher.update(seed.to_be_bytes());
        let digest = hasher.finalize();

        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let value = u64::from_be_bytes(head) % 10_000_000_000;
        Self(format!("tok-{value:010}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TokenizerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Where a job reads its corpus from. Exactly one source is allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorpusSource {
    /// A path readable by the worker.
    Path(PathBuf),
    /// A file id in the remote artifact store.
    FileId(String),
}

impl CorpusSource {
    /// Build a source from the two optional request fields.
    ///
    /// Blank strings count as absent. Supplying both or neither is rejected.
    pub fn from_fields(
        corpus_path: Option<&str>,
        corpus_file_id: Option<&str>,
    ) -> TrainingResult<Self> {
        let path = corpus_path.map(str::trim).filter(|s| !s.is_empty());
        let file_id = corpus_file_id.map(str::trim).filter(|s| !s.is_empty());
        match (path, file_id) {
            (Some(p), None) => Ok(Self::Path(PathBuf::from(p))),
            (None, Some(id)) => Ok(Self::FileId(id.to_string())),
            (Some(_), Some(_)) => Err(TrainingError::InvalidRequest(
                "exactly one of corpus_path or corpus_file_id must be provided, got both"
                    .to_string(),
            )),
            (None, None) => Err(TrainingError::InvalidRequest(
                "exactly one of corpus_path or corpus_file_id must be provided, got neither"
                    .to_string(),
            )),
        }
    }

    /// Stable string form used when deriving identities.
    #[must_use]
    pub fn reference(&self) -> String {
        match self {
            Self::Path(p) => p.to_string_lossy().into_owned(),
            Self::FileId(id) => format!("file:{id}"),
        }
    }
}

/// The kinds of work carried by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Train,
    Evaluate,
    TokenizerTrain,
}

impl JobKind {
    /// Handler path a worker dispatches on.
    #[must_use]
    pub fn handler(self) -> &'static str {
        match self {
            Self::Train => "model_trainer.worker.training_worker.process_train_job",
            Self::Evaluate => "model_trainer.worker.training_worker.process_eval_job",
            Self::TokenizerTrain => "model_trainer.worker.tokenizer_worker.process_tokenizer_train_job",
        }
    }

    /// Reverse of [`JobKind::handler`].
    #[must_use]
    pub fn from_handler(handler: &str) -> Option<Self> {
        [Self::Train, Self::Evaluate, Self::TokenizerTrain]
            .into_iter()
            .find(|kind| kind.handler() == handler)
    }
}

/// Training request as accepted from the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainRequest {
    #[serde(default = "default_model_family")]
    pub model_family: String,
    #[serde(default = "default_model_size")]
    pub model_size: String,
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: u32,
    #[serde(default = "default_one")]
    pub num_epochs: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub corpus_path: Option<String>,
    #[serde(default)]
    pub corpus_file_id: Option<String>,
    pub tokenizer_id: String,
}

fn default_model_family() -> String {
    "gpt2".to_string()
}

fn default_model_size() -> String {
    "small".to_string()
}

fn default_max_seq_len() -> u32 {
    512
}

fn default_one() -> u32 {
    1
}

fn default_batch_size() -> u32 {
    4
}

fn default_learning_rate() -> f64 {
    5e-4
}

impl TrainRequest {
    /// Validate hyperparameters and the corpus source.
    pub fn validate(&self) -> TrainingResult<CorpusSource> {
        if self.model_size.trim().is_empty() {
            return Err(TrainingError::InvalidRequest("model_size is required".to_string()));
        }
        if self.max_seq_len < 8 {
            return Err(TrainingError::InvalidRequest("max_seq_len must be >= 8".to_string()));
        }
        if self.num_epochs == 0 {
            return Err(TrainingError::InvalidRequest("num_epochs must be >= 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(TrainingError::InvalidRequest("batch_size must be >= 1".to_string()));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(TrainingError::InvalidRequest("learning_rate must be > 0".to_string()));
        }
        if self.tokenizer_id.trim().is_empty() {
            return Err(TrainingError::InvalidRequest("tokenizer_id is required".to_string()));
        }
        CorpusSource::from_fields(self.corpus_path.as_deref(), self.corpus_file_id.as_deref())
    }
}

/// Evaluation request as accepted from the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluateRequest {
    #[serde(default = "default_split")]
    pub split: String,
    #[serde(default)]
    pub path_override: Option<String>,
}

fn default_split() -> String {
    "validation".to_string()
}

impl Default for EvaluateRequest {
    fn default() -> Self {
        Self { split: default_split(), path_override: None }
    }
}

/// Tokenizer training request as accepted from the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizerTrainRequest {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_vocab_size")]
    pub vocab_size: u32,
    #[serde(default = "default_min_frequency")]
    pub min_frequency: u32,
    #[serde(default)]
    pub corpus_path: Option<String>,
    #[serde(default)]
    pub corpus_file_id: Option<String>,
    #[serde(default = "default_holdout_fraction")]
    pub holdout_fraction: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_method() -> String {
    "bpe".to_string()
}

fn default_vocab_size() -> u32 {
    32_000
}

fn default_min_frequency() -> u32 {
    2
}

fn default_holdout_fraction() -> f64 {
    0.01
}

fn default_seed() -> u64 {
    42
}

impl TokenizerTrainRequest {
    pub fn validate(&self) -> TrainingResult<CorpusSource> {
        if self.vocab_size < 128 {
            return Err(TrainingError::InvalidRequest("vocab_size must be >= 128".to_string()));
        }
        if self.min_frequency == 0 {
            return Err(TrainingError::InvalidRequest("min_frequency must be >= 1".to_string()));
        }
        if !(0.0..=0.5).contains(&self.holdout_fraction) {
            return Err(TrainingError::InvalidRequest(
                "holdout_fraction must be within [0.0, 0.5]".to_string(),
            ));
        }
        CorpusSource::from_fields(self.corpus_path.as_deref(), self.corpus_file_id.as_deref())
    }
}

/// `request` section of a train job envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainRequestPayload {
    pub model_family: String,
    pub model_size: String,
    pub max_seq_len: u32,
    pub num_epochs: u32,
    pub batch_size: u32,
    pub learning_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corpus_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corpus_file_id: Option<String>,
    pub tokenizer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainJobPayload {
    pub run_id: RunId,
    pub request: TrainRequestPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalJobPayload {
    pub run_id: RunId,
    pub split: String,
    pub path_override: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizerTrainPayload {
    pub tokenizer_id: TokenizerId,
    pub method: String,
    pub vocab_size: u32,
    pub min_frequency: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corpus_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corpus_file_id: Option<String>,
    pub holdout_fraction: f64,
    pub seed: u64,
}
