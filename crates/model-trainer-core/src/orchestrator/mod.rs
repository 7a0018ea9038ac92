//! Request/response front ends that validate, assign identities, record
//! initial state, and hand work to the queue.
//!
//! Orchestrators never run training themselves; everything past the enqueue
//! happens in [`crate::worker`].

mod tokenizer;
mod training;

pub use tokenizer::TokenizerOrchestrator;
pub use training::TrainingOrchestrator;

use model_trainer_abstraction::TokenizerTrainStats;
use serde::{Deserialize, Serialize};

/// Returned by `enqueue_training`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueOut {
    pub run_id: String,
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStatusResponse {
    pub run_id: String,
    pub status: String,
    pub last_heartbeat_ts: Option<f64>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluateResponse {
    pub run_id: String,
    pub split: String,
    pub status: String,
    pub loss: Option<f64>,
    pub perplexity: Option<f64>,
    pub artifact_path: Option<String>,
}

/// Evaluation record stored under `runs:eval:{run_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalCache {
    pub status: String,
    pub split: String,
    #[serde(default)]
    pub loss: Option<f64>,
    #[serde(default)]
    pub ppl: Option<f64>,
    #[serde(default)]
    pub artifact: Option<String>,
}

impl EvalCache {
    #[must_use]
    pub fn new(status: &str, split: &str) -> Self {
        Self { status: status.to_string(), split: split.to_string(), loss: None, ppl: None, artifact: None }
    }

    fn into_response(self, run_id: &str) -> EvaluateResponse {
        EvaluateResponse {
            run_id: run_id.to_string(),
            split: self.split,
            status: self.status,
            loss: self.loss,
            perplexity: self.ppl,
            artifact_path: self.artifact,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelResponse {
    pub run_id: String,
    pub status: String,
}

/// Where a run's uploaded model archive lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactPointer {
    pub storage: String,
    pub file_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenizerEnqueueOut {
    pub tokenizer_id: String,
    pub artifact_path: String,
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenizerInfo {
    pub tokenizer_id: String,
    pub status: String,
    pub artifact_path: String,
    pub stats: Option<TokenizerTrainStats>,
}
