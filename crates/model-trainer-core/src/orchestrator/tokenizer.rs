use super::{TokenizerEnqueueOut, TokenizerInfo};
use crate::error::{Result, TrainerError};
use crate::queue::QueueAdapter;
use crate::store::SharedState;
use model_trainer_abstraction::TokenizerTrainStats;
use model_trainer_training::{
    keys, ArtifactLayout, RunStatus, TokenizerId, TokenizerRegistry, TokenizerTrainPayload,
    TokenizerTrainRequest,
};
use std::sync::Arc;
use tracing::{error, info};

/// Tokenizer training front end.
#[derive(Debug, Clone)]
pub struct TokenizerOrchestrator {
    state: SharedState,
    queue: QueueAdapter,
    tokenizers: Arc<TokenizerRegistry>,
    layout: ArtifactLayout,
}

impl TokenizerOrchestrator {
    #[must_use]
    pub fn new(
        state: SharedState,
        queue: QueueAdapter,
        tokenizers: Arc<TokenizerRegistry>,
        layout: ArtifactLayout,
    ) -> Self {
        Self { state, queue, tokenizers, layout }
    }

    /// Enqueue tokenizer training under an id derived from the request.
    ///
    /// Identical requests map to the same id and are enqueued again. The
    /// status is reset to `queued`, so a job pushed after the first one
    /// finished retrains and overwrites its artifacts.
    pub async fn enqueue_tokenizer(&self, req: &TokenizerTrainRequest) -> Result<TokenizerEnqueueOut> {
        if !self.tokenizers.contains(&req.method) {
            info!(event = "tokenizer_backend_unavailable", method = %req.method, "unsupported tokenizer method");
            return Err(TrainerError::ConfigInvalid("unsupported tokenizer method".to_string()));
        }
        let source = req.validate().map_err(|e| TrainerError::ConfigInvalid(e.to_string()))?;
        let tokenizer_id = TokenizerId::derive(&req.method, req.vocab_size, &source.reference(), req.seed);

        let payload = TokenizerTrainPayload {
            tokenizer_id: tokenizer_id.clone(),
            method: req.method.clone(),
            vocab_size: req.vocab_size,
            min_frequency: req.min_frequency,
            corpus_path: req.corpus_path.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string),
            corpus_file_id: req
                .corpus_file_id
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            holdout_fraction: req.holdout_fraction,
            seed: req.seed,
        };
        let status_key = keys::tokenizer_status(tokenizer_id.as_str());
        self.state.set_string(&status_key, RunStatus::Queued.as_str()).await?;
        let job_id = match self.queue.enqueue_tokenizer(&payload).await {
            Ok(job_id) => job_id,
            Err(e) => {
                error!(event = "enqueue_failed", tokenizer_id = %tokenizer_id, error = %e, "tokenizer enqueue failed");
                self.state.set_string(&status_key, RunStatus::Failed.as_str()).await?;
                return Err(e.into());
            }
        };

        let artifact_path = self.layout.tokenizer_dir(&tokenizer_id).to_string_lossy().into_owned();
        info!(event = "enqueued", tokenizer_id = %tokenizer_id, job_id = %job_id, "tokenizer enqueued");
        Ok(TokenizerEnqueueOut { tokenizer_id: tokenizer_id.0, artifact_path, job_id })
    }

    /// Status, artifact location, and stats (once training completed).
    pub async fn get_tokenizer(&self, tokenizer_id: &str) -> Result<TokenizerInfo> {
        let status = self
            .state
            .get_string(&keys::tokenizer_status(tokenizer_id))
            .await?
            .unwrap_or_else(|| "unknown".to_string());
        let stats = match self.state.get_string(&keys::tokenizer_stats(tokenizer_id)).await? {
            Some(raw) => Some(serde_json::from_str::<TokenizerTrainStats>(&raw)?),
            None => None,
        };
        let artifact_path = self
            .layout
            .tokenizer_dir(&TokenizerId(tokenizer_id.to_string()))
            .to_string_lossy()
            .into_owned();
        Ok(TokenizerInfo { tokenizer_id: tokenizer_id.to_string(), status, artifact_path, stats })
    }
}
