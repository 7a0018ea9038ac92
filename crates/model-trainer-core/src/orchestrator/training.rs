use super::{ArtifactPointer, CancelResponse, EnqueueOut, EvalCache, EvaluateResponse, RunStatusResponse};
use crate::corpus::CorpusFetcher;
use crate::error::{Result, TrainerError};
use crate::queue::QueueAdapter;
use crate::store::SharedState;
use crate::transfer::TransferError;
use chrono::Utc;
use model_trainer_training::{
    keys, ArtifactLayout, CorpusSource, EvalJobPayload, EvaluateRequest, ModelRegistry, RunId,
    RunManifest, RunStatus, TrainJobPayload, TrainRequest, TrainRequestPayload, TrainingParams,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const CANCELLATION_REQUESTED: &str = "cancellation-requested";
pub const ARTIFACT_STORAGE: &str = "data-bank";

/// Training and evaluation front end.
#[derive(Debug, Clone)]
pub struct TrainingOrchestrator {
    state: SharedState,
    queue: QueueAdapter,
    models: Arc<ModelRegistry>,
    layout: ArtifactLayout,
    fetcher: Option<CorpusFetcher>,
}

impl TrainingOrchestrator {
    #[must_use]
    pub fn new(
        state: SharedState,
        queue: QueueAdapter,
        models: Arc<ModelRegistry>,
        layout: ArtifactLayout,
        fetcher: Option<CorpusFetcher>,
    ) -> Self {
        Self { state, queue, models, layout, fetcher }
    }

    /// Validate, assign a run id, write the manifest, mark the run queued and enqueue.
    ///
    /// Family and request checks run before anything is written, so a
    /// rejected request leaves no trace in the store or on disk. The status
    /// is written before the job is pushed, and a failed push marks the run
    /// failed.
    pub async fn enqueue_training(&self, req: &TrainRequest) -> Result<EnqueueOut> {
        if !self.models.contains(&req.model_family) {
            info!(event = "model_backend_unavailable", model_family = %req.model_family, "unsupported model family");
            return Err(TrainerError::ConfigInvalid("unsupported model family".to_string()));
        }
        let source = req.validate().map_err(|e| TrainerError::ConfigInvalid(e.to_string()))?;

        let created_at = Utc::now();
        let run_id = RunId::generate(&req.model_family, &req.model_size, created_at.timestamp());
        let corpus_path = self.resolve_corpus(&source, run_id.as_str()).await?;

        let manifest = RunManifest::new(
            &self.layout,
            run_id.clone(),
            created_at,
            &req.model_family,
            &req.model_size,
            req.tokenizer_id.trim(),
            Some(corpus_path.clone()),
        )
        .with_training(TrainingParams {
            max_seq_len: req.max_seq_len,
            num_epochs: req.num_epochs,
            batch_size: req.batch_size,
            learning_rate: req.learning_rate,
        });
        manifest.write(&self.layout)?;

        let payload = TrainJobPayload {
            run_id: run_id.clone(),
            request: TrainRequestPayload {
                model_family: req.model_family.clone(),
                model_size: req.model_size.clone(),
                max_seq_len: req.max_seq_len,
                num_epochs: req.num_epochs,
                batch_size: req.batch_size,
                learning_rate: req.learning_rate,
                corpus_path: Some(corpus_path.to_string_lossy().into_owned()),
                corpus_file_id: None,
                tokenizer_id: req.tokenizer_id.trim().to_string(),
            },
        };
        let status_key = keys::run_status(run_id.as_str());
        self.state.set_string(&status_key, RunStatus::Queued.as_str()).await?;
        let job_id = match self.queue.enqueue_train(&payload).await {
            Ok(job_id) => job_id,
            Err(e) => {
                error!(event = "enqueue_failed", run_id = %run_id, error = %e, "training enqueue failed");
                self.state.set_string(&status_key, RunStatus::Failed.as_str()).await?;
                self.state.set_string(&keys::run_message(run_id.as_str()), &format!("enqueue failed: {e}")).await?;
                return Err(e.into());
            }
        };

        info!(event = "enqueued", run_id = %run_id, job_id = %job_id, "training enqueued");
        Ok(EnqueueOut { run_id: run_id.0, job_id })
    }

    async fn resolve_corpus(&self, source: &CorpusSource, run_id: &str) -> Result<PathBuf> {
        match source {
            CorpusSource::Path(path) => Ok(path.clone()),
            CorpusSource::FileId(file_id) => {
                let fetcher = self.fetcher.as_ref().ok_or_else(|| {
                    TrainerError::ConfigInvalid("corpus_file_id requires data bank configuration".to_string())
                })?;
                info!(run_id, file_id = %file_id, "resolving corpus file id");
                fetcher.fetch(file_id).await.map_err(|e| match e {
                    TransferError::NotFound(_) => {
                        TrainerError::DataNotFound(format!("corpus file not found: {file_id}"))
                    }
                    other => other.into(),
                })
            }
        }
    }

    pub async fn get_status(&self, run_id: &str) -> Result<RunStatusResponse> {
        let Some(status) = self.state.get_string(&keys::run_status(run_id)).await? else {
            info!(event = "run_not_found", run_id, "run not found");
            return Err(TrainerError::DataNotFound("run not found".to_string()));
        };
        let heartbeat = self.state.get_string(&keys::run_heartbeat(run_id)).await?;
        let last_heartbeat_ts = heartbeat.and_then(|raw| match raw.trim().parse::<f64>() {
            Ok(ts) => Some(ts),
            Err(_) => {
                warn!(run_id, value = %raw, "unparseable heartbeat");
                None
            }
        });
        let message = self.state.get_string(&keys::run_message(run_id)).await?;
        Ok(RunStatusResponse { run_id: run_id.to_string(), status, last_heartbeat_ts, message })
    }

    /// Queue an evaluation. An unknown run gets a `failed` response rather than an error.
    pub async fn enqueue_evaluation(&self, run_id: &str, req: &EvaluateRequest) -> Result<EvaluateResponse> {
        if self.state.get_string(&keys::run_status(run_id)).await?.is_none() {
            info!(event = "eval_rejected", run_id, "evaluation requested for unknown run");
            return Ok(EvalCache::new("failed", &req.split).into_response(run_id));
        }

        let payload = EvalJobPayload {
            run_id: RunId(run_id.to_string()),
            split: req.split.clone(),
            path_override: req.path_override.clone(),
        };
        let eval_key = keys::run_eval(run_id);
        let cache = EvalCache::new("queued", &req.split);
        self.state.set_string(&eval_key, &serde_json::to_string(&cache)?).await?;
        if let Err(e) = self.queue.enqueue_eval(&payload).await {
            error!(event = "enqueue_failed", run_id, error = %e, "eval enqueue failed");
            let failed = EvalCache::new("failed", &req.split);
            self.state.set_string(&eval_key, &serde_json::to_string(&failed)?).await?;
            return Err(e.into());
        }
        info!(event = "eval_enqueued", run_id, split = %req.split, "eval enqueued");
        Ok(cache.into_response(run_id))
    }

    pub async fn get_evaluation(&self, run_id: &str) -> Result<EvaluateResponse> {
        let Some(raw) = self.state.get_string(&keys::run_eval(run_id)).await? else {
            info!(event = "eval_not_found", run_id, "eval not found");
            return Err(TrainerError::DataNotFound("evaluation not found".to_string()));
        };
        let cache: EvalCache = serde_json::from_str(&raw)?;
        Ok(cache.into_response(run_id))
    }

    /// Raise the cancellation flag; the worker observes it on its next poll.
    pub async fn cancel_run(&self, run_id: &str) -> Result<CancelResponse> {
        if self.state.get_string(&keys::run_status(run_id)).await?.is_none() {
            return Err(TrainerError::DataNotFound("run not found".to_string()));
        }
        self.state.set_string(&keys::run_cancelled(run_id), "1").await?;
        info!(event = "cancel_requested", run_id, "cancellation requested");
        Ok(CancelResponse { run_id: run_id.to_string(), status: CANCELLATION_REQUESTED.to_string() })
    }

    pub async fn get_artifact_pointer(&self, run_id: &str) -> Result<ArtifactPointer> {
        match self.state.get_string(&keys::artifact_file_id(run_id)).await? {
            Some(file_id) if !file_id.trim().is_empty() => {
                Ok(ArtifactPointer { storage: ARTIFACT_STORAGE.to_string(), file_id })
            }
            _ => Err(TrainerError::DataNotFound("artifact pointer not found".to_string())),
        }
    }
}
