//! Job handlers executed by queue workers.
//!
//! The worker owns every status transition after `queued`: it marks jobs
//! running, heartbeats, observes the cancellation flag, writes terminal
//! status and results, uploads model archives and then hands the local copy
//! to artifact cleanup.
//!
//! Status writes only move forward. A failed attempt that will be retried
//! leaves the run `running`; `failed` is written once no retry remains.

use crate::artifacts::{model_archive_name, ArtifactDownloader, ArtifactUploader};
use crate::cleanup::ArtifactCleanupService;
use crate::config::ArtifactCleanupConfig;
use crate::corpus::CorpusFetcher;
use crate::error::{Result, TrainerError};
use crate::orchestrator::EvalCache;
use crate::queue::{JobEnvelope, QueueAdapter};
use crate::store::SharedState;
use async_trait::async_trait;
use chrono::Utc;
use model_trainer_abstraction::{
    EvalRequest, ModelTrainConfig, TokenizerHandle, TokenizerTrainConfig, TrainingControl,
};
use model_trainer_training::{
    is_terminal_status_str, keys, ArtifactLayout, EvalJobPayload, JobKind, ModelRegistry, RunId,
    RunManifest, RunStatus, TokenizerId, TokenizerRegistry, TokenizerTrainPayload, TrainJobPayload,
    TrainingError, MANIFEST_FILE,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tokenizer artifact file names, with the backend that reads each.
const TOKENIZER_ARTIFACTS: [(&str, &str); 2] =
    [("tokenizer.json", "bpe"), ("tokenizer.model", "sentencepiece")];

pub const CANCELLED_MESSAGE: &str = "cancelled";

fn unix_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// [`TrainingControl`] backed by the shared state store.
///
/// Store failures never abort training: a lost heartbeat is logged and a
/// failed cancellation read counts as "not cancelled".
pub struct StoreControl {
    state: SharedState,
    run_id: String,
}

impl StoreControl {
    #[must_use]
    pub fn new(state: SharedState, run_id: &str) -> Self {
        Self { state, run_id: run_id.to_string() }
    }
}

#[async_trait]
impl TrainingControl for StoreControl {
    async fn heartbeat(&self, ts: f64) {
        if let Err(e) = self.state.set_string(&keys::run_heartbeat(&self.run_id), &ts.to_string()).await {
            warn!(run_id = %self.run_id, error = %e, "heartbeat write failed");
        }
    }

    async fn is_cancelled(&self) -> bool {
        match self.state.get_string(&keys::run_cancelled(&self.run_id)).await {
            Ok(value) => value.as_deref() == Some("1"),
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "cancellation flag read failed");
                false
            }
        }
    }

    fn progress(&self, step: u64, epoch: u32, loss: f64) {
        info!(event = "train_progress", run_id = %self.run_id, steps = step, epoch, loss, "training progress");
    }
}

/// Outcome of a single [`Worker::run_once`] poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The queue was empty.
    Idle,
    /// An envelope was taken but is not due yet and went back on the queue.
    Deferred,
    Processed,
    /// The handler failed; a retry was scheduled when the plan allows one.
    Failed { retry_scheduled: bool },
}

/// Executes queued jobs.
#[derive(Debug, Clone)]
pub struct Worker {
    state: SharedState,
    queue: QueueAdapter,
    models: Arc<ModelRegistry>,
    tokenizers: Arc<TokenizerRegistry>,
    layout: ArtifactLayout,
    fetcher: Option<CorpusFetcher>,
    uploader: Option<ArtifactUploader>,
    downloader: Option<ArtifactDownloader>,
    cleanup: ArtifactCleanupService,
}

impl Worker {
    #[must_use]
    pub fn new(
        state: SharedState,
        queue: QueueAdapter,
        models: Arc<ModelRegistry>,
        tokenizers: Arc<TokenizerRegistry>,
        layout: ArtifactLayout,
    ) -> Self {
        let cleanup = ArtifactCleanupService::new(ArtifactCleanupConfig::default(), state.clone());
        Self {
            state,
            queue,
            models,
            tokenizers,
            layout,
            fetcher: None,
            uploader: None,
            downloader: None,
            cleanup,
        }
    }

    #[must_use]
    pub fn with_fetcher(mut self, fetcher: CorpusFetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    #[must_use]
    pub fn with_uploader(mut self, uploader: ArtifactUploader) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Used to restore runs whose local payload was pruned after upload.
    #[must_use]
    pub fn with_downloader(mut self, downloader: ArtifactDownloader) -> Self {
        self.downloader = Some(downloader);
        self
    }

    #[must_use]
    pub fn with_artifact_cleanup(mut self, config: ArtifactCleanupConfig) -> Self {
        self.cleanup = ArtifactCleanupService::new(config, self.state.clone());
        self
    }

    /// Take one envelope off the queue and run it.
    pub async fn run_once(&self) -> Result<Tick> {
        let Some(envelope) = self.queue.dequeue().await? else {
            return Ok(Tick::Idle);
        };
        let now = Utc::now();
        if !envelope.is_due(now) {
            self.queue.requeue(&envelope).await?;
            return Ok(Tick::Deferred);
        }

        match self.dispatch(&envelope).await {
            Ok(()) => Ok(Tick::Processed),
            Err(e) => {
                let run_id = envelope_run_id(&envelope);
                error!(
                    job_id = %envelope.job_id,
                    handler = %envelope.handler,
                    run_id = ?run_id,
                    attempt = envelope.attempt,
                    error = %e,
                    "job failed"
                );
                match envelope.next_retry(now) {
                    Some(retry) => {
                        info!(job_id = %retry.job_id, attempt = retry.attempt, not_before = ?retry.not_before, "job retry scheduled");
                        self.queue.requeue(&retry).await?;
                        Ok(Tick::Failed { retry_scheduled: true })
                    }
                    None => {
                        warn!(job_id = %envelope.job_id, "job retries exhausted");
                        Ok(Tick::Failed { retry_scheduled: false })
                    }
                }
            }
        }
    }

    /// Poll until `shutdown` fires, sleeping `idle_wait` whenever there is nothing to run.
    pub async fn run(&self, idle_wait: Duration, shutdown: CancellationToken) -> Result<()> {
        info!(queue = %self.queue.queue_name(), "worker started");
        while !shutdown.is_cancelled() {
            match self.run_once().await? {
                Tick::Processed | Tick::Failed { .. } => continue,
                Tick::Idle | Tick::Deferred => {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(idle_wait) => {}
                    }
                }
            }
        }
        info!(queue = %self.queue.queue_name(), "worker stopped");
        Ok(())
    }

    /// Route an envelope to its handler by handler path.
    pub async fn dispatch(&self, envelope: &JobEnvelope) -> Result<()> {
        let kind = envelope.kind().ok_or_else(|| {
            TrainerError::ConfigInvalid(format!("unknown job handler: {}", envelope.handler))
        })?;
        let payload = envelope.payload.clone();
        let final_attempt = envelope.retry.interval_for(envelope.attempt + 1).is_none();
        match kind {
            JobKind::Train => self.run_train_job(&serde_json::from_value(payload)?, final_attempt).await,
            JobKind::Evaluate => self.process_eval_job(&serde_json::from_value(payload)?).await,
            JobKind::TokenizerTrain => {
                self.run_tokenizer_job(&serde_json::from_value(payload)?, final_attempt).await
            }
        }
    }

    /// Current status under `key` when it is terminal.
    async fn terminal_status(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.get_string(key).await?.filter(|raw| is_terminal_status_str(raw)))
    }

    /// Write `next` under `key` if the stored status allows the move.
    ///
    /// Returns whether the write happened.
    async fn transition(&self, key: &str, next: RunStatus) -> Result<bool> {
        if let Some(raw) = self.state.get_string(key).await? {
            let allowed = match raw.parse::<RunStatus>() {
                Ok(current) => current.can_transition_to(next),
                Err(_) => !is_terminal_status_str(&raw),
            };
            if !allowed {
                warn!(key, from = %raw, to = %next, "status transition rejected");
                return Ok(false);
            }
        }
        self.state.set_string(key, next.as_str()).await?;
        Ok(true)
    }

    async fn local_corpus(&self, path: Option<&str>, file_id: Option<&str>) -> Result<PathBuf> {
        if let Some(p) = path.map(str::trim).filter(|p| !p.is_empty()) {
            return Ok(PathBuf::from(p));
        }
        let file_id = file_id.map(str::trim).filter(|f| !f.is_empty()).ok_or_else(|| {
            TrainerError::ConfigInvalid("job payload carries no corpus".to_string())
        })?;
        let fetcher = self.fetcher.as_ref().ok_or_else(|| {
            TrainerError::ConfigInvalid("corpus_file_id requires data bank configuration".to_string())
        })?;
        Ok(fetcher.fetch(file_id).await?)
    }

    fn load_tokenizer(&self, tokenizer_id: &str) -> Result<Box<dyn TokenizerHandle>> {
        let dir = self.layout.tokenizer_dir(&TokenizerId(tokenizer_id.to_string()));
        for (file, method) in TOKENIZER_ARTIFACTS {
            let path = dir.join(file);
            if path.is_file() {
                let backend = self.tokenizers.get(method)?;
                return Ok(backend.load(&path).map_err(TrainingError::from)?);
            }
        }
        Err(TrainerError::DataNotFound(format!("tokenizer artifact not found under {}", dir.display())))
    }

    /// Train a model run end to end, treating this as the last attempt.
    pub async fn process_train_job(&self, payload: &TrainJobPayload) -> Result<()> {
        self.run_train_job(payload, true).await
    }

    async fn run_train_job(&self, payload: &TrainJobPayload, final_attempt: bool) -> Result<()> {
        let run_id = payload.run_id.as_str();
        let status_key = keys::run_status(run_id);

        if let Some(status) = self.terminal_status(&status_key).await? {
            info!(run_id, status = %status, "run already finished, skipping redelivery");
            return Ok(());
        }
        if self.state.get_string(&keys::run_cancelled(run_id)).await?.as_deref() == Some("1") {
            self.finish(run_id, RunStatus::Failed, CANCELLED_MESSAGE).await?;
            info!(event = "train_cancelled", run_id, "run cancelled before start");
            return Ok(());
        }

        if !self.transition(&status_key, RunStatus::Running).await? {
            return Ok(());
        }
        let control = StoreControl::new(self.state.clone(), run_id);
        control.heartbeat(unix_now()).await;

        match self.train(payload, &control).await {
            Ok(TrainEnd::Cancelled) => {
                self.finish(run_id, RunStatus::Failed, CANCELLED_MESSAGE).await?;
                info!(event = "train_cancelled", run_id, "training cancelled");
                Ok(())
            }
            Ok(TrainEnd::Saved(out_dir)) => {
                self.finish(run_id, RunStatus::Completed, "completed").await?;
                self.publish_artifacts(run_id, &out_dir).await;
                Ok(())
            }
            Err(e) if final_attempt => {
                error!(event = "train_failed", run_id, error = %e, "training failed");
                self.finish(run_id, RunStatus::Failed, &e.to_string()).await?;
                Err(TrainerError::ModelTrainFailed(e.to_string()))
            }
            Err(e) => {
                warn!(event = "train_attempt_failed", run_id, error = %e, "training attempt failed, retry pending");
                self.state.set_string(&keys::run_message(run_id), &format!("retrying: {e}")).await?;
                Err(TrainerError::ModelTrainFailed(e.to_string()))
            }
        }
    }

    async fn train(&self, payload: &TrainJobPayload, control: &StoreControl) -> Result<TrainEnd> {
        let run_id = payload.run_id.as_str();
        let req = &payload.request;
        let corpus_path = self.local_corpus(req.corpus_path.as_deref(), req.corpus_file_id.as_deref()).await?;
        let cfg = ModelTrainConfig {
            model_family: req.model_family.clone(),
            model_size: req.model_size.clone(),
            max_seq_len: req.max_seq_len,
            num_epochs: req.num_epochs,
            batch_size: req.batch_size,
            learning_rate: req.learning_rate,
            tokenizer_id: req.tokenizer_id.clone(),
            corpus_path,
        };
        info!(
            event = "train_started",
            run_id,
            model_family = %cfg.model_family,
            model_size = %cfg.model_size,
            tokenizer_id = %cfg.tokenizer_id,
            corpus_path = %cfg.corpus_path.display(),
            "training started"
        );

        let backend = self.models.get(&cfg.model_family)?;
        let tokenizer = self.load_tokenizer(&cfg.tokenizer_id)?;
        let mut prepared = backend
            .prepare(&cfg, tokenizer.as_ref())
            .await
            .map_err(TrainingError::from)?;
        let outcome = backend
            .train(&cfg, run_id, &mut prepared, control)
            .await
            .map_err(TrainingError::from)?;
        if outcome.cancelled {
            return Ok(TrainEnd::Cancelled);
        }

        let out_dir = self.layout.ensure_model_dir(&payload.run_id)?;
        let artifact = backend
            .save(&prepared, &out_dir)
            .await
            .map_err(TrainingError::from)?;
        info!(
            event = "train_completed",
            run_id,
            loss = outcome.loss,
            perplexity = outcome.perplexity,
            steps = outcome.steps,
            files = artifact.files.len(),
            "training completed"
        );
        Ok(TrainEnd::Saved(out_dir))
    }

    async fn finish(&self, run_id: &str, status: RunStatus, message: &str) -> Result<()> {
        if self.transition(&keys::run_status(run_id), status).await? {
            self.state.set_string(&keys::run_message(run_id), message).await?;
        }
        Ok(())
    }

    /// Upload the run directory, record the pointer, then let cleanup decide
    /// whether the local copy can go. Failures here leave the run completed.
    async fn publish_artifacts(&self, run_id: &str, out_dir: &Path) {
        let Some(uploader) = &self.uploader else {
            debug!(run_id, "no uploader configured, keeping local artifacts");
            return;
        };
        let file_id = match uploader.upload_dir(out_dir, &model_archive_name(run_id), run_id).await {
            Ok(file_id) => file_id,
            Err(e) => {
                error!(event = "artifact_upload_failed", run_id, error = %e, "artifact upload failed");
                return;
            }
        };
        if let Err(e) = self.state.set_string(&keys::artifact_file_id(run_id), &file_id).await {
            error!(run_id, file_id = %file_id, error = %e, "failed to record artifact pointer");
            return;
        }
        info!(event = "artifact_uploaded", run_id, file_id = %file_id, "artifact uploaded");

        match self.cleanup.cleanup_run_artifacts(run_id, out_dir).await {
            Ok(result) => debug!(run_id, deleted = result.deleted, reason = ?result.reason, "post-upload cleanup finished"),
            Err(e) => error!(run_id, error = %e, "post-upload cleanup failed"),
        }
    }

    /// Evaluate a trained run and store the result in its evaluation slot.
    pub async fn process_eval_job(&self, payload: &EvalJobPayload) -> Result<()> {
        let run_id = payload.run_id.as_str();
        let eval_key = keys::run_eval(run_id);
        self.write_eval(&eval_key, &EvalCache::new("running", &payload.split)).await?;

        let manifest_path = self.layout.manifest_path(&payload.run_id);
        if !manifest_path.is_file() {
            error!(run_id, path = %manifest_path.display(), "eval failed: manifest missing");
            return self.write_eval(&eval_key, &EvalCache::new("failed", &payload.split)).await;
        }

        match self.evaluate(payload, &manifest_path).await {
            Ok(cache) => {
                self.write_eval(&eval_key, &cache).await?;
                info!(event = "eval_completed", run_id, split = %payload.split, loss = ?cache.loss, "eval completed");
                Ok(())
            }
            Err(e) => {
                error!(event = "eval_failed", run_id, error = %e, "eval failed");
                self.write_eval(&eval_key, &EvalCache::new("failed", &payload.split)).await?;
                Err(TrainerError::ModelTrainFailed(format!("evaluation failed: {e}")))
            }
        }
    }

    async fn evaluate(&self, payload: &EvalJobPayload, manifest_path: &Path) -> Result<EvalCache> {
        let run_id = &payload.run_id;
        let manifest = RunManifest::read(manifest_path)?;
        let params = manifest.training.ok_or_else(|| {
            TrainerError::ConfigInvalid("manifest has no training parameters".to_string())
        })?;
        let cfg = ModelTrainConfig {
            model_family: manifest.model_family.clone(),
            model_size: manifest.model_size.clone(),
            max_seq_len: params.max_seq_len,
            num_epochs: params.num_epochs,
            batch_size: params.batch_size,
            learning_rate: params.learning_rate,
            tokenizer_id: manifest.tokenizer_id.clone(),
            corpus_path: manifest.corpus_path.clone().unwrap_or_default(),
        };
        let backend = self.models.get(&cfg.model_family)?;
        let restored = self.restore_pruned_run(run_id).await?;
        let artifact_dir = restored
            .as_ref()
            .map_or_else(|| self.layout.model_dir(run_id), |scratch| scratch.path().join(run_id.as_str()));
        let request = EvalRequest {
            split: payload.split.clone(),
            artifact_dir,
            path_override: payload.path_override.as_deref().map(PathBuf::from),
        };
        let outcome = backend.evaluate(&cfg, &request).await.map_err(TrainingError::from)?;
        drop(restored);

        let metrics_path = self.layout.eval_metrics_path(run_id);
        tokio::fs::create_dir_all(self.layout.eval_dir(run_id)).await?;
        let metrics = serde_json::json!({
            "split": payload.split,
            "loss": outcome.loss,
            "perplexity": outcome.perplexity,
        });
        tokio::fs::write(&metrics_path, serde_json::to_vec_pretty(&metrics)?).await?;

        Ok(EvalCache {
            status: RunStatus::Completed.as_str().to_string(),
            split: payload.split.clone(),
            loss: Some(outcome.loss),
            ppl: Some(outcome.perplexity),
            artifact: Some(metrics_path.to_string_lossy().into_owned()),
        })
    }

    /// Download the uploaded archive of a run whose local directory holds
    /// only its manifest and eval output. The scratch directory is removed
    /// when the returned handle drops.
    async fn restore_pruned_run(&self, run_id: &RunId) -> Result<Option<tempfile::TempDir>> {
        if has_local_payload(&self.layout.model_dir(run_id))? {
            return Ok(None);
        }
        let Some(downloader) = &self.downloader else {
            return Ok(None);
        };
        let Some(file_id) = self
            .state
            .get_string(&keys::artifact_file_id(run_id.as_str()))
            .await?
            .filter(|f| !f.trim().is_empty())
        else {
            return Ok(None);
        };

        tokio::fs::create_dir_all(self.layout.models_dir()).await?;
        let scratch = tempfile::Builder::new().prefix(".restore_").tempdir_in(self.layout.models_dir())?;
        downloader.download_and_extract(&file_id, run_id.as_str(), scratch.path()).await?;
        info!(event = "artifact_restored", run_id = %run_id.as_str(), file_id = %file_id, "run restored for evaluation");
        Ok(Some(scratch))
    }

    async fn write_eval(&self, key: &str, cache: &EvalCache) -> Result<()> {
        self.state.set_string(key, &serde_json::to_string(cache)?).await?;
        Ok(())
    }

    /// Train a tokenizer and record its stats, treating this as the last attempt.
    pub async fn process_tokenizer_job(&self, payload: &TokenizerTrainPayload) -> Result<()> {
        self.run_tokenizer_job(payload, true).await
    }

    async fn run_tokenizer_job(&self, payload: &TokenizerTrainPayload, final_attempt: bool) -> Result<()> {
        let tokenizer_id = payload.tokenizer_id.as_str();
        let status_key = keys::tokenizer_status(tokenizer_id);
        if let Some(status) = self.terminal_status(&status_key).await? {
            info!(tokenizer_id, status = %status, "tokenizer already finished, skipping redelivery");
            return Ok(());
        }
        if !self.transition(&status_key, RunStatus::Running).await? {
            return Ok(());
        }

        match self.train_tokenizer(payload).await {
            Ok(stats_json) => {
                self.state.set_string(&keys::tokenizer_stats(tokenizer_id), &stats_json).await?;
                self.transition(&status_key, RunStatus::Completed).await?;
                info!(event = "tokenizer_completed", tokenizer_id, "tokenizer training completed");
                Ok(())
            }
            Err(e) => {
                if final_attempt {
                    error!(event = "tokenizer_failed", tokenizer_id, error = %e, "tokenizer training failed");
                    self.transition(&status_key, RunStatus::Failed).await?;
                } else {
                    warn!(event = "tokenizer_attempt_failed", tokenizer_id, error = %e, "tokenizer attempt failed, retry pending");
                }
                Err(TrainerError::TokenizerTrainFailed(e.to_string()))
            }
        }
    }

    async fn train_tokenizer(&self, payload: &TokenizerTrainPayload) -> Result<String> {
        let backend = self.tokenizers.get(&payload.method)?;
        let corpus_path = self
            .local_corpus(payload.corpus_path.as_deref(), payload.corpus_file_id.as_deref())
            .await?;
        let out_dir = self.layout.tokenizer_dir(&payload.tokenizer_id);
        tokio::fs::create_dir_all(&out_dir).await?;

        let cfg = TokenizerTrainConfig {
            method: payload.method.clone(),
            vocab_size: payload.vocab_size,
            min_frequency: payload.min_frequency,
            corpus_path,
            holdout_fraction: payload.holdout_fraction,
            seed: payload.seed,
            out_dir,
            sample_max_lines: None,
        };
        let stats = backend.train(&cfg).await.map_err(TrainingError::from)?;
        Ok(serde_json::to_string(&stats)?)
    }
}

enum TrainEnd {
    Cancelled,
    Saved(PathBuf),
}

/// Whether a run directory holds anything besides its manifest and eval output.
fn has_local_payload(run_dir: &Path) -> std::io::Result<bool> {
    let entries = match std::fs::read_dir(run_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let name = entry?.file_name();
        if name != MANIFEST_FILE && name != "eval" {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Run id of a train or eval envelope, for log context.
#[must_use]
pub fn envelope_run_id(envelope: &JobEnvelope) -> Option<RunId> {
    envelope
        .payload
        .get("run_id")
        .and_then(serde_json::Value::as_str)
        .map(|s| RunId(s.to_string()))
}
