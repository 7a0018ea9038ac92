//! Enqueue through the orchestrators and drain the queue with a worker
//! driving in-process fake backends.

use async_trait::async_trait;
use mockito::{Matcher, Server};
use model_trainer_abstraction::{
    BackendError, EvalOutcome, EvalRequest, ModelArtifact, ModelBackend, ModelTrainConfig,
    PreparedModel, TokenizerBackend, TokenizerHandle, TokenizerTrainConfig, TokenizerTrainStats,
    TrainOutcome, TrainingControl,
};
use model_trainer_core::artifacts::{model_archive_name, write_dir_tar, ArtifactDownloader, ArtifactUploader};
use model_trainer_core::config::{ArtifactCleanupConfig, QueueConfig, TokenizerCleanupConfig};
use model_trainer_core::transfer::TransferClient;
use model_trainer_core::{
    InMemoryBroker, MemoryStateStore, QueueAdapter, RetryPolicy, SharedState, Tick,
    TokenizerCleanupService, TokenizerOrchestrator, TrainingOrchestrator, Worker,
};
use model_trainer_training::{
    referenced_tokenizer_ids, ArtifactLayout, EvaluateRequest, ModelRegistry, RunId,
    TokenizerRegistry, TokenizerTrainRequest, TrainRequest,
};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

struct WordHandle;

impl TokenizerHandle for WordHandle {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.split_whitespace().map(|w| w.len() as u32).collect()
    }

    fn decode(&self, ids: &[u32]) -> String {
        ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ")
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        Some(token.len() as u32)
    }

    fn vocab_size(&self) -> usize {
        128
    }
}

struct FakeTokenizer;

#[async_trait]
impl TokenizerBackend for FakeTokenizer {
    fn name(&self) -> &str {
        "bpe"
    }

    async fn train(&self, cfg: &TokenizerTrainConfig) -> Result<TokenizerTrainStats, BackendError> {
        let text = std::fs::read_to_string(&cfg.corpus_path).map_err(|e| BackendError::Input(e.to_string()))?;
        std::fs::write(cfg.out_dir.join("tokenizer.json"), b"{\"model\":\"fake\"}")
            .map_err(|e| BackendError::Failed(e.to_string()))?;
        Ok(TokenizerTrainStats {
            coverage: 1.0,
            oov_rate: 0.0,
            token_count: text.split_whitespace().count() as u64,
            char_coverage: 1.0,
        })
    }

    fn load(&self, artifact_path: &Path) -> Result<Box<dyn TokenizerHandle>, BackendError> {
        if artifact_path.is_file() {
            Ok(Box::new(WordHandle))
        } else {
            Err(BackendError::Input(artifact_path.display().to_string()))
        }
    }
}

/// Model backend that trains for a fixed number of steps, heartbeating and
/// polling cancellation on every step.
struct FakeModel {
    steps: u64,
    /// Raise the run's cancel flag after this step.
    cancel_after: Option<(u64, SharedState)>,
    /// Number of leading `train` calls that error out.
    failures: AtomicU32,
}

impl FakeModel {
    fn new(steps: u64) -> Self {
        Self { steps, cancel_after: None, failures: AtomicU32::new(0) }
    }
}

#[async_trait]
impl ModelBackend for FakeModel {
    fn name(&self) -> &str {
        "gpt2"
    }

    async fn prepare(
        &self,
        _cfg: &ModelTrainConfig,
        tokenizer: &dyn TokenizerHandle,
    ) -> Result<PreparedModel, BackendError> {
        Ok(PreparedModel::new("gpt2", vec![0.0f32; tokenizer.vocab_size()]))
    }

    async fn train(
        &self,
        _cfg: &ModelTrainConfig,
        run_id: &str,
        prepared: &mut PreparedModel,
        control: &dyn TrainingControl,
    ) -> Result<TrainOutcome, BackendError> {
        if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            return Err(BackendError::Failed("device lost".to_string()));
        }
        for step in 1..=self.steps {
            control.heartbeat(step as f64).await;
            control.progress(step, 1, 1.0 / step as f64);
            if let Some(w) = prepared.state_mut::<Vec<f32>>() {
                w[0] += 1.0;
            }
            if let Some((at, state)) = &self.cancel_after
                && *at == step
            {
                state.set_string(&format!("runs:{run_id}:cancelled"), "1").await.unwrap();
            }
            if control.is_cancelled().await {
                return Ok(TrainOutcome { loss: 1.0, perplexity: 2.7, steps: step, out_dir: "".into(), cancelled: true });
            }
        }
        Ok(TrainOutcome { loss: 0.5, perplexity: 1.65, steps: self.steps, out_dir: "".into(), cancelled: false })
    }

    async fn evaluate(&self, _cfg: &ModelTrainConfig, request: &EvalRequest) -> Result<EvalOutcome, BackendError> {
        if !request.artifact_dir.join("weights.bin").is_file() {
            return Err(BackendError::Input("weights missing".to_string()));
        }
        Ok(EvalOutcome { loss: 0.75, perplexity: 2.1 })
    }

    async fn save(&self, prepared: &PreparedModel, out_dir: &Path) -> Result<ModelArtifact, BackendError> {
        let weights = prepared.state::<Vec<f32>>().ok_or_else(|| BackendError::Failed("no state".to_string()))?;
        let path = out_dir.join("weights.bin");
        let bytes: Vec<u8> = weights.iter().flat_map(|w| w.to_le_bytes()).collect();
        std::fs::write(&path, bytes).map_err(|e| BackendError::Failed(e.to_string()))?;
        Ok(ModelArtifact { out_dir: out_dir.to_path_buf(), files: vec![path] })
    }

    async fn load(&self, _artifact_dir: &Path, _tokenizer: &dyn TokenizerHandle) -> Result<PreparedModel, BackendError> {
        Ok(PreparedModel::new("gpt2", Vec::<f32>::new()))
    }
}

struct Stack {
    temp: TempDir,
    training: TrainingOrchestrator,
    tokenizers: TokenizerOrchestrator,
    worker: Worker,
    layout: ArtifactLayout,
}

fn stack(model: impl FnOnce(&SharedState) -> FakeModel, data_bank: Option<TransferClient>) -> Stack {
    stack_with(model, data_bank, QueueConfig::default())
}

fn stack_with(
    model: impl FnOnce(&SharedState) -> FakeModel,
    data_bank: Option<TransferClient>,
    queue_cfg: QueueConfig,
) -> Stack {
    let temp = TempDir::new().unwrap();
    let state = SharedState::new(Arc::new(MemoryStateStore::new()), RetryPolicy::default());
    let queue = QueueAdapter::new(Arc::new(InMemoryBroker::new()), queue_cfg);
    let models = Arc::new(ModelRegistry::builder().register(Arc::new(model(&state))).build());
    let tok_registry = Arc::new(TokenizerRegistry::builder().register(Arc::new(FakeTokenizer)).build());
    let layout = ArtifactLayout::new(temp.path().join("artifacts"));

    let training = TrainingOrchestrator::new(state.clone(), queue.clone(), models.clone(), layout.clone(), None);
    let tokenizers = TokenizerOrchestrator::new(state.clone(), queue.clone(), tok_registry.clone(), layout.clone());
    let mut worker = Worker::new(state.clone(), queue, models, tok_registry, layout.clone())
        .with_artifact_cleanup(ArtifactCleanupConfig::default());
    if let Some(client) = data_bank {
        worker = worker
            .with_uploader(ArtifactUploader::new(client.clone()))
            .with_downloader(ArtifactDownloader::new(client));
    }
    Stack { temp, training, tokenizers, worker, layout }
}

async fn train_tokenizer(s: &Stack) -> String {
    let corpus = s.temp.path().join("corpus.txt");
    std::fs::write(&corpus, "a b c d e f\ng h i\n").unwrap();
    let req: TokenizerTrainRequest =
        serde_json::from_value(serde_json::json!({ "corpus_path": corpus, "vocab_size": 128 })).unwrap();
    let out = s.tokenizers.enqueue_tokenizer(&req).await.unwrap();
    assert_eq!(s.worker.run_once().await.unwrap(), Tick::Processed);
    out.tokenizer_id
}

fn train_request(s: &Stack, tokenizer_id: &str) -> TrainRequest {
    serde_json::from_value(serde_json::json!({
        "corpus_path": s.temp.path().join("corpus.txt"),
        "tokenizer_id": tokenizer_id,
        "max_seq_len": 16
    }))
    .unwrap()
}

#[tokio::test]
async fn test_tokenizer_job_records_stats() {
    let s = stack(|_| FakeModel::new(1), None);
    let tokenizer_id = train_tokenizer(&s).await;

    let info = s.tokenizers.get_tokenizer(&tokenizer_id).await.unwrap();
    assert_eq!(info.status, "completed");
    assert_eq!(info.stats.unwrap().token_count, 9);
    assert!(Path::new(&info.artifact_path).join("tokenizer.json").is_file());
}

#[tokio::test]
async fn test_train_then_evaluate() {
    let s = stack(|_| FakeModel::new(3), None);
    let tokenizer_id = train_tokenizer(&s).await;

    let out = s.training.enqueue_training(&train_request(&s, &tokenizer_id)).await.unwrap();
    assert_eq!(s.worker.run_once().await.unwrap(), Tick::Processed);

    let status = s.training.get_status(&out.run_id).await.unwrap();
    assert_eq!(status.status, "completed");
    assert_eq!(status.last_heartbeat_ts, Some(3.0));
    assert!(s.layout.model_dir(&RunId(out.run_id.clone())).join("weights.bin").is_file());

    let req = EvaluateRequest { split: "test".to_string(), path_override: None };
    s.training.enqueue_evaluation(&out.run_id, &req).await.unwrap();
    assert_eq!(s.worker.run_once().await.unwrap(), Tick::Processed);

    let eval = s.training.get_evaluation(&out.run_id).await.unwrap();
    assert_eq!(eval.status, "completed");
    assert_eq!(eval.split, "test");
    assert_eq!(eval.loss, Some(0.75));
    let metrics = eval.artifact_path.unwrap();
    assert!(Path::new(&metrics).is_file());
    assert!(s.training.get_artifact_pointer(&out.run_id).await.is_err());
}

#[tokio::test]
async fn test_cancellation_observed_mid_training() {
    let s = stack(|state| FakeModel { cancel_after: Some((2, state.clone())), ..FakeModel::new(10) }, None);
    let tokenizer_id = train_tokenizer(&s).await;

    let out = s.training.enqueue_training(&train_request(&s, &tokenizer_id)).await.unwrap();
    assert_eq!(s.worker.run_once().await.unwrap(), Tick::Processed);

    let status = s.training.get_status(&out.run_id).await.unwrap();
    assert_eq!(status.status, "failed");
    assert_eq!(status.message.as_deref(), Some("cancelled"));
    assert_eq!(status.last_heartbeat_ts, Some(2.0));
    assert!(!s.layout.model_dir(&RunId(out.run_id)).join("weights.bin").exists());
}

fn retry_once() -> QueueConfig {
    QueueConfig { retry_max: 1, retry_intervals_sec: vec![0], ..QueueConfig::default() }
}

#[tokio::test]
async fn test_missing_tokenizer_fails_run_once_retries_are_exhausted() {
    let s = stack_with(|_| FakeModel::new(1), None, retry_once());
    let corpus = s.temp.path().join("corpus.txt");
    std::fs::write(&corpus, "x\n").unwrap();

    let out = s.training.enqueue_training(&train_request(&s, "tok-missing")).await.unwrap();
    assert_eq!(s.worker.run_once().await.unwrap(), Tick::Failed { retry_scheduled: true });

    let status = s.training.get_status(&out.run_id).await.unwrap();
    assert_eq!(status.status, "running");
    assert!(status.message.unwrap().starts_with("retrying: "));

    assert_eq!(s.worker.run_once().await.unwrap(), Tick::Failed { retry_scheduled: false });
    let status = s.training.get_status(&out.run_id).await.unwrap();
    assert_eq!(status.status, "failed");
    assert!(status.message.unwrap().contains("tokenizer artifact not found"));
}

#[tokio::test]
async fn test_retried_run_only_moves_forward() {
    let s = stack_with(
        |_| FakeModel { failures: AtomicU32::new(1), ..FakeModel::new(2) },
        None,
        retry_once(),
    );
    let tokenizer_id = train_tokenizer(&s).await;

    let out = s.training.enqueue_training(&train_request(&s, &tokenizer_id)).await.unwrap();
    assert_eq!(s.worker.run_once().await.unwrap(), Tick::Failed { retry_scheduled: true });
    assert_eq!(s.training.get_status(&out.run_id).await.unwrap().status, "running");

    assert_eq!(s.worker.run_once().await.unwrap(), Tick::Processed);
    let status = s.training.get_status(&out.run_id).await.unwrap();
    assert_eq!(status.status, "completed");
    assert_eq!(status.message.as_deref(), Some("completed"));
    assert_eq!(s.worker.run_once().await.unwrap(), Tick::Idle);
}

#[tokio::test]
async fn test_uploaded_run_keeps_manifest_and_evaluates_from_store() {
    let mut server = Server::new_async().await;
    let post = server
        .mock("POST", "/files")
        .match_header("x-request-id", Matcher::Regex("^gpt2-small-".to_string()))
        .with_status(201)
        .with_body(r#"{"file_id":"model-file-1","size":1,"sha256":"00"}"#)
        .expect(1)
        .create_async()
        .await;
    let client = TransferClient::new(&server.url(), "k", Duration::from_secs(5), 0, Duration::ZERO).unwrap();

    let s = stack(|_| FakeModel::new(2), Some(client));
    let tokenizer_id = train_tokenizer(&s).await;

    let out = s.training.enqueue_training(&train_request(&s, &tokenizer_id)).await.unwrap();
    assert_eq!(s.worker.run_once().await.unwrap(), Tick::Processed);
    post.assert_async().await;

    let pointer = s.training.get_artifact_pointer(&out.run_id).await.unwrap();
    assert_eq!(pointer.storage, "data-bank");
    assert_eq!(pointer.file_id, "model-file-1");
    assert_eq!(s.training.get_status(&out.run_id).await.unwrap().status, "completed");

    let run_id = RunId(out.run_id.clone());
    let model_dir = s.layout.model_dir(&run_id);
    assert!(s.layout.manifest_path(&run_id).is_file());
    assert!(!model_dir.join("weights.bin").exists());

    // the pruned run still pins its tokenizer
    let referenced = referenced_tokenizer_ids(&s.layout.models_dir()).unwrap();
    assert!(referenced.contains(&tokenizer_id));
    let far_future = SystemTime::now() + Duration::from_secs(400 * 86_400);
    let cleaned = TokenizerCleanupService::new(TokenizerCleanupConfig::default(), s.layout.clone())
        .clean_at(far_future)
        .unwrap();
    assert_eq!(cleaned.deleted_tokenizers, 0);

    // serve the archive the store would hold for this run
    let snapshot = s.temp.path().join("snapshot");
    std::fs::create_dir_all(&snapshot).unwrap();
    std::fs::copy(s.layout.manifest_path(&run_id), snapshot.join("manifest.json")).unwrap();
    std::fs::write(snapshot.join("weights.bin"), [0u8; 8]).unwrap();
    let tar_path = s.temp.path().join("model.tar");
    write_dir_tar(&snapshot, &model_archive_name(&out.run_id), &tar_path).unwrap();
    let archive = std::fs::read(&tar_path).unwrap();
    let _head = server
        .mock("HEAD", "/files/model-file-1")
        .with_status(200)
        .with_header("content-length", &archive.len().to_string())
        .with_header("etag", &hex::encode(Sha256::digest(&archive)))
        .create_async()
        .await;
    let get = server
        .mock("GET", "/files/model-file-1")
        .with_status(200)
        .with_body(&archive)
        .expect(1)
        .create_async()
        .await;

    let req = EvaluateRequest { split: "validation".to_string(), path_override: None };
    s.training.enqueue_evaluation(&out.run_id, &req).await.unwrap();
    assert_eq!(s.worker.run_once().await.unwrap(), Tick::Processed);
    get.assert_async().await;

    let eval = s.training.get_evaluation(&out.run_id).await.unwrap();
    assert_eq!(eval.status, "completed");
    assert_eq!(eval.loss, Some(0.75));
    assert!(s.layout.eval_metrics_path(&run_id).is_file());
    assert!(!model_dir.join("weights.bin").exists());
    let leftovers: Vec<_> = std::fs::read_dir(s.layout.models_dir())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(leftovers, vec![std::ffi::OsString::from(&out.run_id)]);
}
