use async_trait::async_trait;
use mockito::Server;
use model_trainer_core::config::QueueConfig;
use model_trainer_core::queue::QueueResult;
use model_trainer_core::transfer::TransferClient;
use model_trainer_core::{
    CorpusFetcher, ErrorCode, InMemoryBroker, JobEnvelope, MemoryStateStore, QueueAdapter,
    QueueBroker, RetryPolicy, SharedState, TrainerError, TrainingOrchestrator,
};
use model_trainer_training::{
    ArtifactLayout, EvaluateRequest, JobKind, ModelRegistry, RunId, RunManifest, TrainRequest,
    UnavailableBackend,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    temp: TempDir,
    memory: Arc<MemoryStateStore>,
    broker: Arc<InMemoryBroker>,
    orchestrator: TrainingOrchestrator,
}

fn harness(fetcher_url: Option<&str>) -> Harness {
    let temp = TempDir::new().unwrap();
    let memory = Arc::new(MemoryStateStore::new());
    let broker = Arc::new(InMemoryBroker::new());
    let state = SharedState::new(memory.clone(), RetryPolicy::default());
    let queue = QueueAdapter::new(broker.clone(), QueueConfig::default());
    let models = Arc::new(
        ModelRegistry::builder()
            .register(Arc::new(UnavailableBackend::new("gpt2")))
            .register(Arc::new(UnavailableBackend::new("llama")))
            .build(),
    );
    let layout = ArtifactLayout::new(temp.path().join("artifacts"));
    let fetcher = fetcher_url.map(|url| {
        let client = TransferClient::new(url, "k", Duration::from_secs(5), 0, Duration::ZERO).unwrap();
        CorpusFetcher::new(client, temp.path().join("data").join("corpus_cache"))
    });
    let orchestrator = TrainingOrchestrator::new(state, queue, models, layout, fetcher);
    Harness { temp, memory, broker, orchestrator }
}

fn train_request(body: serde_json::Value) -> TrainRequest {
    serde_json::from_value(body).unwrap()
}

#[tokio::test]
async fn test_unknown_run_status_is_data_not_found() {
    let h = harness(None);
    let err = h.orchestrator.get_status("nope").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::DataNotFound);
    assert_eq!(err.to_json()["message"], "run not found");
}

#[tokio::test]
async fn test_evaluation_of_unknown_run_fails_softly_but_lookup_is_not_found() {
    let h = harness(None);

    let resp = h.orchestrator.enqueue_evaluation("nope", &EvaluateRequest::default()).await.unwrap();
    assert_eq!(resp.status, "failed");
    assert_eq!(resp.split, "validation");
    assert!(h.broker.is_empty("training"));

    let err = h.orchestrator.get_evaluation("nope").await.unwrap_err();
    assert!(matches!(err, TrainerError::DataNotFound(_)));
}

#[tokio::test]
async fn test_evaluation_of_known_run_is_queued_and_overwritten() {
    let h = harness(None);
    let out = h
        .orchestrator
        .enqueue_training(&train_request(serde_json::json!({
            "corpus_path": "/data/c.txt", "tokenizer_id": "tok-1"
        })))
        .await
        .unwrap();

    let req = EvaluateRequest { split: "test".to_string(), path_override: None };
    let resp = h.orchestrator.enqueue_evaluation(&out.run_id, &req).await.unwrap();
    assert_eq!(resp.status, "queued");

    let again = h.orchestrator.enqueue_evaluation(&out.run_id, &EvaluateRequest::default()).await.unwrap();
    assert_eq!(again.split, "validation");

    let stored = h.orchestrator.get_evaluation(&out.run_id).await.unwrap();
    assert_eq!(stored.status, "queued");
    assert_eq!(stored.split, "validation");
    assert_eq!(h.broker.len("training"), 3);
}

#[tokio::test]
async fn test_unsupported_family_writes_nothing() {
    let h = harness(None);
    let err = h
        .orchestrator
        .enqueue_training(&train_request(serde_json::json!({
            "model_family": "foo", "corpus_path": "/data/c.txt", "tokenizer_id": "tok-1"
        })))
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::ConfigInvalid);
    assert_eq!(err.to_string(), "unsupported model family");
    assert!(h.memory.keys_with_prefix("runs:status:").is_empty());
    assert!(h.broker.is_empty("training"));
    assert!(!h.temp.path().join("artifacts").exists());
}

#[tokio::test]
async fn test_missing_corpus_is_config_invalid() {
    let h = harness(None);
    let err = h
        .orchestrator
        .enqueue_training(&train_request(serde_json::json!({
            "corpus_path": "  ", "corpus_file_id": "", "tokenizer_id": "tok-1"
        })))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConfigInvalid);
    assert!(h.memory.keys_with_prefix("runs:").is_empty());
}

#[tokio::test]
async fn test_invalid_hyperparameters_are_config_invalid() {
    let h = harness(None);
    let err = h
        .orchestrator
        .enqueue_training(&train_request(serde_json::json!({
            "max_seq_len": 4, "corpus_path": "/data/c.txt", "tokenizer_id": "tok-1"
        })))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConfigInvalid);
}

#[tokio::test]
async fn test_corpus_file_id_is_resolved_to_cached_path() {
    let corpus = b"line one\nline two\n";
    let mut server = Server::new_async().await;
    let _head = server
        .mock("HEAD", "/files/fid-7")
        .with_status(200)
        .with_header("content-length", &corpus.len().to_string())
        .with_header("etag", &hex::encode(Sha256::digest(corpus)))
        .create_async()
        .await;
    let _get = server.mock("GET", "/files/fid-7").with_status(200).with_body(corpus).create_async().await;

    let h = harness(Some(&server.url()));
    let out = h
        .orchestrator
        .enqueue_training(&train_request(serde_json::json!({
            "model_family": "llama", "corpus_file_id": "fid-7", "tokenizer_id": "tok-1"
        })))
        .await
        .unwrap();

    let cached = h.temp.path().join("data").join("corpus_cache").join("fid-7.txt");
    assert_eq!(std::fs::read(&cached).unwrap(), corpus);

    let jobs = h.broker.snapshot("training");
    assert_eq!(jobs[0].payload["request"]["corpus_path"], cached.to_str().unwrap());
    assert!(jobs[0].payload["request"].get("corpus_file_id").is_none());

    let layout = ArtifactLayout::new(h.temp.path().join("artifacts"));
    let manifest = RunManifest::read(&layout.manifest_path(&RunId(out.run_id))).unwrap();
    assert_eq!(manifest.corpus_path.as_deref(), Some(cached.as_path()));
    assert_eq!(manifest.model_family, "llama");
}

#[tokio::test]
async fn test_missing_remote_corpus_is_data_not_found() {
    let mut server = Server::new_async().await;
    let _head = server.mock("HEAD", "/files/gone").with_status(404).create_async().await;

    let h = harness(Some(&server.url()));
    let err = h
        .orchestrator
        .enqueue_training(&train_request(serde_json::json!({
            "corpus_file_id": "gone", "tokenizer_id": "tok-1"
        })))
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::DataNotFound);
    assert!(h.memory.keys_with_prefix("runs:status:").is_empty());
}

/// Broker whose consumer picks the job up before `push` returns.
struct InlineBroker {
    state: SharedState,
}

#[async_trait]
impl QueueBroker for InlineBroker {
    async fn push(&self, _queue: &str, envelope: &JobEnvelope) -> QueueResult<()> {
        let run_id = envelope.payload["run_id"].as_str().unwrap_or_default().to_string();
        match envelope.kind() {
            Some(JobKind::Train) => {
                self.state.set_string(&format!("runs:status:{run_id}"), "running").await.unwrap();
            }
            Some(JobKind::Evaluate) => {
                let done = r#"{"status":"completed","split":"validation","loss":0.5,"ppl":1.6}"#;
                self.state.set_string(&format!("runs:eval:{run_id}"), done).await.unwrap();
            }
            _ => {}
        }
        Ok(())
    }

    async fn pop(&self, _queue: &str) -> QueueResult<Option<JobEnvelope>> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_enqueue_never_overwrites_worker_progress() {
    let temp = TempDir::new().unwrap();
    let state = SharedState::new(Arc::new(MemoryStateStore::new()), RetryPolicy::default());
    let queue = QueueAdapter::new(Arc::new(InlineBroker { state: state.clone() }), QueueConfig::default());
    let models = Arc::new(ModelRegistry::builder().register(Arc::new(UnavailableBackend::new("gpt2"))).build());
    let orchestrator =
        TrainingOrchestrator::new(state, queue, models, ArtifactLayout::new(temp.path().to_path_buf()), None);

    let out = orchestrator
        .enqueue_training(&train_request(serde_json::json!({
            "corpus_path": "/data/c.txt", "tokenizer_id": "tok-1"
        })))
        .await
        .unwrap();
    assert_eq!(orchestrator.get_status(&out.run_id).await.unwrap().status, "running");

    orchestrator.enqueue_evaluation(&out.run_id, &EvaluateRequest::default()).await.unwrap();
    let eval = orchestrator.get_evaluation(&out.run_id).await.unwrap();
    assert_eq!(eval.status, "completed");
    assert_eq!(eval.loss, Some(0.5));
}

#[tokio::test]
async fn test_enqueue_failure_marks_run_failed() {
    let h = harness(None);
    let out = h
        .orchestrator
        .enqueue_training(&train_request(serde_json::json!({
            "corpus_path": "/data/c.txt", "tokenizer_id": "tok-1"
        })))
        .await
        .unwrap();

    h.broker.set_unreachable(true);
    let err = h.orchestrator.enqueue_evaluation(&out.run_id, &EvaluateRequest::default()).await.unwrap_err();
    assert!(matches!(err, TrainerError::Queue(_)));
    assert_eq!(h.orchestrator.get_evaluation(&out.run_id).await.unwrap().status, "failed");

    let err = h
        .orchestrator
        .enqueue_training(&train_request(serde_json::json!({
            "model_size": "medium", "corpus_path": "/data/c.txt", "tokenizer_id": "tok-1"
        })))
        .await
        .unwrap_err();
    assert!(matches!(err, TrainerError::Queue(_)));
    let mut statuses = Vec::new();
    for key in h.memory.keys_with_prefix("runs:status:") {
        let run_id = key.trim_start_matches("runs:status:");
        statuses.push(h.orchestrator.get_status(run_id).await.unwrap());
    }
    assert_eq!(statuses.len(), 2);
    let failed = statuses.iter().find(|s| s.run_id != out.run_id).unwrap();
    assert_eq!(failed.status, "failed");
    assert!(failed.message.as_deref().unwrap().starts_with("enqueue failed"));
}
