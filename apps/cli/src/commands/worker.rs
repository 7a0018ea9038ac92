use super::connect_state;
use model_trainer_core::{
    ArtifactDownloader, ArtifactUploader, CorpusFetcher, QueueAdapter, RedisBroker, Settings,
    TransferClient, Worker,
};
use model_trainer_training::{ArtifactLayout, ModelRegistry, TokenizerRegistry, UnavailableBackend};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const MODEL_FAMILIES: [&str; 2] = ["gpt2", "llama"];
const TOKENIZER_METHODS: [&str; 2] = ["bpe", "sentencepiece"];

fn registries() -> (Arc<ModelRegistry>, Arc<TokenizerRegistry>) {
    let models = MODEL_FAMILIES
        .into_iter()
        .fold(ModelRegistry::builder(), |b, name| b.register(Arc::new(UnavailableBackend::new(name))))
        .build();
    let tokenizers = TOKENIZER_METHODS
        .into_iter()
        .fold(TokenizerRegistry::builder(), |b, name| b.register(Arc::new(UnavailableBackend::new(name))))
        .build();
    (Arc::new(models), Arc::new(tokenizers))
}

async fn build(settings: &Settings) -> anyhow::Result<Worker> {
    let state = connect_state(settings).await?;
    let broker = RedisBroker::connect(&settings.redis.url).await?;
    let queue = QueueAdapter::new(Arc::new(broker), settings.queue.clone());
    let (models, tokenizers) = registries();
    let layout = ArtifactLayout::new(settings.app.artifacts_root.clone());

    let mut worker = Worker::new(state, queue, models, tokenizers, layout)
        .with_artifact_cleanup(settings.cleanup.clone());
    if settings.data_bank.api_key.trim().is_empty() {
        warn!("data bank api key not set, corpus fetch and artifact upload disabled");
        return Ok(worker);
    }
    let client = TransferClient::from_config(&settings.data_bank)?;
    worker = worker
        .with_fetcher(CorpusFetcher::new(client.clone(), settings.corpus_cache_dir()))
        .with_uploader(ArtifactUploader::new(client.clone()))
        .with_downloader(ArtifactDownloader::new(client));
    Ok(worker)
}

/// Drain the configured queue until Ctrl-C.
pub async fn run(settings: &Settings, idle_ms: u64) -> anyhow::Result<Value> {
    let worker = build(settings).await?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c, stopping"),
        }
        trigger.cancel();
    });

    worker.run(Duration::from_millis(idle_ms), shutdown).await?;
    Ok(json!({ "queue": settings.queue.queue_name, "stopped": true }))
}
