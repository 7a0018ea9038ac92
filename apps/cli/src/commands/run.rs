use super::connect_state;
use model_trainer_core::{QueueAdapter, RedisBroker, Settings, TrainingOrchestrator};
use model_trainer_training::{ArtifactLayout, ModelRegistry};
use serde_json::Value;
use std::sync::Arc;

async fn orchestrator(settings: &Settings) -> anyhow::Result<TrainingOrchestrator> {
    let state = connect_state(settings).await?;
    let broker = RedisBroker::connect(&settings.redis.url).await?;
    let queue = QueueAdapter::new(Arc::new(broker), settings.queue.clone());
    // status and cancel never touch a backend
    let models = Arc::new(ModelRegistry::builder().build());
    let layout = ArtifactLayout::new(settings.app.artifacts_root.clone());
    Ok(TrainingOrchestrator::new(state, queue, models, layout, None))
}

pub async fn status(settings: &Settings, run_id: &str) -> anyhow::Result<Value> {
    let response = orchestrator(settings).await?.get_status(run_id).await?;
    Ok(serde_json::to_value(response)?)
}

pub async fn cancel(settings: &Settings, run_id: &str) -> anyhow::Result<Value> {
    let response = orchestrator(settings).await?.cancel_run(run_id).await?;
    Ok(serde_json::to_value(response)?)
}
