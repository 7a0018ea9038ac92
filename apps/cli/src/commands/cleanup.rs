use super::connect_state;
use model_trainer_core::{
    ArtifactCleanupService, CorpusCacheCleanupService, Settings, SystemDiskProbe,
    TokenizerCleanupService,
};
use model_trainer_training::{ArtifactLayout, RunId};
use serde_json::Value;
use std::sync::Arc;

pub fn corpus_cache(settings: &Settings) -> anyhow::Result<Value> {
    let service = CorpusCacheCleanupService::new(
        settings.corpus_cache_cleanup.clone(),
        settings.corpus_cache_dir(),
        Arc::new(SystemDiskProbe),
    );
    Ok(serde_json::to_value(service.clean()?)?)
}

pub fn tokenizers(settings: &Settings) -> anyhow::Result<Value> {
    let layout = ArtifactLayout::new(settings.app.artifacts_root.clone());
    let service = TokenizerCleanupService::new(settings.tokenizer_cleanup.clone(), layout);
    Ok(serde_json::to_value(service.clean()?)?)
}

pub async fn artifacts(settings: &Settings, run_id: &str) -> anyhow::Result<Value> {
    let state = connect_state(settings).await?;
    let layout = ArtifactLayout::new(settings.app.artifacts_root.clone());
    let dir = layout.model_dir(&RunId(run_id.to_string()));

    let service = ArtifactCleanupService::new(settings.cleanup.clone(), state);
    let result = service.cleanup_run_artifacts(run_id, &dir).await?;
    Ok(serde_json::to_value(result)?)
}
