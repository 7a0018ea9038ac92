//! Subcommand implementations. Each returns a JSON document for stdout.

pub mod cleanup;
pub mod run;
pub mod worker;

use model_trainer_core::{RedisStateStore, RetryPolicy, Settings, SharedState};
use std::sync::Arc;

/// Connect to the configured Redis state store with the configured retry policy.
pub async fn connect_state(settings: &Settings) -> anyhow::Result<SharedState> {
    let store = RedisStateStore::connect(&settings.redis.url).await?;
    Ok(SharedState::new(Arc::new(store), RetryPolicy::from(&settings.state_store)))
}
