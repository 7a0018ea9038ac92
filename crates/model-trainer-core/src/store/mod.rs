//! Shared key-value state store.
//!
//! The store is the single source of truth for run status, heartbeats,
//! cancellation flags, and cached results. Only single-key string reads and
//! writes are used; there are no transactions.

mod memory;
mod redis_store;

pub use memory::MemoryStateStore;
pub use redis_store::RedisStateStore;

use crate::config::StateStoreConfig;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store connection error: {0}")]
    Connection(String),

    #[error("state store command failed: {0}")]
    Command(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Raw store backend.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
}

/// Bounded retry with doubling delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3, initial_backoff: Duration::from_millis(10) }
    }
}

impl From<&StateStoreConfig> for RetryPolicy {
    fn from(cfg: &StateStoreConfig) -> Self {
        Self { attempts: cfg.attempts.max(1), initial_backoff: cfg.initial_backoff() }
    }
}

/// Store handle used by orchestrators, workers, and cleanup.
///
/// Every call is retried per [`RetryPolicy`]; after the final attempt the
/// backend error is returned as is.
#[derive(Clone)]
pub struct SharedState {
    store: Arc<dyn StateStore>,
    policy: RetryPolicy,
}

impl SharedState {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn set_string(&self, key: &str, value: &str) -> StoreResult<()> {
        self.with_retry("set", key, || self.store.set(key, value)).await
    }

    pub async fn get_string(&self, key: &str) -> StoreResult<Option<String>> {
        self.with_retry("get", key, || self.store.get(key)).await
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, key: &str, call: F) -> StoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut delay = self.policy.initial_backoff;
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.policy.attempts => {
                    warn!(op, key, attempt, error = %e, "state store call failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState").field("policy", &self.policy).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy { attempts, initial_backoff: Duration::from_millis(1) }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let memory = Arc::new(MemoryStateStore::new());
        memory.fail_next(2);
        let state = SharedState::new(memory.clone(), fast_policy(3));

        state.set_string("k", "v").await.unwrap();
        assert_eq!(memory.call_count(), 3);
        assert_eq!(state.get_string("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_last_attempt() {
        let memory = Arc::new(MemoryStateStore::new());
        memory.fail_next(5);
        let state = SharedState::new(memory.clone(), fast_policy(3));

        let err = state.get_string("k").await.unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)));
        assert_eq!(memory.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles() {
        let memory = Arc::new(MemoryStateStore::new());
        memory.fail_next(2);
        let state = SharedState::new(
            memory,
            RetryPolicy { attempts: 3, initial_backoff: Duration::from_millis(10) },
        );

        let started = tokio::time::Instant::now();
        state.set_string("k", "v").await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(30));
        assert!(elapsed < Duration::from_millis(40));
    }

    #[test]
    fn test_policy_from_config() {
        let cfg = StateStoreConfig { attempts: 5, initial_backoff_ms: 20 };
        let policy = RetryPolicy::from(&cfg);
        assert_eq!(policy.attempts, 5);
        assert_eq!(policy.initial_backoff, Duration::from_millis(20));
    }
}
