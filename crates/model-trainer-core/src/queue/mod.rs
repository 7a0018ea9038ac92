//! Job submission.
//!
//! The adapter wraps a payload in a [`JobEnvelope`] carrying the handler path
//! and the timeout/retention/retry policy, and hands it to a [`QueueBroker`].
//! Delivery is at-least-once: consumers must tolerate seeing a job twice.

mod memory;
mod redis_broker;

pub use memory::InMemoryBroker;
pub use redis_broker::RedisBroker;

use crate::config::QueueConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use model_trainer_training::{EvalJobPayload, JobKind, TokenizerTrainPayload, TrainJobPayload};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue broker unavailable: {0}")]
    Unavailable(String),

    #[error("invalid job envelope: {0}")]
    Envelope(#[from] serde_json::Error),
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Retry settings carried with each job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPlan {
    pub max: u32,
    pub intervals_sec: Vec<u64>,
}

impl RetryPlan {
    /// Delay before retry number `retry` (1-based). The last interval repeats.
    #[must_use]
    pub fn interval_for(&self, retry: u32) -> Option<u64> {
        if retry == 0 || retry > self.max {
            return None;
        }
        let idx = (retry as usize - 1).min(self.intervals_sec.len().saturating_sub(1));
        Some(self.intervals_sec.get(idx).copied().unwrap_or(0))
    }
}

/// A job as stored on the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: String,
    pub handler: String,
    pub description: String,
    pub payload: serde_json::Value,
    pub timeout_sec: u64,
    pub result_ttl_sec: u64,
    pub failure_ttl_sec: u64,
    pub retry: RetryPlan,
    /// Zero for the first delivery, incremented on each retry.
    #[serde(default)]
    pub attempt: u32,
    /// Earliest time a worker may run this delivery.
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
}

impl JobEnvelope {
    #[must_use]
    pub fn kind(&self) -> Option<JobKind> {
        JobKind::from_handler(&self.handler)
    }

    /// Envelope for the next retry, or `None` when retries are exhausted.
    #[must_use]
    pub fn next_retry(&self, now: DateTime<Utc>) -> Option<Self> {
        let next_attempt = self.attempt + 1;
        let delay = self.retry.interval_for(next_attempt)?;
        let mut next = self.clone();
        next.attempt = next_attempt;
        // out-of-range delays saturate to the latest representable time
        next.not_before = Some(
            i64::try_from(delay)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
        Some(next)
    }

    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_none_or(|t| t <= now)
    }
}

/// Transport for job envelopes.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    async fn push(&self, queue: &str, envelope: &JobEnvelope) -> QueueResult<()>;

    /// Take the oldest envelope, if any.
    async fn pop(&self, queue: &str) -> QueueResult<Option<JobEnvelope>>;
}

/// Job-kind agnostic enqueue front end.
#[derive(Clone)]
pub struct QueueAdapter {
    broker: Arc<dyn QueueBroker>,
    config: QueueConfig,
}

impl QueueAdapter {
    #[must_use]
    pub fn new(broker: Arc<dyn QueueBroker>, config: QueueConfig) -> Self {
        Self { broker, config }
    }

    #[must_use]
    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    #[must_use]
    pub fn broker(&self) -> Arc<dyn QueueBroker> {
        Arc::clone(&self.broker)
    }

    /// Enqueue `payload` for `kind`, returning the broker job id.
    pub async fn enqueue<P: Serialize + Sync>(
        &self,
        kind: JobKind,
        payload: &P,
        description: String,
    ) -> QueueResult<String> {
        let envelope = JobEnvelope {
            job_id: Uuid::new_v4().to_string(),
            handler: kind.handler().to_string(),
            description,
            payload: serde_json::to_value(payload)?,
            timeout_sec: self.config.job_timeout_sec,
            result_ttl_sec: self.config.result_ttl_sec,
            failure_ttl_sec: self.config.failure_ttl_sec,
            retry: RetryPlan {
                max: self.config.retry_max,
                intervals_sec: self.config.retry_intervals_sec.clone(),
            },
            attempt: 0,
            not_before: None,
            enqueued_at: Utc::now(),
        };
        self.broker.push(&self.config.queue_name, &envelope).await?;
        info!(
            queue = %self.config.queue_name,
            job_id = %envelope.job_id,
            handler = %envelope.handler,
            description = %envelope.description,
            "job enqueued"
        );
        Ok(envelope.job_id)
    }

    pub async fn enqueue_train(&self, payload: &TrainJobPayload) -> QueueResult<String> {
        self.enqueue(JobKind::Train, payload, format!("train:{}", payload.run_id)).await
    }

    pub async fn enqueue_eval(&self, payload: &EvalJobPayload) -> QueueResult<String> {
        let description = format!("eval:{}:{}", payload.run_id, payload.split);
        self.enqueue(JobKind::Evaluate, payload, description).await
    }

    pub async fn enqueue_tokenizer(&self, payload: &TokenizerTrainPayload) -> QueueResult<String> {
        let description = format!("tokenizer:{}", payload.tokenizer_id);
        self.enqueue(JobKind::TokenizerTrain, payload, description).await
    }

    /// Put an envelope back, e.g. a retry or an early delivery.
    pub async fn requeue(&self, envelope: &JobEnvelope) -> QueueResult<()> {
        self.broker.push(&self.config.queue_name, envelope).await
    }

    pub async fn dequeue(&self) -> QueueResult<Option<JobEnvelope>> {
        self.broker.pop(&self.config.queue_name).await
    }
}

impl std::fmt::Debug for QueueAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueAdapter").field("config", &self.config).finish_non_exhaustive()
    }
}
