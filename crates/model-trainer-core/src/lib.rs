//! Model Trainer Core
//!
//! Job lifecycle orchestration for model and tokenizer training:
//! - Configuration loading and validation
//! - Shared state store with bounded retry (Redis or in-memory)
//! - Queue adapter over a pluggable broker
//! - Resumable, hash-verified transfers against the artifact store
//! - Corpus cache, artifact upload and download
//! - Training and tokenizer orchestrators
//! - Worker job handlers
//! - Corpus cache, tokenizer, and artifact cleanup

pub mod artifacts;
pub mod cleanup;
pub mod config;
pub mod corpus;
pub mod error;
pub mod orchestrator;
pub mod queue;
pub mod store;
pub mod transfer;
pub mod worker;

pub use artifacts::{ArtifactDownloader, ArtifactError, ArtifactUploader};
pub use cleanup::{
    ArtifactCleanupResult, ArtifactCleanupService, CleanupError, CorpusCacheCleanupResult,
    CorpusCacheCleanupService, DiskSpaceProbe, SkipReason, SystemDiskProbe,
    TokenizerCleanupResult, TokenizerCleanupService,
};
pub use config::{ConfigError, Settings};
pub use corpus::CorpusFetcher;
pub use error::{ErrorCode, Result, TrainerError};
pub use orchestrator::{TokenizerOrchestrator, TrainingOrchestrator};
pub use queue::{InMemoryBroker, JobEnvelope, QueueAdapter, QueueBroker, RedisBroker};
pub use store::{MemoryStateStore, RedisStateStore, RetryPolicy, SharedState, StateStore};
pub use transfer::{DownloadOptions, HeadInfo, TransferClient, TransferError, UploadResult};
pub use worker::{StoreControl, Tick, Worker};
