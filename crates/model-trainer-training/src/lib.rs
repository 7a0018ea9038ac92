//! Model Trainer Training
//!
//! Job-level primitives shared by the orchestrators and workers:
//! - Run and tokenizer identities, API requests, and queue payloads
//! - Run lifecycle status
//! - Filesystem layout and run manifests
//! - Shared state store key layout
//! - Backend registries

pub mod error;
pub mod job;
pub mod keys;
pub mod layout;
pub mod manifest;
pub mod registry;
pub mod status;

pub use error::{TrainingError, TrainingResult};
pub use job::{
    CorpusSource, EvalJobPayload, EvaluateRequest, JobKind, RunId, TokenizerId,
    TokenizerTrainPayload, TokenizerTrainRequest, TrainJobPayload, TrainRequest,
    TrainRequestPayload,
};
pub use layout::{corpus_cache_dir, ArtifactLayout, MANIFEST_FILE};
pub use manifest::{referenced_tokenizer_ids, sha256_file, RunManifest, TrainingParams};
pub use registry::{ModelRegistry, TokenizerRegistry, UnavailableBackend};
pub use status::{is_terminal_status_str, RunStatus};
