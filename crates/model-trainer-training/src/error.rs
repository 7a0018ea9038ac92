use model_trainer_abstraction::BackendError;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid training request: {0}")]
    InvalidRequest(String),

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("manifest error at {path}: {reason}")]
    Manifest { path: String, reason: String },

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
