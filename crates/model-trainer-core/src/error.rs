//! Error types for Model Trainer Core.

use crate::artifacts::ArtifactError;
use crate::cleanup::CleanupError;
use crate::config::ConfigError;
use crate::queue::QueueError;
use crate::store::StoreError;
use crate::transfer::TransferError;
use model_trainer_training::TrainingError;
use serde::Serialize;
use thiserror::Error;

/// Stable error code exposed to API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    DataNotFound,
    ConfigInvalid,
    TokenizerTrainFailed,
    ModelTrainFailed,
    Internal,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DataNotFound => "DATA_NOT_FOUND",
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::TokenizerTrainFailed => "TOKENIZER_TRAIN_FAILED",
            Self::ModelTrainFailed => "MODEL_TRAIN_FAILED",
            Self::Internal => "INTERNAL",
        }
    }

    /// HTTP status an API layer should answer with.
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            Self::DataNotFound => 404,
            Self::ConfigInvalid => 400,
            Self::TokenizerTrainFailed | Self::ModelTrainFailed | Self::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core error type for orchestration operations.
#[derive(Error, Debug)]
pub enum TrainerError {
    #[error("{0}")]
    DataNotFound(String),

    #[error("{0}")]
    ConfigInvalid(String),

    #[error("tokenizer training failed: {0}")]
    TokenizerTrainFailed(String),

    #[error("model training failed: {0}")]
    ModelTrainFailed(String),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Cleanup error: {0}")]
    Cleanup(#[from] CleanupError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Training error: {0}")]
    Training(#[from] TrainingError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrainerError {
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::DataNotFound(_) => ErrorCode::DataNotFound,
            Self::ConfigInvalid(_) | Self::Config(_) => ErrorCode::ConfigInvalid,
            Self::Training(TrainingError::InvalidRequest(_) | TrainingError::UnknownBackend(_)) => {
                ErrorCode::ConfigInvalid
            }
            Self::TokenizerTrainFailed(_) => ErrorCode::TokenizerTrainFailed,
            Self::ModelTrainFailed(_) => ErrorCode::ModelTrainFailed,
            _ => ErrorCode::Internal,
        }
    }

    /// `{"error", "code", "message"}` body for API responses.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let code = self.code().as_str();
        serde_json::json!({ "error": code, "code": code, "message": self.to_string() })
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, TrainerError>;
