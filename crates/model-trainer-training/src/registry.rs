use crate::error::{TrainingError, TrainingResult};
use async_trait::async_trait;
use model_trainer_abstraction::{
    BackendError, EvalOutcome, EvalRequest, ModelArtifact, ModelBackend, ModelTrainConfig,
    PreparedModel, TokenizerBackend, TokenizerHandle, TokenizerTrainConfig, TokenizerTrainStats,
    TrainOutcome, TrainingControl,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Immutable map of model family -> backend, built once at startup.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    backends: HashMap<String, Arc<dyn ModelBackend>>,
}

impl ModelRegistry {
    #[must_use]
    pub fn builder() -> ModelRegistryBuilder {
        ModelRegistryBuilder::default()
    }

    /// Look up a backend by model family.
    pub fn get(&self, family: &str) -> TrainingResult<Arc<dyn ModelBackend>> {
        self.backends
            .get(family)
            .cloned()
            .ok_or_else(|| TrainingError::UnknownBackend(family.to_string()))
    }

    #[must_use]
    pub fn contains(&self, family: &str) -> bool {
        self.backends.contains_key(family)
    }

    /// Registered families, sorted.
    #[must_use]
    pub fn families(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry").field("families", &self.families()).finish()
    }
}

#[derive(Default)]
pub struct ModelRegistryBuilder {
    backends: HashMap<String, Arc<dyn ModelBackend>>,
}

impl ModelRegistryBuilder {
    /// Register a backend under its own name. A later registration replaces an earlier one.
    #[must_use]
    pub fn register(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.backends.insert(backend.name().to_string(), backend);
        self
    }

    #[must_use]
    pub fn build(self) -> ModelRegistry {
        ModelRegistry { backends: self.backends }
    }
}

/// Immutable map of tokenizer method -> backend.
#[derive(Clone, Default)]
pub struct TokenizerRegistry {
    backends: HashMap<String, Arc<dyn TokenizerBackend>>,
}

impl TokenizerRegistry {
    #[must_use]
    pub fn builder() -> TokenizerRegistryBuilder {
        TokenizerRegistryBuilder::default()
    }

    pub fn get(&self, method: &str) -> TrainingResult<Arc<dyn TokenizerBackend>> {
        self.backends
            .get(method)
            .cloned()
            .ok_or_else(|| TrainingError::UnknownBackend(method.to_string()))
    }

    #[must_use]
    pub fn contains(&self, method: &str) -> bool {
        self.backends.contains_key(method)
    }

    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for TokenizerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenizerRegistry").field("methods", &self.methods()).finish()
    }
}

#[derive(Default)]
pub struct TokenizerRegistryBuilder {
    backends: HashMap<String, Arc<dyn TokenizerBackend>>,
}

impl TokenizerRegistryBuilder {
    #[must_use]
    pub fn register(mut self, backend: Arc<dyn TokenizerBackend>) -> Self {
        self.backends.insert(backend.name().to_string(), backend);
        self
    }

    #[must_use]
    pub fn build(self) -> TokenizerRegistry {
        TokenizerRegistry { backends: self.backends }
    }
}

/// Placeholder for a backend that is known but not configured here.
///
/// It is registered like any other backend so the family passes the registry
/// check, and every operation fails with [`BackendError::Unavailable`].
#[derive(Debug, Clone)]
pub struct UnavailableBackend {
    name: String,
}

impl UnavailableBackend {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn unavailable(&self) -> BackendError {
        BackendError::Unavailable(self.name.clone())
    }
}

#[async_trait]
impl ModelBackend for UnavailableBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(
        &self,
        _cfg: &ModelTrainConfig,
        _tokenizer: &dyn TokenizerHandle,
    ) -> Result<PreparedModel, BackendError> {
        Err(self.unavailable())
    }

    async fn train(
        &self,
        _cfg: &ModelTrainConfig,
        _run_id: &str,
        _prepared: &mut PreparedModel,
        _control: &dyn TrainingControl,
    ) -> Result<TrainOutcome, BackendError> {
        Err(self.unavailable())
    }

    async fn evaluate(
        &self,
        _cfg: &ModelTrainConfig,
        _request: &EvalRequest,
    ) -> Result<EvalOutcome, BackendError> {
        Err(self.unavailable())
    }

    async fn save(
        &self,
        _prepared: &PreparedModel,
        _out_dir: &Path,
    ) -> Result<ModelArtifact, BackendError> {
        Err(self.unavailable())
    }

    async fn load(
        &self,
        _artifact_dir: &Path,
        _tokenizer: &dyn TokenizerHandle,
    ) -> Result<PreparedModel, BackendError> {
        Err(self.unavailable())
    }
}

#[async_trait]
impl TokenizerBackend for UnavailableBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn train(&self, _cfg: &TokenizerTrainConfig) -> Result<TokenizerTrainStats, BackendError> {
        Err(self.unavailable())
    }

    fn load(&self, _artifact_path: &Path) -> Result<Box<dyn TokenizerHandle>, BackendError> {
        Err(self.unavailable())
    }
}
