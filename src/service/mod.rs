//! Model service: the capability set a worker exposes.
//!
//! `ModelService` wraps a `Model` (the prediction/training algorithms, which
//! live outside this crate) and owns the version manifest. Manifest mutations
//! from `train` and `deploy` run inside the critical section so workers
//! sharing a broker never lose each other's updates.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::broker::BrokerError;
use crate::critical::{CriticalError, CriticalSection};

pub mod manifest;
mod request;

pub use manifest::{
    FileManifestStore, Manifest, ManifestError, ManifestStore, MemoryManifestStore, Scores,
    VersionDescriptor,
};
pub use request::{Method, Request, RequestError};

/// Failure reported by a model implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ModelError(pub String);

impl ModelError {
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }
}

/// Errors raised while handling a request.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Model failed: {0}")]
    Model(#[from] ModelError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Critical section lock failed: {0}")]
    Lock(#[from] BrokerError),

    #[error("Version '{0}' not found in available versions")]
    VersionNotFound(String),

    #[error("Result serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HandlerError {
    /// Stable category carried in error replies.
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::Model(_) => "model",
            HandlerError::Manifest(_) => "manifest",
            HandlerError::Lock(_) => "lock",
            HandlerError::VersionNotFound(_) => "version_not_found",
            HandlerError::Serialization(_) => "serialization",
        }
    }
}

impl From<CriticalError<HandlerError>> for HandlerError {
    fn from(err: CriticalError<HandlerError>) -> Self {
        match err {
            CriticalError::Lock(e) => HandlerError::Lock(e),
            CriticalError::Inner(e) => e,
        }
    }
}

/// Prediction and training algorithms behind the service.
#[async_trait]
pub trait Model: Send + Sync {
    async fn predict(&mut self, input: Value) -> Result<Value, ModelError>;

    /// Train on labelled items and describe the resulting version.
    async fn train(&mut self, items: Vec<Value>) -> Result<VersionDescriptor, ModelError>;

    /// Load `version` so subsequent predictions use it.
    async fn deploy(&mut self, version: &VersionDescriptor) -> Result<(), ModelError>;
}

/// Executes typed requests for the worker loop.
#[async_trait]
pub trait Handler: Send {
    async fn handle(&mut self, request: Request) -> Result<Value, HandlerError>;
}

/// Capability set backed by a model and a version manifest.
pub struct ModelService<M> {
    model: M,
    manifest: Arc<dyn ManifestStore>,
    critical: CriticalSection,
    enabled: VersionDescriptor,
}

impl<M: Model> ModelService<M> {
    /// Read the manifest and deploy its enabled version.
    pub async fn start(
        mut model: M,
        manifest: Arc<dyn ManifestStore>,
        critical: CriticalSection,
    ) -> Result<Self, HandlerError> {
        let enabled = manifest.load().await?.enabled;
        model.deploy(&enabled).await?;

        info!(version = ?enabled.version, "Initialized with version");

        Ok(Self {
            model,
            manifest,
            critical,
            enabled,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub async fn predict(&mut self, input: Value) -> Result<Value, HandlerError> {
        let output = self.model.predict(input).await?;
        info!(output = %output, "Prediction");
        Ok(output)
    }

    /// Train, then append the new version to the manifest under the lock.
    pub async fn train(&mut self, items: Vec<Value>) -> Result<VersionDescriptor, HandlerError> {
        info!(items = items.len(), "Starting training");
        let version = self.model.train(items).await?;

        let manifest = Arc::clone(&self.manifest);
        let appended = version.clone();
        self.critical
            .exec(|| async move {
                let mut current = manifest.load().await?;
                current.availables.push(appended);
                manifest.store(&current).await?;
                Ok::<_, HandlerError>(())
            })
            .await?;

        info!(version = ?version.version, "New version available");
        Ok(version)
    }

    /// Enable an available version and load it into the model.
    ///
    /// Fails with `VersionNotFound`, leaving the manifest untouched, when the
    /// version was never trained.
    pub async fn deploy(&mut self, version: &str) -> Result<VersionDescriptor, HandlerError> {
        let manifest = Arc::clone(&self.manifest);
        let wanted = version.to_string();
        let target = self
            .critical
            .exec(|| async move {
                let mut current = manifest.load().await?;
                let target = current.enable(&wanted);
                if target.is_some() {
                    manifest.store(&current).await?;
                }
                Ok::<_, HandlerError>(target)
            })
            .await?;

        let Some(target) = target else {
            warn!(version = %version, "Cannot deploy version: not available");
            return Err(HandlerError::VersionNotFound(version.to_string()));
        };

        self.model.deploy(&target).await?;
        self.enabled = target.clone();
        info!(version = %version, "Version successfully deployed");
        Ok(target)
    }

    pub fn enabled_version(&self) -> VersionDescriptor {
        self.enabled.clone()
    }

    /// Available versions, read without the lock.
    pub async fn available_versions(&self) -> Result<Vec<VersionDescriptor>, HandlerError> {
        let manifest = Arc::clone(&self.manifest);
        Ok(manifest.load().await?.availables)
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, HandlerError> {
    Ok(serde_json::to_value(value)?)
}

#[async_trait]
impl<M: Model> Handler for ModelService<M> {
    async fn handle(&mut self, request: Request) -> Result<Value, HandlerError> {
        match request {
            Request::Predict { input } => self.predict(input).await,
            Request::Train { input } => to_value(self.train(input).await?),
            Request::Deploy { version } => to_value(self.deploy(&version).await?),
            Request::EnabledVersion => to_value(self.enabled_version()),
            Request::AvailableVersions => to_value(self.available_versions().await?),
        }
    }
}
