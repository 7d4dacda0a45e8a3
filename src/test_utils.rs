//! Test utilities and stub implementations.
//!
//! Stand-ins for the model algorithms and helpers for wiring dispatchers and
//! workers over an in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::broker::{Broker, MemoryBroker};
use crate::critical::CriticalSection;
use crate::service::{
    Manifest, ManifestStore, MemoryManifestStore, Model, ModelError, ModelService,
    VersionDescriptor,
};
use crate::utils::retry::RetryPolicy;

/// Model stub: predictions echo their input, training mints a unique version.
#[derive(Clone, Default)]
pub struct StubModel {
    deployed: Arc<RwLock<Vec<VersionDescriptor>>>,
    current: Option<String>,
    fail_predict: bool,
    train_delay: Duration,
}

impl StubModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `predict` fail.
    pub fn failing() -> Self {
        Self {
            fail_predict: true,
            ..Self::default()
        }
    }

    /// Sleep inside `train` to widen race windows.
    pub fn with_train_delay(mut self, delay: Duration) -> Self {
        self.train_delay = delay;
        self
    }

    /// Shared log of every version passed to `deploy`.
    pub fn deployed(&self) -> Arc<RwLock<Vec<VersionDescriptor>>> {
        Arc::clone(&self.deployed)
    }
}

#[async_trait]
impl Model for StubModel {
    async fn predict(&mut self, input: Value) -> Result<Value, ModelError> {
        if self.fail_predict {
            return Err(ModelError::new("stub model refuses to predict"));
        }
        Ok(json!({ "input": input, "version": self.current }))
    }

    async fn train(&mut self, items: Vec<Value>) -> Result<VersionDescriptor, ModelError> {
        if !self.train_delay.is_zero() {
            tokio::time::sleep(self.train_delay).await;
        }
        let recall = if items.is_empty() { 0.0 } else { 1.0 };
        Ok(VersionDescriptor::named(format!("v-{}", Uuid::new_v4().simple())).with_scores(1.0, recall))
    }

    async fn deploy(&mut self, version: &VersionDescriptor) -> Result<(), ModelError> {
        self.current = version.version.clone();
        self.deployed.write().await.push(version.clone());
        Ok(())
    }
}

/// Manifest with `v1` enabled and available.
pub fn manifest_v1() -> MemoryManifestStore {
    MemoryManifestStore::new(Manifest::with_enabled(VersionDescriptor::named("v1")))
}

/// Start a `ModelService` over `model`, sharing `broker` and `manifest`.
pub async fn start_service(
    broker: &MemoryBroker,
    service: &str,
    model: StubModel,
    manifest: impl ManifestStore + 'static,
) -> ModelService<StubModel> {
    let broker: Arc<dyn Broker> = Arc::new(broker.clone());
    ModelService::start(
        model,
        Arc::new(manifest),
        CriticalSection::for_service(broker, service),
    )
    .await
    .expect("stub service should start")
}

/// Short reply budget so timeouts surface quickly in tests.
pub fn fast_reply_backoff() -> RetryPolicy {
    RetryPolicy {
        initial_delay_ms: 2,
        factor: 2.0,
        max_delay_ms: 20,
        max_attempts: 8,
        jitter: false,
    }
}

/// Generous reply budget for tests where a worker is live.
pub fn patient_reply_backoff() -> RetryPolicy {
    RetryPolicy {
        initial_delay_ms: 2,
        factor: 2.0,
        max_delay_ms: 20,
        max_attempts: 500,
        jitter: false,
    }
}

/// Tight idle polling for workers under test.
pub fn fast_idle_backoff() -> RetryPolicy {
    RetryPolicy {
        initial_delay_ms: 1,
        factor: 2.0,
        max_delay_ms: 5,
        max_attempts: 16,
        jitter: false,
    }
}
