//! RPC interface step definitions.

use std::sync::Arc;
use std::time::Duration;

use cucumber::{given, then, when, World};
use futures::future::join_all;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use modelbus::broker::Broker;
use modelbus::critical::CriticalSection;
use modelbus::service::{
    Manifest, ManifestStore, MemoryManifestStore, ModelService, VersionDescriptor,
};
use modelbus::test_utils::{fast_idle_backoff, fast_reply_backoff, patient_reply_backoff, StubModel};
use modelbus::{DispatchError, Dispatcher, Worker, WorkerConfig, WorkerError, WorkerHandle};

use crate::backend::{BrokerBackend, BrokerContext};

struct RunningWorker {
    handle: WorkerHandle,
    #[allow(dead_code)]
    task: JoinHandle<Result<(), WorkerError>>,
    deployed: Arc<RwLock<Vec<VersionDescriptor>>>,
}

/// Test context for RPC scenarios.
#[derive(World)]
#[world(init = Self::new)]
pub struct RpcWorld {
    backend: BrokerBackend,
    context: Option<BrokerContext>,
    service: String,
    manifest: MemoryManifestStore,
    workers: Vec<RunningWorker>,
    last_result: Option<Result<Value, DispatchError>>,
    receivers: usize,
}

impl std::fmt::Debug for RpcWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcWorld")
            .field("backend", &self.backend)
            .field("service", &self.service)
            .field("workers", &self.workers.len())
            .field("last_result", &self.last_result)
            .finish()
    }
}

impl Drop for RpcWorld {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.handle.stop();
        }
    }
}

impl RpcWorld {
    fn new() -> Self {
        Self {
            backend: BrokerBackend::from_env(),
            context: None,
            // Unique per scenario so shared backends never mix queues
            service: format!("model-{}", Uuid::new_v4().simple()),
            manifest: MemoryManifestStore::default(),
            workers: Vec::new(),
            last_result: None,
            receivers: 0,
        }
    }

    fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(
            &self
                .context
                .as_ref()
                .expect("Broker context not initialized")
                .broker,
        )
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.broker(), self.service.as_str())
            .with_reply_backoff(patient_reply_backoff())
    }

    fn impatient_dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.broker(), self.service.as_str())
            .with_reply_backoff(fast_reply_backoff())
    }

    async fn spawn_worker(&mut self) {
        let model = StubModel::new();
        let deployed = model.deployed();
        let service = ModelService::start(
            model,
            Arc::new(self.manifest.clone()),
            CriticalSection::for_service(self.broker(), &self.service),
        )
        .await
        .expect("Service starts");

        let worker = Worker::new(self.broker(), self.service.as_str(), service)
            .await
            .expect("Worker subscribes")
            .with_config(WorkerConfig {
                idle_backoff: fast_idle_backoff(),
                reply_ttl_secs: Some(60),
            });
        let handle = worker.handle();
        let task = tokio::spawn(worker.serve_forever());
        self.workers.push(RunningWorker {
            handle,
            task,
            deployed,
        });
    }

    fn error(&self) -> &DispatchError {
        match &self.last_result {
            Some(Err(e)) => e,
            other => panic!("expected a failed call, got {:?}", other),
        }
    }
}

// --- Background ---

#[given("a broker backend")]
async fn given_broker_backend(world: &mut RpcWorld) {
    println!("Using backend: {}", world.backend.name());
    world.context = Some(BrokerContext::new(world.backend).await);
}

#[given(expr = "a manifest with {string} enabled and {string} available")]
async fn given_manifest(world: &mut RpcWorld, enabled: String, extra: String) {
    let mut manifest = Manifest::with_enabled(VersionDescriptor::named(enabled));
    manifest.availables.push(VersionDescriptor::named(extra));
    world.manifest = MemoryManifestStore::new(manifest);
}

#[given(regex = r"^(\d+) running workers?$")]
async fn given_running_workers(world: &mut RpcWorld, count: usize) {
    for _ in 0..count {
        world.spawn_worker().await;
    }
}

// --- When steps ---

#[when(expr = "I predict {string}")]
async fn when_predict(world: &mut RpcWorld, input: String) {
    world.last_result = Some(world.dispatcher().predict(json!(input)).await);
}

#[when(expr = "I predict {string} with a short budget")]
async fn when_predict_short(world: &mut RpcWorld, input: String) {
    world.last_result = Some(world.impatient_dispatcher().predict(json!(input)).await);
}

#[when(expr = "I call {string} with a short budget")]
async fn when_call_short(world: &mut RpcWorld, method: String) {
    world.last_result = Some(
        world
            .impatient_dispatcher()
            .dispatch(&method, Map::new())
            .await,
    );
}

#[when(expr = "I call {string} with an argument named {string}")]
async fn when_call_with_argument(world: &mut RpcWorld, method: String, name: String) {
    let mut args = Map::new();
    args.insert(name, json!("anything"));
    world.last_result = Some(world.dispatcher().dispatch(&method, args).await);
}

#[when(expr = "I deploy {string} everywhere")]
async fn when_deploy_everywhere(world: &mut RpcWorld, version: String) {
    world.receivers = world
        .dispatcher()
        .deploy_everywhere(version)
        .await
        .expect("Broadcast published");
}

#[when(expr = "I deploy {string}")]
async fn when_deploy(world: &mut RpcWorld, version: String) {
    let result = world.dispatcher().deploy(version).await;
    world.last_result = Some(result.map(|v| json!(v)));
}

#[when(expr = "{int} trainings run concurrently")]
async fn when_trainings(world: &mut RpcWorld, count: usize) {
    let dispatcher = world.dispatcher();
    let trainings = (0..count).map(|n| {
        let dispatcher = dispatcher.clone();
        async move { dispatcher.train(vec![json!({"text": n, "label": n % 2})]).await }
    });
    for result in join_all(trainings).await {
        result.expect("Training succeeds");
    }
}

// --- Then steps ---

#[then(expr = "the prediction echoes {string} from version {string}")]
async fn then_prediction_echoes(world: &mut RpcWorld, input: String, version: String) {
    match &world.last_result {
        Some(Ok(output)) => {
            assert_eq!(output["input"], json!(input));
            assert_eq!(output["version"], json!(version));
        }
        other => panic!("expected a prediction, got {:?}", other),
    }
}

#[then("the call fails with a service timeout")]
async fn then_service_timeout(world: &mut RpcWorld) {
    assert!(matches!(world.error(), DispatchError::ServiceTimeout(_)));
}

#[then("the call fails as a reserved argument")]
async fn then_reserved_argument(world: &mut RpcWorld) {
    assert!(matches!(world.error(), DispatchError::ReservedArgument(_)));
}

#[then(expr = "the call fails with remote error {string}")]
async fn then_remote_error(world: &mut RpcWorld, expected: String) {
    match world.error() {
        DispatchError::Remote { kind, .. } => assert_eq!(kind, &expected),
        other => panic!("expected a remote error, got {:?}", other),
    }
}

#[then(expr = "the broadcast reached {int} workers")]
async fn then_broadcast_reached(world: &mut RpcWorld, count: usize) {
    assert_eq!(world.receivers, count);
}

#[then(expr = "every worker has deployed {string}")]
async fn then_every_worker_deployed(world: &mut RpcWorld, version: String) {
    let wanted = VersionDescriptor::named(version);
    for worker in &world.workers {
        tokio::time::timeout(Duration::from_secs(5), async {
            while worker.deployed.read().await.last() != Some(&wanted) {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("Worker did not deploy in time");
    }
}

#[then(expr = "the enabled version is {string}")]
async fn then_enabled_version(world: &mut RpcWorld, version: String) {
    let enabled = world
        .dispatcher()
        .enabled_version()
        .await
        .expect("enabled_version answered");
    assert_eq!(enabled, VersionDescriptor::named(&version));
    assert_eq!(
        world.manifest.load().await.expect("Manifest readable").enabled,
        VersionDescriptor::named(version)
    );
}

#[then(expr = "{int} versions are available")]
async fn then_versions_available(world: &mut RpcWorld, count: usize) {
    let versions = world
        .dispatcher()
        .available_versions()
        .await
        .expect("available_versions answered");
    assert_eq!(versions.len(), count);
}
