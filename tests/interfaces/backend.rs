//! Backend factory for interface tests.
//!
//! Provides a unified interface to create brokers based on environment configuration.

use std::env;
use std::sync::Arc;

use modelbus::broker::{Broker, MemoryBroker};

#[cfg(feature = "redis")]
use modelbus::broker::{LockConfig, RedisBroker};

#[cfg(feature = "redis")]
use std::time::Duration;

#[cfg(feature = "redis")]
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

/// Broker backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerBackend {
    Memory,
    Redis,
}

impl BrokerBackend {
    pub fn from_env() -> Self {
        match env::var("BROKER_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "redis" => BrokerBackend::Redis,
            _ => BrokerBackend::Memory,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BrokerBackend::Memory => "memory",
            BrokerBackend::Redis => "redis",
        }
    }
}

/// Container handles to keep containers alive during tests.
#[allow(dead_code)]
#[derive(Debug)]
pub enum ContainerHandle {
    None,
    #[cfg(feature = "redis")]
    Redis(testcontainers::ContainerAsync<GenericImage>),
}

/// Holds the broker for a backend.
pub struct BrokerContext {
    pub broker: Arc<dyn Broker>,
    /// Container handle to keep container alive.
    #[allow(dead_code)]
    container: ContainerHandle,
}

impl std::fmt::Debug for BrokerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerContext")
            .field("broker", &"<dyn Broker>")
            .field("container", &self.container)
            .finish()
    }
}

impl BrokerContext {
    /// Create a broker context for the configured backend.
    pub async fn new(backend: BrokerBackend) -> Self {
        match backend {
            BrokerBackend::Memory => Self::create_memory(),
            BrokerBackend::Redis => Self::create_redis().await,
        }
    }

    fn create_memory() -> Self {
        BrokerContext {
            broker: Arc::new(MemoryBroker::new()),
            container: ContainerHandle::None,
        }
    }

    #[cfg(feature = "redis")]
    async fn create_redis() -> Self {
        let image = GenericImage::new("redis", "7")
            .with_exposed_port(6379.tcp())
            .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));

        let container = image
            .with_startup_timeout(Duration::from_secs(60))
            .start()
            .await
            .expect("Failed to start Redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get port");

        let host = container.get_host().await.expect("Failed to get host");

        let redis_url = format!("redis://{}:{}", host, host_port);
        let lock = LockConfig {
            lease_ms: Some(10_000),
            retry_interval_ms: 5,
        };

        BrokerContext {
            broker: Arc::new(
                RedisBroker::connect(&redis_url, lock)
                    .await
                    .expect("Failed to create RedisBroker"),
            ),
            container: ContainerHandle::Redis(container),
        }
    }

    #[cfg(not(feature = "redis"))]
    async fn create_redis() -> Self {
        panic!("Redis feature not enabled. Build with --features redis");
    }
}
