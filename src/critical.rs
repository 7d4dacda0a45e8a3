//! Critical section coordination over a named broker lock.
//!
//! Wraps read-modify-write sequences on shared external state so that at most
//! one of them runs at a time across every process sharing the broker.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, LockToken};

/// Errors from running a function inside the critical section.
#[derive(Debug, thiserror::Error)]
pub enum CriticalError<E> {
    #[error("Critical section lock failed: {0}")]
    Lock(#[source] BrokerError),

    #[error(transparent)]
    Inner(E),
}

/// Holds an acquired lock until released.
///
/// Dropped without `release` (the owning future was cancelled), it hands the
/// release to a background task on the current runtime.
struct HeldLock {
    broker: Arc<dyn Broker>,
    token: Option<LockToken>,
}

impl HeldLock {
    async fn release(mut self) -> Result<(), BrokerError> {
        let Some(token) = self.token.clone() else {
            return Ok(());
        };
        let released = self.broker.release_lock(token).await;
        self.token = None;
        released
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        warn!(lock = %token.name(), "Critical section cancelled, releasing in background");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let broker = Arc::clone(&self.broker);
                runtime.spawn(async move {
                    let name = token.name().to_string();
                    if let Err(e) = broker.release_lock(token).await {
                        error!(lock = %name, error = %e, "Background release failed");
                    }
                });
            }
            Err(_) => {
                error!(lock = %token.name(), "No runtime to release lock; left to lease expiry");
            }
        }
    }
}

/// Named mutual-exclusion region.
#[derive(Clone)]
pub struct CriticalSection {
    broker: Arc<dyn Broker>,
    name: String,
}

impl CriticalSection {
    pub fn new(broker: Arc<dyn Broker>, name: impl Into<String>) -> Self {
        Self {
            broker,
            name: name.into(),
        }
    }

    /// Lock name used for a logical service.
    pub fn lock_name(service: &str) -> String {
        format!("{}:lock", service)
    }

    /// Critical section guarding a service's shared state.
    pub fn for_service(broker: Arc<dyn Broker>, service: &str) -> Self {
        Self::new(broker, Self::lock_name(service))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` while holding the lock.
    ///
    /// Acquisition waits without timeout. The lock is released on every exit
    /// path: success, error, panic (resumed after release) and cancellation
    /// of the returned future (released by a background task). If `f`
    /// succeeded but release fails, the release error is returned; with a
    /// leased lock that means `f`'s effects may already be visible.
    pub async fn exec<T, E, F, Fut>(&self, f: F) -> Result<T, CriticalError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        info!(lock = %self.name, "Enter critical section");
        let token = self
            .broker
            .acquire_lock(&self.name)
            .await
            .map_err(CriticalError::Lock)?;
        let held = HeldLock {
            broker: Arc::clone(&self.broker),
            token: Some(token),
        };

        debug!(lock = %self.name, "Executing critical section");
        let outcome = AssertUnwindSafe(async move { f().await }).catch_unwind().await;

        let released = held.release().await;
        info!(lock = %self.name, "Exit critical section");

        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                if let Err(e) = &released {
                    error!(lock = %self.name, error = %e, "Release after panic failed");
                }
                std::panic::resume_unwind(panic);
            }
        };

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(CriticalError::Lock(e)),
            (Err(e), released) => {
                if let Err(release_error) = released {
                    error!(
                        lock = %self.name,
                        error = %release_error,
                        "Release after failed critical section failed"
                    );
                }
                Err(CriticalError::Inner(e))
            }
        }
    }
}
