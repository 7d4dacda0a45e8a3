//! modelbus - broker-backed RPC for model services
//!
//! Dispatchers push requests onto a shared broker; workers pop them, run the
//! named method against a model service and write the reply to a
//! single-use keyed mailbox. Broadcasts reach every running worker.

pub mod broker;
pub mod config;
pub mod critical;
pub mod dispatcher;
pub mod envelope;
pub mod service;
pub mod utils;
pub mod worker;

#[cfg(all(feature = "memory", any(test, feature = "test-utils")))]
pub mod test_utils;

pub use broker::{init_broker, Broker, BrokerConfig, BrokerError};
pub use critical::{CriticalError, CriticalSection};
pub use dispatcher::{DispatchError, Dispatcher};
pub use envelope::{CorrelationKey, Envelope, Reply};
pub use service::{Handler, HandlerError, Model, ModelService, Request};
pub use worker::{Worker, WorkerConfig, WorkerError, WorkerHandle};
