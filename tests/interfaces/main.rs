//! Interface tests for broker backends and the RPC layer using Cucumber.
//!
//! These tests verify that every broker implementation conforms to the same
//! contract, and that dispatchers and workers behave identically on top of it.
//! Select a backend via environment variable:
//!
//! ```bash
//! # In-memory (default)
//! cargo test --test interfaces --features test-utils
//!
//! # Redis (uses testcontainers)
//! BROKER_BACKEND=redis cargo test --test interfaces --features test-utils,redis
//! ```

mod backend;
mod steps;

use cucumber::World;
use steps::broker::BrokerWorld;
use steps::rpc::RpcWorld;

#[tokio::main]
async fn main() {
    println!("\n=== Running Broker Interface Tests ===\n");
    BrokerWorld::cucumber()
        .fail_on_skipped()
        .run("tests/interfaces/features/broker.feature")
        .await;

    println!("\n=== Running RPC Interface Tests ===\n");
    RpcWorld::cucumber()
        .fail_on_skipped()
        .run("tests/interfaces/features/rpc.feature")
        .await;
}
