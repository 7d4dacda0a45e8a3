//! Broker interface step definitions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cucumber::{given, then, when, World};
use modelbus::broker::{Broker, LockToken, Subscription};

use crate::backend::{BrokerBackend, BrokerContext};

/// Test context for broker scenarios.
#[derive(World)]
#[world(init = Self::new)]
pub struct BrokerWorld {
    backend: BrokerBackend,
    context: Option<BrokerContext>,
    subscriptions: Vec<Subscription>,
    last_read: Option<Vec<u8>>,
    receivers: usize,
    counter: Arc<AtomicUsize>,
    overlaps: Arc<AtomicUsize>,
    tokens: Vec<LockToken>,
}

impl std::fmt::Debug for BrokerWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerWorld")
            .field("backend", &self.backend)
            .field("subscriptions", &self.subscriptions.len())
            .field("last_read", &self.last_read)
            .field("receivers", &self.receivers)
            .field("tokens", &self.tokens)
            .finish()
    }
}

impl BrokerWorld {
    fn new() -> Self {
        Self {
            backend: BrokerBackend::from_env(),
            context: None,
            subscriptions: Vec::new(),
            last_read: None,
            receivers: 0,
            counter: Arc::new(AtomicUsize::new(0)),
            overlaps: Arc::new(AtomicUsize::new(0)),
            tokens: Vec::new(),
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

    async fn subscribe(&mut self, count: usize, pattern: &str) {
        for _ in 0..count {
            let subscription = self
                .broker()
                .subscribe_pattern(pattern)
                .await
                .expect("Failed to subscribe");
            self.subscriptions.push(subscription);
        }
    }

    fn matching(&mut self, pattern: &str) -> impl Iterator<Item = &mut Subscription> {
        let pattern = pattern.to_string();
        self.subscriptions
            .iter_mut()
            .filter(move |s| s.pattern() == pattern)
    }
}

// --- Background ---

#[given("a broker backend")]
async fn given_broker_backend(world: &mut BrokerWorld) {
    println!("Using backend: {}", world.backend.name());
    world.context = Some(BrokerContext::new(world.backend).await);
}

// --- Keyed mailboxes ---

#[when(expr = "I write {string} to slot {string}")]
async fn when_write_slot(world: &mut BrokerWorld, value: String, key: String) {
    world
        .broker()
        .write_keyed(&key, value.into_bytes(), Some(Duration::from_secs(60)))
        .await
        .expect("Failed to write slot");
}

#[when(expr = "I read slot {string}")]
async fn when_read_slot(world: &mut BrokerWorld, key: String) {
    world.last_read = world
        .broker()
        .read_and_clear_keyed(&key)
        .await
        .expect("Failed to read slot");
}

#[when(expr = "I delete slot {string}")]
async fn when_delete_slot(world: &mut BrokerWorld, key: String) {
    world
        .broker()
        .delete_keyed(&key)
        .await
        .expect("Deleting a slot never fails");
}

#[then(expr = "the read returns {string}")]
async fn then_read_returns(world: &mut BrokerWorld, expected: String) {
    assert_eq!(world.last_read.as_deref(), Some(expected.as_bytes()));
}

#[then("the read returns nothing")]
async fn then_read_returns_nothing(world: &mut BrokerWorld) {
    assert_eq!(world.last_read, None);
}

// --- Queue ---

#[when(expr = "I push {string} to queue {string}")]
async fn when_push(world: &mut BrokerWorld, value: String, queue: String) {
    world
        .broker()
        .push(&queue, value.into_bytes())
        .await
        .expect("Failed to push");
}

#[then(expr = "popping queue {string} yields {string}, {string}, {string} and then nothing")]
async fn then_pop_three(world: &mut BrokerWorld, queue: String, a: String, b: String, c: String) {
    let broker = world.broker();
    for expected in [a, b, c] {
        let popped = broker.pop(&queue).await.expect("Failed to pop");
        assert_eq!(popped, Some(expected.into_bytes()));
    }
    assert_eq!(broker.pop(&queue).await.expect("Failed to pop"), None);
}

#[then(expr = "popping queue {string} yields nothing")]
async fn then_pop_nothing(world: &mut BrokerWorld, queue: String) {
    assert_eq!(world.broker().pop(&queue).await.expect("Failed to pop"), None);
}

// --- Broadcast ---

#[given(regex = r#"^(\d+) subscribers? to pattern "([^"]*)"$"#)]
async fn given_subscribers(world: &mut BrokerWorld, count: usize, pattern: String) {
    world.subscribe(count, &pattern).await;
}

#[when(regex = r#"^(\d+) subscribers? joins? pattern "([^"]*)"$"#)]
async fn when_subscribers_join(world: &mut BrokerWorld, count: usize, pattern: String) {
    world.subscribe(count, &pattern).await;
}

#[when(expr = "I publish {string} to topic {string}")]
async fn when_publish(world: &mut BrokerWorld, value: String, topic: String) {
    world.receivers = world
        .broker()
        .publish(&topic, value.into_bytes())
        .await
        .expect("Failed to publish");
}

#[then(expr = "the publish reached {int} subscribers")]
async fn then_publish_reached(world: &mut BrokerWorld, count: usize) {
    assert_eq!(world.receivers, count);
}

#[then(expr = "every {string} subscriber received {string}")]
async fn then_every_received(world: &mut BrokerWorld, pattern: String, expected: String) {
    let mut seen = 0;
    for subscription in world.matching(&pattern) {
        let message = tokio::time::timeout(Duration::from_secs(2), subscription.next())
            .await
            .expect("Broadcast not delivered in time");
        assert_eq!(message, Some(expected.clone().into_bytes()));
        seen += 1;
    }
    assert!(seen > 0, "no subscriber to {}", pattern);
}

#[then(expr = "no {string} subscriber received anything")]
async fn then_none_received(world: &mut BrokerWorld, pattern: String) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    for subscription in world.matching(&pattern) {
        assert_eq!(subscription.try_next().expect("Subscription closed"), None);
    }
}

// --- Named lock ---

#[when(expr = "{int} tasks each increment a shared counter under lock {string}")]
async fn when_tasks_increment(world: &mut BrokerWorld, tasks: usize, name: String) {
    let inside = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..tasks)
        .map(|_| {
            let broker = world.broker();
            let name = name.clone();
            let counter = Arc::clone(&world.counter);
            let overlaps = Arc::clone(&world.overlaps);
            let inside = Arc::clone(&inside);
            tokio::spawn(async move {
                let token = broker.acquire_lock(&name).await.expect("Failed to lock");
                if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                // Read-modify-write with a gap that loses updates unless serialized
                let seen = counter.load(Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.store(seen + 1, Ordering::SeqCst);
                inside.fetch_sub(1, Ordering::SeqCst);
                broker.release_lock(token).await.expect("Failed to unlock");
            })
        })
        .collect();

    for handle in handles {
        handle.await.expect("Task panicked");
    }
}

#[then(expr = "the counter is {int}")]
async fn then_counter_is(world: &mut BrokerWorld, expected: usize) {
    assert_eq!(world.counter.load(Ordering::SeqCst), expected);
}

#[then("no two tasks held the lock at once")]
async fn then_no_overlap(world: &mut BrokerWorld) {
    assert_eq!(world.overlaps.load(Ordering::SeqCst), 0);
}

#[when(expr = "I acquire lock {string} and release it")]
async fn when_acquire_and_release(world: &mut BrokerWorld, name: String) {
    let broker = world.broker();
    let token = broker.acquire_lock(&name).await.expect("Failed to lock");
    broker
        .release_lock(token.clone())
        .await
        .expect("Failed to unlock");
    world.tokens.push(token);
}

#[when(expr = "I acquire lock {string} again")]
async fn when_acquire_again(world: &mut BrokerWorld, name: String) {
    let token = world
        .broker()
        .acquire_lock(&name)
        .await
        .expect("Failed to lock");
    world.tokens.push(token);
}

#[then("releasing the first token again fails")]
async fn then_stale_release_fails(world: &mut BrokerWorld) {
    let stale = world.tokens[0].clone();
    assert!(world.broker().release_lock(stale).await.is_err());
}

#[then("releasing the second token succeeds")]
async fn then_fresh_release_succeeds(world: &mut BrokerWorld) {
    let fresh = world.tokens[1].clone();
    world
        .broker()
        .release_lock(fresh)
        .await
        .expect("Holder can release its own lock");
}
