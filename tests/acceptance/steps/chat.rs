//! Publish, broadcast and catch-up step definitions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chorus::bus::{BroadcastBus, ChannelBus};
use chorus::chat::{ChatService, Connection, PublishOutcome, RecoveryPending};
use chorus::config::SqliteConfig;
use chorus::storage::{MessageStore, SqliteMessageStore};
use chorus::test_utils::RecordingConnection;
use cucumber::{given, then, when, World};
use futures::TryStreamExt;
use tempfile::TempDir;

/// How long a client is given to receive asynchronous broadcasts.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

struct Client {
    worker: usize,
    connection: Arc<RecordingConnection>,
}

/// Test context: N chat services over one SQLite file and one channel bus.
#[derive(World)]
#[world(init = Self::new)]
pub struct ChatWorld {
    dir: Option<TempDir>,
    store: Option<Arc<dyn MessageStore>>,
    workers: Vec<ChatService>,
    clients: HashMap<String, Client>,
    pending: HashMap<String, RecoveryPending>,
    outcomes: Vec<PublishOutcome>,
}

impl fmt::Debug for ChatWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatWorld")
            .field("workers", &self.workers.len())
            .field("clients", &self.clients.keys().collect::<Vec<_>>())
            .field("outcomes", &self.outcomes)
            .finish()
    }
}

impl ChatWorld {
    fn new() -> Self {
        Self {
            dir: None,
            store: None,
            workers: Vec::new(),
            clients: HashMap::new(),
            pending: HashMap::new(),
            outcomes: Vec::new(),
        }
    }

    fn worker(&self, index: usize) -> &ChatService {
        self.workers
            .get(index)
            .unwrap_or_else(|| panic!("No worker {}", index))
    }

    fn client(&self, name: &str) -> &Client {
        self.clients
            .get(name)
            .unwrap_or_else(|| panic!("No client {}", name))
    }

    async fn open_store(&self) -> SqliteMessageStore {
        let dir = self.dir.as_ref().expect("Store directory not initialized");
        let config = SqliteConfig {
            path: dir.path().join("chat.db").to_string_lossy().to_string(),
            max_connections: 4,
        };
        SqliteMessageStore::open(&config)
            .await
            .expect("Failed to open store")
    }

    async fn stored_count(&self) -> usize {
        let store = self.store.as_ref().expect("Store not initialized");
        let messages: Vec<_> = store
            .scan_after(0)
            .try_collect()
            .await
            .expect("Failed to scan store");
        messages.len()
    }
}

fn parse_offsets(offsets: &str) -> Vec<i64> {
    offsets
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().expect("Invalid offset"))
        .collect()
}

// --- Background ---

#[given(expr = "{int} workers sharing one store and one bus")]
async fn given_workers(world: &mut ChatWorld, count: usize) {
    world.dir = Some(TempDir::new().expect("Failed to create temp dir"));
    world.store = Some(Arc::new(world.open_store().await));

    let first = ChannelBus::new();
    let mut buses: Vec<Arc<dyn BroadcastBus>> = Vec::with_capacity(count);
    for _ in 1..count {
        buses.push(Arc::new(first.attach()));
    }
    buses.insert(0, Arc::new(first));

    for bus in buses {
        // Each worker has its own pool on the shared file.
        let store: Arc<dyn MessageStore> = Arc::new(world.open_store().await);
        let service = ChatService::new(store, bus);
        service
            .start(Vec::new())
            .await
            .expect("Failed to start service");
        world.workers.push(service);
    }
}

// --- Given steps ---

#[given(expr = "client {string} connected to worker {int}")]
async fn given_client_connected(world: &mut ChatWorld, name: String, worker: usize) {
    connect(world, name, worker, false, 0).await;
}

#[given(expr = "{int} messages were published on worker {int}")]
async fn given_messages_published(world: &mut ChatWorld, count: usize, worker: usize) {
    for i in 1..=count {
        let outcome = world
            .worker(worker)
            .publish(&format!("message {}", i), Some(&format!("seed-{}", i)))
            .await;
        assert!(outcome.should_acknowledge(), "Seed publish failed: {:?}", outcome);
    }
}

// --- When steps ---

async fn connect(world: &mut ChatWorld, name: String, worker: usize, recovered: bool, offset: i64) {
    let connection = RecordingConnection::new();
    world
        .worker(worker)
        .connect(connection.clone(), recovered, offset)
        .await;
    world.clients.insert(name, Client { worker, connection });
}

#[when(expr = "client {string} connects to worker {int} with offset {int}")]
async fn when_client_connects(world: &mut ChatWorld, name: String, worker: usize, offset: i64) {
    connect(world, name, worker, false, offset).await;
}

#[when(expr = "client {string} connects to worker {int} recovered with offset {int}")]
async fn when_client_recovers(world: &mut ChatWorld, name: String, worker: usize, offset: i64) {
    connect(world, name, worker, true, offset).await;
}

#[when(expr = "client {string} starts connecting to worker {int} with offset {int}")]
async fn when_client_starts_connecting(
    world: &mut ChatWorld,
    name: String,
    worker: usize,
    offset: i64,
) {
    let connection = RecordingConnection::new();
    world.worker(worker).attach(connection.clone()).await;
    world.pending.insert(
        name.clone(),
        RecoveryPending::new(connection.id(), false, offset),
    );
    world.clients.insert(name, Client { worker, connection });
}

#[when(expr = "{string} finishes connecting")]
async fn when_client_finishes_connecting(world: &mut ChatWorld, name: String) {
    let pending = world
        .pending
        .remove(&name)
        .unwrap_or_else(|| panic!("{} is not connecting", name));
    let client = world.client(&name);
    let connection = client.connection.clone();

    // Let the in-flight broadcast reach the pending connection first.
    tokio::time::sleep(Duration::from_millis(50)).await;

    world
        .worker(client.worker)
        .activate(pending, connection.as_ref())
        .await;
}

#[when(expr = "{string} publishes {string} with token {string} on worker {int}")]
async fn when_publish_with_token(
    world: &mut ChatWorld,
    _client: String,
    content: String,
    token: String,
    worker: usize,
) {
    let outcome = world.worker(worker).publish(&content, Some(&token)).await;
    world.outcomes.push(outcome);
}

#[when(expr = "{string} publishes {string} without a token on worker {int}")]
async fn when_publish_without_token(
    world: &mut ChatWorld,
    _client: String,
    content: String,
    worker: usize,
) {
    let outcome = world.worker(worker).publish(&content, None).await;
    world.outcomes.push(outcome);
}

#[when(expr = "{string} disconnects from worker {int}")]
async fn when_client_disconnects(world: &mut ChatWorld, name: String, worker: usize) {
    let connection = world.client(&name).connection.clone();
    world.worker(worker).detach(connection.id()).await;
}

// --- Then steps ---

#[then("the publish is acknowledged")]
async fn then_publish_acknowledged(world: &mut ChatWorld) {
    assert!(!world.outcomes.is_empty(), "Nothing was published");
    for outcome in &world.outcomes {
        assert!(outcome.should_acknowledge(), "Not acknowledged: {:?}", outcome);
    }
}

#[then(expr = "the store holds {int} message(s)")]
async fn then_store_holds(world: &mut ChatWorld, count: usize) {
    assert_eq!(world.stored_count().await, count);
}

#[then(expr = "{string} receives offsets {string}")]
async fn then_client_receives(world: &mut ChatWorld, name: String, offsets: String) {
    let expected = parse_offsets(&offsets);
    let connection = world.client(&name).connection.clone();

    let deadline = tokio::time::Instant::now() + DELIVERY_TIMEOUT;
    while connection.offsets().len() < expected.len() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Extra deliveries would be duplicates; give them a moment to show up.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(connection.offsets(), expected, "Offsets delivered to {}", name);
}

#[then(expr = "{string} has received nothing")]
async fn then_client_received_nothing(world: &mut ChatWorld, name: String) {
    let connection = world.client(&name).connection.clone();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        connection.offsets().is_empty(),
        "{} received {:?}",
        name,
        connection.offsets()
    );
}
