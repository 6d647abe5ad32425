//! One worker process: store, bus, chat service and WebSocket listener.
//!
//! ```text
//! worker
//!     ├── MessageStore (shared SQLite file)
//!     ├── BroadcastBus (channel or named pipes)
//!     │     ├── HubDelivery      → local connections
//!     │     └── RecoveryRecorder → parked sessions
//!     ├── ChatService
//!     └── axum listener (/ws, /health)
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bus::{init_bus, BroadcastBus, MessageHandler, WorkerIdentity};
use crate::chat::ChatService;
use crate::config::Config;
use crate::storage::{init_storage, MessageStore};
use crate::transport::{self, AppState, RecoveryRecorder, RecoveryRegistry};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How often expired parked sessions are dropped.
const RECOVERY_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// A running worker.
pub struct WorkerHandle {
    /// The address the worker is listening on.
    pub addr: SocketAddr,
    service: ChatService,
    recovery: Option<Arc<RecoveryRegistry>>,
    shutdown_tx: oneshot::Sender<()>,
    server: JoinHandle<std::io::Result<()>>,
    sweeper: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn service(&self) -> &ChatService {
        &self.service
    }

    /// Parked sessions, when recovery is enabled.
    pub fn recovery(&self) -> Option<&Arc<RecoveryRegistry>> {
        self.recovery.as_ref()
    }

    /// Stop accepting connections and wait for the listener to close.
    pub async fn shutdown(self) -> Result<(), BoxError> {
        let _ = self.shutdown_tx.send(());
        if let Some(sweeper) = self.sweeper {
            sweeper.abort();
        }
        self.server.await??;
        Ok(())
    }
}

/// Start a worker with store and bus built from `config`.
pub async fn spawn(config: &Config, index: usize) -> Result<WorkerHandle, BoxError> {
    let store = init_storage(&config.storage).await?;
    let bus = init_bus(&config.messaging, &WorkerIdentity::new(index), store.clone()).await?;
    spawn_with(config, index, store, bus).await
}

/// Start a worker on an existing store and bus.
pub async fn spawn_with(
    config: &Config,
    index: usize,
    store: Arc<dyn MessageStore>,
    bus: Arc<dyn BroadcastBus>,
) -> Result<WorkerHandle, BoxError> {
    let service = ChatService::new(store, bus);

    let recovery = config
        .recovery
        .enabled
        .then(|| Arc::new(RecoveryRegistry::new(&config.recovery)));

    let mut observers: Vec<Box<dyn MessageHandler>> = Vec::new();
    if let Some(registry) = &recovery {
        observers.push(Box::new(RecoveryRecorder::new(registry.clone())));
    }
    service.start(observers).await?;

    let sweeper = recovery
        .as_ref()
        .map(|registry| registry.spawn_sweeper(RECOVERY_SWEEP_INTERVAL));

    let state = AppState {
        service: service.clone(),
        recovery: recovery.clone(),
        outbound_queue: config.server.outbound_queue,
    };

    let listen_addr = config.server.addr_for(&config.cluster, index);
    let listener = transport::bind_listener(&listen_addr, config.cluster.reuse_port).await?;
    let addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server = tokio::spawn(transport::serve(
        listener,
        transport::router(state),
        async {
            let _ = shutdown_rx.await;
        },
    ));

    info!(worker = index, addr = %addr, "Worker listening");

    Ok(WorkerHandle {
        addr,
        service,
        recovery,
        shutdown_tx,
        server,
        sweeper,
    })
}

/// Run a worker until Ctrl-C or SIGTERM.
pub async fn run(config: &Config, index: usize) -> Result<(), BoxError> {
    let handle = spawn(config, index).await?;

    shutdown_signal().await;
    info!(worker = index, "Shutting down");

    if let Err(e) = handle.shutdown().await {
        error!(worker = index, error = %e, "Listener stopped with error");
        return Err(e);
    }
    Ok(())
}

/// Resolve on Ctrl-C, or on SIGTERM from the supervisor.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
