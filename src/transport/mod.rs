//! WebSocket transport.
//!
//! Routes:
//! - `GET /ws?offset=<n>&session=<id>` — realtime connection
//! - `GET /health` — liveness
//!
//! Each connection gets a bounded outbound queue drained by its own writer
//! task. Sessions are parked on disconnect for transport-level recovery when
//! enabled.

use std::future::Future;
use std::io;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::{TcpListener, TcpSocket};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::chat::ChatService;

pub mod connection;
pub mod frames;
mod handler;
pub mod recovery;

pub use connection::WsConnection;
pub use frames::{ClientFrame, ConnectQuery, ServerFrame};
pub use recovery::{RecoveryRecorder, RecoveryRegistry, SessionId};

/// Pending connections the listener queues before `accept`.
const LISTEN_BACKLOG: u32 = 1024;

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: ChatService,
    /// `None` when transport recovery is disabled.
    pub recovery: Option<Arc<RecoveryRegistry>>,
    pub outbound_queue: usize,
}

/// Build the axum router (separated for testing).
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(handler::ws_upgrade))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// Bind a listener, optionally sharing the port with sibling workers.
pub async fn bind_listener(addr: &str, reuse_port: bool) -> io::Result<TcpListener> {
    let addr = tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address did not resolve"))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;

    #[cfg(unix)]
    if reuse_port {
        socket.set_reuseport(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;

    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Serve `router` on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "Listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
