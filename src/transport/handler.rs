//! WebSocket connection handler.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::connection::{spawn_writer, WsConnection};
use super::frames::{ClientFrame, ConnectQuery, ServerFrame};
use super::recovery::SessionId;
use super::AppState;
use crate::chat::{Connection, DeliveryError, RecoveryPending};
use crate::message::{ChatMessage, Offset};

pub(super) async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn handle_socket(socket: WebSocket, state: AppState, query: ConnectQuery) {
    let (sink, mut stream) = socket.split();
    let (connection, frames) = WsConnection::new(state.outbound_queue);
    let connection = Arc::new(connection);
    let id = connection.id();
    let writer = spawn_writer(id, sink, frames);

    // Registered before resuming so no broadcast slips between the two.
    state.service.attach(connection.clone()).await;

    let resumed = match (&state.recovery, query.session) {
        (Some(registry), Some(session)) => registry
            .resume(session, query.offset)
            .await
            .map(|missed| (session, missed)),
        _ => None,
    };
    let recovered = resumed.is_some();
    let session = resumed
        .as_ref()
        .map_or_else(SessionId::new, |(session, _)| *session);

    info!(
        connection = %id,
        session = %session,
        recovered,
        prior_offset = query.offset,
        "Client connected"
    );

    let mut replayed = HashSet::new();
    let greeted = connection
        .send_frame(ServerFrame::Welcome { session, recovered })
        .await;
    if greeted.is_ok() {
        if let Some((_, missed)) = resumed {
            replayed = replay_missed(connection.as_ref(), missed, query.offset).await;
        }
    }

    let pending = RecoveryPending::new(id, recovered, query.offset).with_replayed(replayed);
    let activation = state.service.activate(pending, connection.as_ref());
    tokio::pin!(activation);
    let mut activated = false;

    loop {
        tokio::select! {
            active = &mut activation, if !activated => {
                activated = true;
                debug!(
                    connection = %active.session().id,
                    session = %session,
                    caught_up = active.catch_up().map_or(0, |r| r.delivered),
                    "Connection live"
                );
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if handle_text(&state, &connection, &text).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection = %id, error = %e, "Socket read failed");
                    break;
                }
            },
        }
    }

    // Parked while still attached, so the recent-broadcast ring covers every
    // broadcast this connection could have missed, queued frames included.
    if let Some(registry) = &state.recovery {
        registry.park(session).await;
    }
    state.service.detach(id).await;
    writer.abort();

    info!(connection = %id, session = %session, "Client disconnected");
}

/// Send missed broadcasts above `offset`, each offset once.
/// Returns the offsets actually sent.
async fn replay_missed(
    connection: &dyn Connection,
    missed: Vec<Arc<ChatMessage>>,
    offset: Offset,
) -> HashSet<Offset> {
    let mut delivered = HashSet::new();
    for message in missed {
        if message.offset <= offset || delivered.contains(&message.offset) {
            continue;
        }
        let sent = message.offset;
        if connection.emit(message).await.is_err() {
            break;
        }
        delivered.insert(sent);
    }
    delivered
}

async fn handle_text(
    state: &AppState,
    connection: &WsConnection,
    text: &str,
) -> Result<(), DeliveryError> {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(connection = %connection.id(), error = %e, "Ignoring malformed frame");
            return Ok(());
        }
    };

    match frame {
        ClientFrame::Publish {
            content,
            token,
            ack,
        } => {
            let outcome = state.service.publish(&content, token.as_deref()).await;
            if outcome.should_acknowledge() {
                connection.send_frame(ServerFrame::Ack { ack }).await?;
            }
        }
    }

    Ok(())
}
