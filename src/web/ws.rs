//! WebSocket signaling endpoint
//!
//! Each socket becomes a [`Link`] served by [`serve`] in its room:
//! - `/ws` joins the default room
//! - `/ws/:room` joins (or creates) the named room
//! - a ping is sent every `heartbeat_secs` to keep idle sockets alive

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::channel::Link;
use crate::server::{serve, DEFAULT_ROOM};
use crate::state::AppState;

/// WebSocket upgrade handler for the default room
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, DEFAULT_ROOM.to_string()))
}

/// WebSocket upgrade handler for a named room
pub async fn ws_room_handler(
    ws: WebSocketUpgrade,
    Path(room): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, room))
}

/// Pump frames between the socket and the connection task
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, room_name: String) {
    let (socket_side, session_side) = Link::pair();
    let session = state.rooms.join(&room_name, session_side.outgoing.clone());
    let shutdown = state.rooms.shutdown_token().child_token();
    let connection = tokio::spawn(serve(session, session_side, shutdown));

    let Link {
        outgoing: to_session,
        incoming: mut from_session,
    } = socket_side;
    let (mut sender, mut receiver) = socket.split();

    info!("Signaling client connected to room {}", room_name);
    let mut heartbeat_interval = tokio::time::interval(state.heartbeat_interval());

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if to_session.send(text).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("Ignoring binary frame");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Signaling client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket receive error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            frame = from_session.recv() => {
                match frame {
                    Some(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            warn!("Failed to send to client, disconnecting");
                            break;
                        }
                    }
                    // Connection task ended (shutdown)
                    None => break,
                }
            }

            _ = heartbeat_interval.tick() => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    warn!("Failed to send ping, disconnecting");
                    break;
                }
            }
        }
    }

    drop(to_session);
    if let Err(e) = connection.await {
        warn!("Connection task failed: {}", e);
    }
    let _ = sender.send(Message::Close(None)).await;
    state.rooms.release(&room_name);
    debug!("WebSocket handler exiting");
}
