//! WebSocket handler for the change channel.
//!
//! Handles WebSocket connections, persists emitted changes and fans the
//! result out to every other connected client.

use axum::extract::ws::{Message, WebSocket};
use congregate_engine::{ChangeType, Schema};
use futures::{SinkExt, StreamExt};
use sqlx::PgPool;
use tokio::sync::mpsc;

use crate::websocket::{ClientMessage, ConnectionManager, ServerMessage};
use crate::AppState;

use super::apply_change;

/// Handle an established WebSocket connection.
///
/// This function:
/// 1. Registers the connection with the manager
/// 2. Spawns a task to forward outgoing messages
/// 3. Processes incoming messages in a loop
/// 4. Cleans up on disconnect
pub async fn handle_websocket_connection(socket: WebSocket, state: AppState, client_id: String) {
    let AppState {
        pool,
        conn_manager,
        schema,
        ..
    } = state;

    // Split the socket into sender and receiver
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Create channel for sending messages to this connection
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let conn_id = conn_manager.register(client_id.clone(), tx);

    tracing::info!(
        conn_id = %conn_id,
        client_id = %client_id,
        "WebSocket client connected"
    );

    // Forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize WebSocket message: {}", e);
                }
            }
        }
    });

    // Messages are handled one at a time, so a client's changes persist in
    // the order it emitted them.
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let response =
                    process_message(&text, &pool, &schema, &conn_manager, &conn_id).await;
                conn_manager.send_to(&conn_id, response);
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!("Binary messages not supported");
            }
            Ok(Message::Ping(data)) => {
                tracing::trace!("Received ping: {} bytes", data.len());
            }
            Ok(Message::Pong(_)) => {
                tracing::trace!("Received pong");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    conn_manager.unregister(&conn_id);
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        client_id = %client_id,
        active_connections = conn_manager.connection_count(),
        active_clients = conn_manager.client_count(),
        "WebSocket client disconnected"
    );
}

/// Process a client message and return the reply for its sender.
async fn process_message(
    text: &str,
    pool: &PgPool,
    schema: &Schema,
    conn_manager: &ConnectionManager,
    conn_id: &str,
) -> ServerMessage {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return ServerMessage::error(format!("Invalid message format: {}", e), None);
        }
    };

    match client_msg {
        ClientMessage::Emit {
            event,
            payload,
            request_id,
        } => {
            if ChangeType::from_event(&event) != Some(payload.kind) {
                tracing::warn!(
                    event = %event,
                    kind = payload.kind.as_str(),
                    "Emitted event does not match change type"
                );
                return ServerMessage::error(
                    format!("event {} does not match change type {}", event, payload.kind),
                    request_id,
                );
            }

            match apply_change(pool, schema, payload).await {
                Ok(ack) => {
                    if ack.error.is_none() {
                        let broadcast = ServerMessage::changes(ack.clone());
                        let sent = conn_manager.broadcast_except(conn_id, broadcast);
                        tracing::debug!(
                            sent_to = sent,
                            collection = %ack.collection,
                            "Broadcast change to connected clients"
                        );
                    }
                    ServerMessage::Ack {
                        request_id,
                        payload: ack,
                    }
                }
                Err(e) => ServerMessage::error(e.to_string(), request_id),
            }
        }

        ClientMessage::Ping => ServerMessage::Pong,
    }
}
