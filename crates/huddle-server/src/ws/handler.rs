use crate::auth::{verify_token, Claims};
use crate::sfu::Peer;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::Notifier;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Send a message straight to the socket, before the connection is registered
async fn send_direct(sender: &mut SplitSink<WebSocket, Message>, message: &ServerMessage) -> bool {
    let json = match serde_json::to_string(message) {
        Ok(j) => j,
        Err(e) => {
            tracing::error!("Failed to serialize message: {}", e);
            return false;
        }
    };
    sender.send(Message::Text(json.into())).await.is_ok()
}

/// Why a socket was turned away before joining the signaling loop
enum Handshake {
    Closed,
    Refused(&'static str),
}

/// The first frame must authenticate the socket
async fn authenticate(
    receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
) -> Result<Claims, Handshake> {
    let text = match receiver.next().await {
        Some(Ok(Message::Text(text))) => text,
        _ => return Err(Handshake::Closed),
    };

    match serde_json::from_str::<ClientMessage>(&text) {
        Ok(ClientMessage::Authenticate { token }) => {
            verify_token(&token, &state.config.jwt_secret).map_err(|e| {
                tracing::debug!("Rejected token: {}", e);
                Handshake::Refused("Invalid token")
            })
        }
        Ok(_) => Err(Handshake::Refused("First message must be authentication")),
        Err(e) => {
            tracing::warn!("Invalid auth message: {}", e);
            Err(Handshake::Refused("Invalid message format"))
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let claims = match authenticate(&mut receiver, &state).await {
        Ok(claims) => claims,
        Err(Handshake::Closed) => {
            tracing::warn!("WebSocket closed before authentication");
            return;
        }
        Err(Handshake::Refused(reason)) => {
            let refusal = ServerMessage::Error {
                message: reason.to_string(),
            };
            let _ = send_direct(&mut sender, &refusal).await;
            return;
        }
    };
    let user_id = claims.sub;
    state.directory.remember(user_id, &claims.username).await;

    let connection_id = Uuid::new_v4();
    if !send_direct(&mut sender, &ServerMessage::Authenticated { connection_id }).await {
        return;
    }

    tracing::info!("User {} authenticated on WebSocket", user_id);

    // Outbound messages are queued here and written by a dedicated task
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state
        .connections
        .add_connection(connection_id, user_id, tx)
        .await;

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    let peer = Peer {
        user_id,
        connection_id,
    };

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let client_msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!("Invalid message from {}: {}", user_id, e);
                        state
                            .connections
                            .send_to_connection(
                                connection_id,
                                &ServerMessage::Error {
                                    message: "Invalid message format".to_string(),
                                },
                            )
                            .await;
                        continue;
                    }
                };

                handle_client_message(&state, peer, client_msg).await;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error for user {}: {}", user_id, e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup on disconnect
    state.coordinator.disconnect(peer).await;
    state.connections.remove_connection(connection_id).await;
    send_task.abort();

    if !state.connections.is_user_online(user_id).await {
        state.directory.forget(user_id).await;
    }

    tracing::info!("User {} disconnected from WebSocket", user_id);
}

async fn handle_client_message(state: &AppState, peer: Peer, message: ClientMessage) {
    if let ClientMessage::Ping = message {
        state
            .connections
            .send_to_connection(peer.connection_id, &ServerMessage::Pong)
            .await;
        return;
    }

    let request = message.message_type();
    let subject = message.subject();
    tracing::debug!(user_id = %peer.user_id, request, "Signaling request");

    if let Err(e) = state.coordinator.dispatch(peer, message).await {
        if e.is_fatal() {
            tracing::error!(user_id = %peer.user_id, request, "Fatal relay failure: {}", e);
        } else {
            tracing::debug!(user_id = %peer.user_id, request, "Request failed: {}", e);
        }
        state
            .connections
            .send_to_connection(peer.connection_id, &e.to_message(request, subject))
            .await;
    }
}
