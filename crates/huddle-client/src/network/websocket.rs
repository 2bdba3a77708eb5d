use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{ClientMessage, ServerMessage};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// An authenticated signaling connection.
///
/// Outgoing frames go through `sender`; incoming frames arrive on `incoming`
/// until the socket closes.
pub struct SignalingConnection {
    pub connection_id: Uuid,
    pub sender: mpsc::UnboundedSender<ClientMessage>,
    pub incoming: mpsc::UnboundedReceiver<ServerMessage>,
}

impl SignalingConnection {
    pub async fn connect(url: &str, token: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        // Authenticate
        let auth_msg = ClientMessage::Authenticate {
            token: token.to_string(),
        };
        let json = serde_json::to_string(&auth_msg)?;
        write.send(Message::Text(json.into())).await?;

        let connection_id = match read.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text)? {
                ServerMessage::Authenticated { connection_id } => {
                    tracing::info!("WebSocket authenticated with connection ID: {}", connection_id);
                    connection_id
                }
                ServerMessage::Error { message } => {
                    anyhow::bail!("Authentication failed: {}", message);
                }
                _ => {
                    anyhow::bail!("Unexpected response during authentication");
                }
            },
            _ => anyhow::bail!("Connection closed during authentication"),
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (incoming_tx, incoming) = mpsc::unbounded_channel::<ServerMessage>();

        // Outgoing; the socket closes once every sender is gone
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };

                if write.send(Message::Text(json.into())).await.is_err() {
                    tracing::error!("Failed to send WebSocket message");
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Incoming
        tokio::spawn(async move {
            while let Some(result) = read.next().await {
                match result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            if incoming_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("Unparseable server message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        let tx_ping = tx.downgrade();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(tx) = tx_ping.upgrade() else {
                    break;
                };
                if tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            connection_id,
            sender: tx,
            incoming,
        })
    }
}
