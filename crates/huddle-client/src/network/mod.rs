mod websocket;

pub use websocket::SignalingConnection;

use crate::media::{
    CaptureBackend, SessionCommand, SessionError, SessionEvent, SessionOptions, SessionState,
    VoiceSession,
};
use anyhow::Result;
use jsonwebtoken::{DecodingKey, Validation};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: Uuid,
    #[allow(dead_code)]
    username: String,
}

/// The user id a token was issued for.
///
/// The server verifies the signature; the client only needs to recognise
/// its own producers and browser sessions.
pub fn user_id_from_token(token: &str) -> Result<Uuid> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    let data = jsonwebtoken::decode::<TokenClaims>(
        token,
        &DecodingKey::from_secret(&[]),
        &validation,
    )?;
    Ok(data.claims.sub)
}

/// WebSocket endpoint for a server base URL
pub fn ws_url(server_url: &str) -> String {
    let base = server_url
        .trim_end_matches('/')
        .replace("http://", "ws://")
        .replace("https://", "wss://");
    if base.ends_with("/ws") {
        base
    } else {
        format!("{}/ws", base)
    }
}

type CommandReply = oneshot::Sender<Result<(), SessionError>>;

/// Handle to a voice session running on its own task
#[derive(Clone)]
pub struct VoiceClient {
    user_id: Uuid,
    commands: mpsc::UnboundedSender<(SessionCommand, CommandReply)>,
}

impl VoiceClient {
    /// Connect, authenticate and join `room_id`. Session events arrive on the
    /// returned receiver until the session is closed.
    pub async fn connect(
        server_url: &str,
        token: &str,
        room_id: Uuid,
        options: SessionOptions,
        capture: Arc<dyn CaptureBackend>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        let user_id = user_id_from_token(token)?;
        let connection = SignalingConnection::connect(&ws_url(server_url), token).await?;

        let (events_tx, events) = mpsc::unbounded_channel();
        let mut session = VoiceSession::new(
            user_id,
            capture,
            connection.sender.clone(),
            events_tx,
            options,
        );
        session.join(room_id)?;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(session, connection, commands_rx));

        Ok((Self { user_id, commands }, events))
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub async fn command(&self, command: SessionCommand) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send((command, reply))
            .map_err(|_| anyhow::anyhow!("Voice session has ended"))?;
        response
            .await
            .map_err(|_| anyhow::anyhow!("Voice session has ended"))??;
        Ok(())
    }

    pub async fn leave(&self) -> Result<()> {
        self.command(SessionCommand::Leave).await
    }
}

async fn run(
    mut session: VoiceSession,
    connection: SignalingConnection,
    mut commands: mpsc::UnboundedReceiver<(SessionCommand, CommandReply)>,
) {
    let SignalingConnection {
        connection_id,
        sender,
        mut incoming,
    } = connection;
    // The session holds its own sender
    drop(sender);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some((command, reply)) => {
                    let _ = reply.send(session.command(command).await);
                }
                None => session.leave(),
            },
            message = incoming.recv() => match message {
                Some(message) => session.handle(message).await,
                None => {
                    tracing::warn!("Signaling connection lost");
                    session.connection_closed();
                }
            },
        }

        if session.state() == SessionState::Closed {
            break;
        }
    }

    tracing::debug!(connection_id = %connection_id, "Voice session task finished");
}
