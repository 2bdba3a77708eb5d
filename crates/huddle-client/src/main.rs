use anyhow::Result;
use clap::Parser;
use huddle_client::media::{SessionCommand, SessionEvent, SessionOptions, SyntheticCapture};
use huddle_client::network::VoiceClient;
use huddle_client::state::VoiceRoomState;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Join a Huddle voice room from the command line
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Server base URL
    #[arg(long, env = "HUDDLE_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Access token issued by the server
    #[arg(long, env = "HUDDLE_TOKEN")]
    token: String,

    /// Voice room to join
    #[arg(long, env = "HUDDLE_ROOM")]
    room: Uuid,

    /// Do not produce the microphone
    #[arg(long)]
    muted: bool,

    /// Produce the camera on join
    #[arg(long)]
    webcam: bool,

    /// Share the screen once connected
    #[arg(long)]
    screen: bool,

    /// Start a shared browser on this page once connected
    #[arg(long)]
    browser: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,huddle_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    tracing::info!("Starting Huddle client...");

    let options = SessionOptions {
        mic: !args.muted,
        webcam: args.webcam,
        browser_audio: false,
    };
    let capture = Arc::new(SyntheticCapture::new());
    let (client, mut events) =
        VoiceClient::connect(&args.server, &args.token, args.room, options, capture).await?;
    let room = VoiceRoomState::new();

    let mut startup = Vec::new();
    if args.screen {
        startup.push(SessionCommand::StartScreenShare { with_audio: false });
    }
    if let Some(url) = args.browser {
        startup.push(SessionCommand::StartSharedBrowser { url });
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                room.apply(&event).await;
                match &event {
                    SessionEvent::StateChanged(state) => {
                        tracing::info!(%state, "Session state");
                        if room.is_connected().await {
                            for command in startup.drain(..) {
                                if let Err(e) = client.command(command).await {
                                    tracing::warn!("Startup command failed: {}", e);
                                }
                            }
                        }
                    }
                    SessionEvent::TileAdded(tile) => {
                        let view = room.read().await;
                        tracing::info!(
                            "{} started {} ({:?})",
                            view.display_name(tile.user_id),
                            tile.source,
                            tile.placement
                        );
                    }
                    SessionEvent::BrowserInput { from_user_id, event } => {
                        tracing::info!("Browser input from {}: {:?}", from_user_id, event);
                    }
                    SessionEvent::Notice(message) => tracing::warn!("{}", message),
                    other => tracing::debug!("{:?}", other),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Leaving voice room");
                if let Err(e) = client.leave().await {
                    tracing::debug!("Leave: {}", e);
                }
            }
        }
    }

    Ok(())
}
