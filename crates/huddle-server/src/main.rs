use anyhow::Result;
use huddle_server::{create_app, state};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Huddle server...");

    let config = state::Config::load()?;
    let bind_address = config.bind_address.clone();

    let (app, app_state) = create_app(config).await?;
    let fatal = app_state.allocator.wait_fatal();

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!("Listening on {}", bind_address);

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown requested");
    });

    tokio::select! {
        result = server => {
            result?;
            app_state.allocator.close().await;
            Ok(())
        }
        err = fatal => {
            // Relay state cannot be rebuilt in place; let the supervisor restart us
            tracing::error!("Relay failure, exiting: {}", err);
            Err(err.into())
        }
    }
}
