//! Huddle Server Library
//!
//! This module exposes the server components for testing and embedding.

pub mod api;
pub mod auth;
pub mod directory;
pub mod error;
pub mod sfu;
pub mod state;
pub mod ws;

use anyhow::Result;

/// Create and configure the server application.
///
/// Starts the relay pool and the relay event listener; the returned state
/// gives access to the allocator for fatal-failure supervision.
pub async fn create_app(config: state::Config) -> Result<(axum::Router, state::AppState)> {
    let app_state = state::AppState::new(config);
    app_state.allocator.init().await?;
    app_state.coordinator.spawn_relay_listener();

    let router = api::create_router(app_state.clone());
    Ok((router, app_state))
}
