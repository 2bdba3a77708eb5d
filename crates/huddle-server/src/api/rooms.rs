use crate::auth::AuthUser;
use crate::error::Result;
use crate::sfu::RoomStats;
use crate::state::AppState;
use axum::{extract::State, Json};
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomsResponse {
    pub rooms: Vec<RoomStats>,
    pub routers: usize,
    pub connections: usize,
}

pub async fn list_rooms(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<RoomsResponse>> {
    tracing::debug!("Room overview requested by {}", auth.username);

    Ok(Json(RoomsResponse {
        rooms: state.coordinator.room_stats().await,
        routers: state.allocator.router_count().await,
        connections: state.connections.connection_count().await,
    }))
}
