//! Collaborators the coordinator consults: who may join a room, and how a
//! user is displayed to the rest of it.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayInfo {
    pub name: String,
    pub avatar_ref: Option<String>,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn display_info(&self, user_id: Uuid) -> DisplayInfo;
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn may_join(&self, user_id: Uuid, room_id: Uuid) -> bool;
}

/// Display names learned from token claims of connected users
#[derive(Default)]
pub struct SessionDirectory {
    names: RwLock<HashMap<Uuid, String>>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn remember(&self, user_id: Uuid, username: &str) {
        self.names
            .write()
            .await
            .insert(user_id, username.to_string());
    }

    pub async fn forget(&self, user_id: Uuid) {
        self.names.write().await.remove(&user_id);
    }
}

#[async_trait]
impl UserDirectory for SessionDirectory {
    async fn display_info(&self, user_id: Uuid) -> DisplayInfo {
        let name = self.names.read().await.get(&user_id).cloned();
        DisplayInfo {
            // Unknown users get a short id-derived name
            name: name.unwrap_or_else(|| format!("user-{}", &user_id.simple().to_string()[..8])),
            avatar_ref: None,
        }
    }
}

/// Optional allow-list of room ids; without one every room is open
#[derive(Debug, Clone, Default)]
pub struct RoomAllowList {
    rooms: Option<HashSet<Uuid>>,
}

impl RoomAllowList {
    pub fn new(rooms: Option<Vec<Uuid>>) -> Self {
        Self {
            rooms: rooms.map(|rooms| rooms.into_iter().collect()),
        }
    }
}

#[async_trait]
impl Authorizer for RoomAllowList {
    async fn may_join(&self, _user_id: Uuid, room_id: Uuid) -> bool {
        self.rooms
            .as_ref()
            .is_none_or(|rooms| rooms.contains(&room_id))
    }
}
