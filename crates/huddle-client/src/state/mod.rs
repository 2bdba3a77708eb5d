use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::media::{RemoteTile, SelfView, SessionEvent, SessionState};
use huddle_protocol::{MemberInfo, Placement, ProducerSource, SharedBrowserInfo};

/// Shared view of the current voice room, fed by session events
#[derive(Debug, Clone, Default)]
pub struct VoiceRoomState {
    inner: Arc<RwLock<RoomView>>,
}

#[derive(Debug, Clone)]
pub struct RoomView {
    pub state: SessionState,
    pub participants: HashMap<Uuid, MemberInfo>,
    /// Remote tiles keyed by producer id
    pub tiles: HashMap<Uuid, RemoteTile>,
    pub self_view: SelfView,
    pub local_sources: BTreeSet<ProducerSource>,
    pub shared_browser: Option<SharedBrowserInfo>,
    /// Most recent first
    pub notices: Vec<String>,
}

impl Default for RoomView {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            participants: HashMap::new(),
            tiles: HashMap::new(),
            self_view: SelfView::Avatar,
            local_sources: BTreeSet::new(),
            shared_browser: None,
            notices: Vec::new(),
        }
    }
}

const MAX_NOTICES: usize = 20;

impl RoomView {
    pub fn apply(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::StateChanged(state) => {
                self.state = *state;
                if *state == SessionState::Closed {
                    self.participants.clear();
                    self.tiles.clear();
                    self.local_sources.clear();
                    self.shared_browser = None;
                }
            }
            SessionEvent::MembersSeeded(members) => {
                self.participants = members.iter().map(|m| (m.user_id, m.clone())).collect();
            }
            SessionEvent::MemberJoined(member) => {
                self.participants.insert(member.user_id, member.clone());
            }
            SessionEvent::MemberLeft(user_id) => {
                self.participants.remove(user_id);
                self.tiles.retain(|_, tile| tile.user_id != *user_id);
            }
            SessionEvent::TileAdded(tile) => {
                self.tiles.insert(tile.producer_id, tile.clone());
            }
            SessionEvent::TileRemoved { producer_id, .. } => {
                self.tiles.remove(producer_id);
            }
            SessionEvent::LocalSourceStarted(source) => {
                self.local_sources.insert(*source);
            }
            SessionEvent::LocalSourceStopped(source) => {
                self.local_sources.remove(source);
            }
            SessionEvent::SelfViewChanged(view) => self.self_view = *view,
            SessionEvent::SharedBrowserStarted(info) => {
                self.shared_browser = Some(info.clone());
            }
            SessionEvent::SharedBrowserStopped(_) => self.shared_browser = None,
            SessionEvent::BrowserInput { .. } => {}
            SessionEvent::Notice(message) => {
                self.notices.insert(0, message.clone());
                self.notices.truncate(MAX_NOTICES);
            }
        }
    }

    /// Tiles rendered in `placement`, in a stable order
    pub fn tiles_in(&self, placement: Placement) -> Vec<&RemoteTile> {
        let mut tiles: Vec<&RemoteTile> = self
            .tiles
            .values()
            .filter(|t| t.placement == placement)
            .collect();
        tiles.sort_by_key(|t| (t.user_id, t.source));
        tiles
    }

    pub fn display_name(&self, user_id: Uuid) -> String {
        self.participants
            .get(&user_id)
            .map(|m| m.display_name.clone())
            .unwrap_or_else(|| format!("User {}", &user_id.to_string()[..8]))
    }
}

impl VoiceRoomState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, RoomView> {
        self.inner.read().await
    }

    pub async fn apply(&self, event: &SessionEvent) {
        self.inner.write().await.apply(event);
    }

    pub async fn is_connected(&self) -> bool {
        matches!(
            self.inner.read().await.state,
            SessionState::TransportsPending | SessionState::Active
        )
    }
}
