//! Shared-browser sessions
//!
//! A room has at most one shared browser. Its initiator owns it: only the
//! owner may stop it, produce its media or receive remote-control input.

use chrono::{DateTime, Utc};
use huddle_protocol::SharedBrowserInfo;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrowserError {
    #[error("a shared browser is already active in this room")]
    AlreadyActive,

    #[error("only the shared browser owner may do that")]
    NotOwner,

    #[error("no shared browser is active in this room")]
    NotActive,
}

#[derive(Debug, Clone)]
pub struct SharedBrowserSession {
    pub owner_id: Uuid,
    pub url: String,
    pub started_at: DateTime<Utc>,
}

impl SharedBrowserSession {
    pub fn new(owner_id: Uuid, url: String) -> Self {
        Self {
            owner_id,
            url,
            started_at: Utc::now(),
        }
    }

    pub fn info(&self, room_id: Uuid) -> SharedBrowserInfo {
        SharedBrowserInfo {
            room_id,
            owner_id: self.owner_id,
            url: self.url.clone(),
        }
    }
}

/// Start a session in `slot`, refusing if one is active
pub(crate) fn start(
    slot: &mut Option<SharedBrowserSession>,
    owner_id: Uuid,
    url: String,
) -> Result<&SharedBrowserSession, BrowserError> {
    if slot.is_some() {
        return Err(BrowserError::AlreadyActive);
    }
    Ok(slot.insert(SharedBrowserSession::new(owner_id, url)))
}

/// Stop the session in `slot` on behalf of `requester`
pub(crate) fn stop(
    slot: &mut Option<SharedBrowserSession>,
    requester: Uuid,
) -> Result<SharedBrowserSession, BrowserError> {
    match slot {
        None => Err(BrowserError::NotActive),
        Some(session) if session.owner_id != requester => Err(BrowserError::NotOwner),
        Some(_) => slot.take().ok_or(BrowserError::NotActive),
    }
}
