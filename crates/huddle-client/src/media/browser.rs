//! Co-browsing sub-state
//!
//! Mirrors the room's shared-browser session. Only the owner's client
//! captures the browser and applies remote input; everyone else forwards
//! input to the owner.

use super::capture::CaptureRequest;
use huddle_protocol::{ProducerSource, SharedBrowserInfo};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoBrowse {
    info: SharedBrowserInfo,
    local_owner: bool,
}

impl CoBrowse {
    pub fn new(info: SharedBrowserInfo, local_user: Uuid) -> Self {
        let local_owner = info.owner_id == local_user;
        Self { info, local_owner }
    }

    pub fn info(&self) -> &SharedBrowserInfo {
        &self.info
    }

    pub fn is_owner(&self) -> bool {
        self.local_owner
    }

    /// Sources the owner produces for the session
    pub fn capture_requests(&self, with_audio: bool) -> Vec<CaptureRequest> {
        let mut requests = vec![CaptureRequest::browser(
            ProducerSource::Browser,
            &self.info.url,
        )];
        if with_audio {
            requests.push(CaptureRequest::browser(
                ProducerSource::BrowserAudio,
                &self.info.url,
            ));
        }
        requests
    }

    /// Whether input from `from_user_id` should be applied here
    pub fn accepts_input_from(&self, from_user_id: Uuid) -> bool {
        self.local_owner && from_user_id != self.info.owner_id
    }
}
