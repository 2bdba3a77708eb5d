//! Screen-share sub-state
//!
//! Sharing the screen replaces the local self view without touching the
//! microphone producer. Ending the share puts the self view back.

use super::capture::CaptureRequest;
use huddle_protocol::ProducerSource;

/// What the local user sees in their own tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelfView {
    #[default]
    Avatar,
    Camera,
    Screen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenShare {
    restore: SelfView,
    with_audio: bool,
}

impl ScreenShare {
    pub fn begin(current: SelfView, with_audio: bool) -> Self {
        Self {
            restore: current,
            with_audio,
        }
    }

    pub fn with_audio(&self) -> bool {
        self.with_audio
    }

    pub fn capture_requests(&self) -> Vec<CaptureRequest> {
        let mut requests = vec![CaptureRequest::new(ProducerSource::Screen)];
        if self.with_audio {
            requests.push(CaptureRequest::new(ProducerSource::ScreenAudio));
        }
        requests
    }

    /// The self view once sharing stops. The camera may have been started or
    /// stopped during the share.
    pub fn end(self, camera_live: bool) -> SelfView {
        match (self.restore, camera_live) {
            (SelfView::Camera, false) => SelfView::Avatar,
            (_, true) => SelfView::Camera,
            (view, false) => view,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restores_previous_view() {
        let share = ScreenShare::begin(SelfView::Camera, false);
        assert_eq!(share.capture_requests().len(), 1);
        assert_eq!(share.end(true), SelfView::Camera);

        let share = ScreenShare::begin(SelfView::Avatar, true);
        assert_eq!(share.capture_requests().len(), 2);
        assert_eq!(share.end(false), SelfView::Avatar);
    }

    #[test]
    fn test_camera_change_during_share() {
        assert_eq!(
            ScreenShare::begin(SelfView::Camera, false).end(false),
            SelfView::Avatar
        );
        assert_eq!(
            ScreenShare::begin(SelfView::Avatar, false).end(true),
            SelfView::Camera
        );
    }
}
