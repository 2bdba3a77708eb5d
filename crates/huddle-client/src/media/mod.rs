pub mod browser;
pub mod capture;
pub mod device;
pub mod screen;
pub mod session;
pub mod transport;

pub use browser::CoBrowse;
pub use capture::{CaptureBackend, CaptureError, CaptureRequest, LocalTrack, SyntheticCapture};
pub use device::{Device, DeviceError};
pub use screen::{ScreenShare, SelfView};
pub use session::{
    RemoteTile, SessionCommand, SessionError, SessionEvent, SessionOptions, SessionState,
    VoiceSession,
};
pub use transport::{PeerTransport, TransportError};
