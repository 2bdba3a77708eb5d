use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Logical source of a produced track.
///
/// The tag is fixed for the lifetime of a producer and decides where the
/// consuming side places the track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProducerSource {
    Mic,
    Webcam,
    Screen,
    ScreenAudio,
    Browser,
    BrowserAudio,
}

/// Where a consumed track is rendered on the receiving client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placement {
    /// Played out, no tile
    AudioOutput,
    /// Generic video grid
    Grid,
    /// Screen-share tile (video and its audio)
    Screen,
    /// Co-browsing tile (video and its audio)
    CoBrowse,
}

impl ProducerSource {
    pub const ALL: [ProducerSource; 6] = [
        ProducerSource::Mic,
        ProducerSource::Webcam,
        ProducerSource::Screen,
        ProducerSource::ScreenAudio,
        ProducerSource::Browser,
        ProducerSource::BrowserAudio,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProducerSource::Mic => "mic",
            ProducerSource::Webcam => "webcam",
            ProducerSource::Screen => "screen",
            ProducerSource::ScreenAudio => "screen-audio",
            ProducerSource::Browser => "browser",
            ProducerSource::BrowserAudio => "browser-audio",
        }
    }

    /// The media kind a producer with this tag must carry
    pub fn kind(self) -> MediaKind {
        match self {
            ProducerSource::Mic | ProducerSource::ScreenAudio | ProducerSource::BrowserAudio => {
                MediaKind::Audio
            }
            ProducerSource::Webcam | ProducerSource::Screen | ProducerSource::Browser => {
                MediaKind::Video
            }
        }
    }

    pub fn placement(self) -> Placement {
        match self {
            ProducerSource::Mic => Placement::AudioOutput,
            ProducerSource::Webcam => Placement::Grid,
            ProducerSource::Screen | ProducerSource::ScreenAudio => Placement::Screen,
            ProducerSource::Browser | ProducerSource::BrowserAudio => Placement::CoBrowse,
        }
    }

    pub fn is_screen(self) -> bool {
        matches!(self, ProducerSource::Screen | ProducerSource::ScreenAudio)
    }

    pub fn is_browser(self) -> bool {
        matches!(self, ProducerSource::Browser | ProducerSource::BrowserAudio)
    }
}

impl fmt::Display for ProducerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown producer source: {0}")]
pub struct ParseSourceError(pub String);

impl FromStr for ProducerSource {
    type Err = ParseSourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProducerSource::ALL
            .into_iter()
            .find(|source| source.as_str() == s)
            .ok_or_else(|| ParseSourceError(s.to_string()))
    }
}

/// Direction of a transport as seen from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDirection::Send => write!(f, "send"),
            TransportDirection::Recv => write!(f, "recv"),
        }
    }
}

/// Codec supported by a router or a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    pub preferred_payload_type: u8,
    /// fmtp line, e.g. `minptime=10;useinbandfec=1`
    #[serde(default)]
    pub parameters: String,
    #[serde(default)]
    pub rtcp_feedback: Vec<String>,
}

impl RtpCodecCapability {
    pub fn opus() -> Self {
        Self {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            preferred_payload_type: 111,
            parameters: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec!["transport-cc".to_string()],
        }
    }

    pub fn vp8() -> Self {
        Self {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            preferred_payload_type: 96,
            parameters: String::new(),
            rtcp_feedback: vec!["nack".to_string(), "nack pli".to_string(), "ccm fir".to_string()],
        }
    }

    pub fn h264() -> Self {
        Self {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            clock_rate: 90000,
            channels: None,
            preferred_payload_type: 102,
            // Baseline profile, level 3.1
            parameters: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                .to_string(),
            rtcp_feedback: vec!["nack".to_string(), "nack pli".to_string()],
        }
    }

    pub fn matches(&self, mime_type: &str) -> bool {
        self.mime_type.eq_ignore_ascii_case(mime_type)
    }
}

/// Codec/capability description of a room's router, or of a device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodecCapability>,
}

impl RtpCapabilities {
    pub fn find(&self, mime_type: &str) -> Option<&RtpCodecCapability> {
        self.codecs.iter().find(|c| c.matches(mime_type))
    }

    pub fn supports(&self, mime_type: &str) -> bool {
        self.find(mime_type).is_some()
    }

    pub fn first_of_kind(&self, kind: MediaKind) -> Option<&RtpCodecCapability> {
        self.codecs.iter().find(|c| c.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncoding {
    pub ssrc: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
}

/// Codec parameters of a produced or consumed track
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncoding>,
}

impl RtpParameters {
    /// The codec actually sent; the first entry by convention
    pub fn primary_codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs.first()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub port: u16,
    pub protocol: String,
    #[serde(rename = "type")]
    pub candidate_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Everything a client needs to set up its side of a relay transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub id: Uuid,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Application data attached to a produce request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppData {
    pub source: ProducerSource,
}

/// The local object a failed request was about.
///
/// Replies to produce and consume requests carry it so the requester can
/// match a failure to its own pending entry without relying on reply order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RequestSubject {
    Produce { source: ProducerSource },
    Consume { producer_id: Uuid },
}

/// A producer as announced to other members of a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: Uuid,
    pub user_id: Uuid,
    pub source: ProducerSource,
    pub kind: MediaKind,
}

/// A member of a voice room with display metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub user_id: Uuid,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// The active shared-browser session of a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedBrowserInfo {
    pub room_id: Uuid,
    pub owner_id: Uuid,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

/// Remote-control input for a shared browser.
///
/// Coordinates are normalized to the shared viewport (0.0..=1.0).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum BrowserInputEvent {
    PointerMove { x: f32, y: f32 },
    Click { x: f32, y: f32, button: MouseButton },
    Scroll { delta_x: f32, delta_y: f32 },
    KeyPress {
        key: String,
        #[serde(default)]
        modifiers: Vec<String>,
    },
    Navigate { url: String },
}
