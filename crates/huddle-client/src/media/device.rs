//! Local media device
//!
//! Holds the codecs this client can encode and decode. Once loaded with a
//! room's router capabilities it answers what can be produced or consumed,
//! builds the RTP parameters for outgoing tracks and owns the WebRTC API the
//! room's transports are created from.

use super::transport::build_api;
use huddle_protocol::{
    MediaKind, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpEncoding,
    RtpParameters,
};
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use webrtc::api::API;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device has not loaded router capabilities")]
    NotLoaded,

    #[error("device is already loaded")]
    AlreadyLoaded,

    #[error("no codec in common with the room")]
    NoCommonCodec,

    #[error("cannot produce {0}")]
    CannotProduce(MediaKind),

    #[error("webrtc setup failed: {0}")]
    Rtc(String),
}

#[derive(Clone)]
pub struct Device {
    local_codecs: Vec<RtpCodecCapability>,
    /// Intersection with the router, using the router's payload types
    rtp_capabilities: Option<RtpCapabilities>,
    api: Option<Arc<API>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("local_codecs", &self.local_codecs)
            .field("rtp_capabilities", &self.rtp_capabilities)
            .finish_non_exhaustive()
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

impl Device {
    pub fn new() -> Self {
        Self::with_codecs(vec![
            RtpCodecCapability::opus(),
            RtpCodecCapability::vp8(),
            RtpCodecCapability::h264(),
        ])
    }

    pub fn with_codecs(local_codecs: Vec<RtpCodecCapability>) -> Self {
        Self {
            local_codecs,
            rtp_capabilities: None,
            api: None,
        }
    }

    pub fn load(&mut self, router: &RtpCapabilities) -> Result<(), DeviceError> {
        if self.rtp_capabilities.is_some() {
            return Err(DeviceError::AlreadyLoaded);
        }

        let codecs: Vec<RtpCodecCapability> = router
            .codecs
            .iter()
            .filter(|codec| self.local_codecs.iter().any(|c| c.matches(&codec.mime_type)))
            .cloned()
            .collect();
        if codecs.is_empty() {
            return Err(DeviceError::NoCommonCodec);
        }
        let api = build_api(&codecs).map_err(|e| DeviceError::Rtc(e.to_string()))?;

        tracing::debug!(
            codecs = ?codecs.iter().map(|c| c.mime_type.as_str()).collect::<Vec<_>>(),
            "Device loaded"
        );
        self.rtp_capabilities = Some(RtpCapabilities { codecs });
        self.api = Some(Arc::new(api));
        Ok(())
    }

    pub fn loaded(&self) -> bool {
        self.rtp_capabilities.is_some()
    }

    /// Capabilities sent with consume requests
    pub fn rtp_capabilities(&self) -> Result<&RtpCapabilities, DeviceError> {
        self.rtp_capabilities.as_ref().ok_or(DeviceError::NotLoaded)
    }

    pub fn can_produce(&self, kind: MediaKind) -> bool {
        self.rtp_capabilities
            .as_ref()
            .is_some_and(|caps| caps.first_of_kind(kind).is_some())
    }

    pub fn can_consume(&self, mime_type: &str) -> bool {
        self.rtp_capabilities
            .as_ref()
            .is_some_and(|caps| caps.supports(mime_type))
    }

    /// Parameters for a new outgoing track of `kind`
    pub fn rtp_parameters(&self, kind: MediaKind) -> Result<RtpParameters, DeviceError> {
        let caps = self.rtp_capabilities()?;
        let codec = caps
            .first_of_kind(kind)
            .ok_or(DeviceError::CannotProduce(kind))?;

        Ok(RtpParameters {
            mid: None,
            codecs: vec![RtpCodecParameters {
                mime_type: codec.mime_type.clone(),
                payload_type: codec.preferred_payload_type,
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                parameters: codec.parameters.clone(),
            }],
            encodings: vec![RtpEncoding {
                ssrc: rand::thread_rng().r#gen(),
                max_bitrate: None,
            }],
        })
    }

    /// API the room's transports are built from
    pub fn api(&self) -> Result<Arc<API>, DeviceError> {
        self.api.clone().ok_or(DeviceError::NotLoaded)
    }
}
