//! Client end of a relay transport
//!
//! The relay hands out ICE and DTLS parameters for each transport. The
//! client gathers its own candidates, answers with its parameters, and once
//! the server has accepted them drives the ICE check and DTLS handshake as
//! the controlling side.

use huddle_protocol::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind,
    RtpCodecCapability, TransportOptions,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::dtls_transport::dtls_fingerprint::RTCDtlsFingerprint;
use webrtc::dtls_transport::dtls_parameters::DTLSParameters;
use webrtc::dtls_transport::dtls_role::DTLSRole;
use webrtc::dtls_transport::RTCDtlsTransport;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_gatherer::{RTCIceGatherOptions, RTCIceGatherer};
use webrtc::ice_transport::ice_parameters::RTCIceParameters;
use webrtc::ice_transport::ice_protocol::RTCIceProtocol;
use webrtc::ice_transport::ice_role::RTCIceRole;
use webrtc::ice_transport::RTCIceTransport;
use webrtc::interceptor::registry::Registry;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};

const GATHER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("webrtc: {0}")]
    Rtc(#[from] webrtc::Error),

    #[error("transport {0} is already connecting")]
    AlreadyConnecting(Uuid),
}

/// WebRTC API for one room, built from the codecs the device settled on
pub(crate) fn build_api(codecs: &[RtpCodecCapability]) -> Result<API, webrtc::Error> {
    let mut media_engine = MediaEngine::default();
    for codec in codecs {
        let kind = match codec.kind {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        };
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: codec.mime_type.clone(),
                    clock_rate: codec.clock_rate,
                    channels: codec.channels.unwrap_or(0) as u16,
                    sdp_fmtp_line: codec.parameters.clone(),
                    rtcp_feedback: vec![],
                },
                payload_type: codec.preferred_payload_type,
                ..Default::default()
            },
            kind,
        )?;
    }
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    let mut setting_engine = SettingEngine::default();
    setting_engine.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);
    // The relay always answers as DTLS server
    setting_engine.set_answering_dtls_role(DTLSRole::Client)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build())
}

pub struct PeerTransport {
    id: Uuid,
    remote: TransportOptions,
    gatherer: Arc<RTCIceGatherer>,
    ice: Arc<RTCIceTransport>,
    dtls: Arc<RTCDtlsTransport>,
    handshake: Option<JoinHandle<()>>,
}

impl PeerTransport {
    /// Gather local candidates for the transport the server described
    pub async fn gather(api: &API, remote: TransportOptions) -> Result<Self, TransportError> {
        let gatherer = Arc::new(api.new_ice_gatherer(RTCIceGatherOptions::default())?);
        let ice = Arc::new(api.new_ice_transport(gatherer.clone()));
        let dtls = Arc::new(api.new_dtls_transport(ice.clone(), vec![])?);

        let (done_tx, done_rx) = oneshot::channel();
        let mut done_tx = Some(done_tx);
        gatherer.on_local_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if candidate.is_none() {
                if let Some(done) = done_tx.take() {
                    let _ = done.send(());
                }
            }
            Box::pin(async {})
        }));
        gatherer.gather().await?;
        if tokio::time::timeout(GATHER_TIMEOUT, done_rx).await.is_err() {
            tracing::warn!(transport_id = %remote.id, "ICE gathering timed out");
        }

        Ok(Self {
            id: remote.id,
            remote,
            gatherer,
            ice,
            dtls,
            handshake: None,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Parameters for the connect request
    pub async fn local_parameters(
        &self,
    ) -> Result<(IceParameters, DtlsParameters), TransportError> {
        let ice = self.gatherer.get_local_parameters().await?;
        let dtls = self.dtls.get_local_parameters()?;

        Ok((
            IceParameters {
                username_fragment: ice.username_fragment,
                password: ice.password,
                ice_lite: ice.ice_lite,
            },
            DtlsParameters {
                role: DtlsRole::Client,
                fingerprints: dtls
                    .fingerprints
                    .into_iter()
                    .map(|f| DtlsFingerprint {
                        algorithm: f.algorithm,
                        value: f.value,
                    })
                    .collect(),
            },
        ))
    }

    /// Start ICE and DTLS towards the relay. Returns immediately; the
    /// handshake runs in the background until it succeeds or the transport
    /// is closed.
    pub fn connect(&mut self) -> Result<(), TransportError> {
        if self.handshake.is_some() {
            return Err(TransportError::AlreadyConnecting(self.id));
        }

        let transport_id = self.id;
        let remote_ice = RTCIceParameters {
            username_fragment: self.remote.ice_parameters.username_fragment.clone(),
            password: self.remote.ice_parameters.password.clone(),
            ice_lite: self.remote.ice_parameters.ice_lite,
        };
        let remote_dtls = DTLSParameters {
            role: DTLSRole::Server,
            fingerprints: self
                .remote
                .dtls_parameters
                .fingerprints
                .iter()
                .map(|f| RTCDtlsFingerprint {
                    algorithm: f.algorithm.clone(),
                    value: f.value.clone(),
                })
                .collect(),
        };
        let candidates: Vec<RTCIceCandidate> =
            self.remote.ice_candidates.iter().map(rtc_candidate).collect();
        let ice = self.ice.clone();
        let dtls = self.dtls.clone();

        self.handshake = Some(tokio::spawn(async move {
            let result = async {
                for candidate in candidates {
                    ice.add_remote_candidate(Some(candidate)).await?;
                }
                ice.start(&remote_ice, Some(RTCIceRole::Controlling)).await?;
                dtls.start(remote_dtls).await?;
                Ok::<_, webrtc::Error>(())
            }
            .await;

            match result {
                Ok(()) => tracing::info!(transport_id = %transport_id, "Media transport up"),
                Err(e) => {
                    tracing::warn!(transport_id = %transport_id, "Transport handshake failed: {}", e)
                }
            }
        }));
        Ok(())
    }

    /// Tear the transport down in the background
    pub fn close(self) {
        if let Some(handshake) = &self.handshake {
            handshake.abort();
        }
        let Self {
            id,
            gatherer,
            ice,
            dtls,
            ..
        } = self;
        tokio::spawn(async move {
            if let Err(e) = dtls.stop().await {
                tracing::debug!(transport_id = %id, "DTLS stop: {}", e);
            }
            if let Err(e) = ice.stop().await {
                tracing::debug!(transport_id = %id, "ICE stop: {}", e);
            }
            if let Err(e) = gatherer.close().await {
                tracing::debug!(transport_id = %id, "ICE gatherer close: {}", e);
            }
        });
    }
}

fn rtc_candidate(candidate: &IceCandidate) -> RTCIceCandidate {
    RTCIceCandidate {
        foundation: candidate.foundation.clone(),
        priority: candidate.priority,
        address: candidate.ip.clone(),
        protocol: RTCIceProtocol::from(candidate.protocol.as_str()),
        port: candidate.port,
        typ: RTCIceCandidateType::from(candidate.candidate_type.as_str()),
        component: 1,
        ..Default::default()
    }
}
