//! WebRTC relay engine
//!
//! Each transport is an ICE gatherer, ICE transport and DTLS transport built
//! from the router's `webrtc` API; no SDP is involved. A producer reads RTP
//! from its receiver and writes every packet to one local track per consumer,
//! each consumer sending its track over its own transport.
//!
//! Media tasks wait for the DTLS handshake, so signaling answers never depend
//! on the network.

use super::relay::{ConsumerOptions, RelayError, RelayEvent, RelayWorker, WorkerSpawner};
use super::worker::{worker_settings, Engine, WorkerContext, WorkerHandle};
use super::RelaySettings;
use async_trait::async_trait;
use huddle_protocol::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind,
    RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpEncoding, RtpParameters,
    TransportOptions,
};
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, RwLock};
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
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_gatherer::{RTCIceGatherOptions, RTCIceGatherer};
use webrtc::ice_transport::ice_parameters::RTCIceParameters;
use webrtc::ice_transport::ice_role::RTCIceRole;
use webrtc::ice_transport::RTCIceTransport;
use webrtc::interceptor::registry::Registry;
use webrtc::interceptor::Interceptor;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpDecodingParameters, RTCRtpReceiveParameters};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

const GATHER_TIMEOUT: Duration = Duration::from_secs(5);

/// Consumer id -> the track forwarded to that consumer
type Fanout = Arc<RwLock<HashMap<Uuid, Arc<TrackLocalStaticRTP>>>>;

fn failed(e: impl Display) -> RelayError {
    RelayError::Failed(e.to_string())
}

/// Spawns WebRTC workers, each on its slice of the RTC port range
pub struct RtcWorkerSpawner {
    settings: RelaySettings,
}

impl RtcWorkerSpawner {
    pub fn new(settings: RelaySettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl WorkerSpawner for RtcWorkerSpawner {
    async fn spawn(&self, worker_id: usize) -> Result<Arc<dyn RelayWorker>, RelayError> {
        let settings = worker_settings(&self.settings, worker_id)?;
        let listen_ip: IpAddr = settings.listen_ip.parse().map_err(|_| {
            RelayError::PoolInit(format!("invalid listen address {}", settings.listen_ip))
        })?;

        tracing::info!(
            worker_id,
            rtc_min_port = settings.rtc_min_port,
            rtc_max_port = settings.rtc_max_port,
            "Relay worker started"
        );
        Ok(WorkerHandle::spawn(worker_id, move |context| {
            RtcEngine::new(context, settings, listen_ip)
        }))
    }
}

struct RtcRouter {
    api: Arc<API>,
    capabilities: RtpCapabilities,
    transports: HashSet<Uuid>,
}

struct RtcTransport {
    router_id: Uuid,
    api: Arc<API>,
    gatherer: Arc<RTCIceGatherer>,
    ice: Arc<RTCIceTransport>,
    dtls: Arc<RTCDtlsTransport>,
    interceptor: Arc<dyn Interceptor + Send + Sync>,
    /// Taken when the handshake starts
    connect: Option<watch::Sender<bool>>,
    ready: watch::Receiver<bool>,
    handshake: Option<JoinHandle<()>>,
    max_incoming_bitrate: Option<u32>,
    producers: HashSet<Uuid>,
    consumers: HashSet<Uuid>,
}

struct RtcProducer {
    router_id: Uuid,
    transport_id: Uuid,
    kind: MediaKind,
    codec: RtpCodecParameters,
    consumers: HashSet<Uuid>,
    fanout: Fanout,
    /// Dropping it stops the forwarding task
    _stop: oneshot::Sender<()>,
}

struct RtcConsumer {
    router_id: Uuid,
    transport_id: Uuid,
    producer_id: Uuid,
    _stop: oneshot::Sender<()>,
}

pub(crate) struct RtcEngine {
    context: WorkerContext,
    settings: RelaySettings,
    listen_ip: IpAddr,
    routers: HashMap<Uuid, RtcRouter>,
    transports: HashMap<Uuid, RtcTransport>,
    producers: HashMap<Uuid, RtcProducer>,
    consumers: HashMap<Uuid, RtcConsumer>,
}

impl RtcEngine {
    fn new(context: WorkerContext, settings: RelaySettings, listen_ip: IpAddr) -> Self {
        Self {
            context,
            settings,
            listen_ip,
            routers: HashMap::new(),
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    fn setting_engine(&self) -> Result<SettingEngine, RelayError> {
        let mut setting_engine = SettingEngine::default();
        let udp = EphemeralUDP::new(self.settings.rtc_min_port, self.settings.rtc_max_port)
            .map_err(|e| RelayError::Failed(format!("invalid RTC port range: {}", e)))?;
        setting_engine.set_udp_network(UDPNetwork::Ephemeral(udp));
        setting_engine.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);

        if let Some(announced) = &self.settings.announced_address {
            setting_engine.set_nat_1to1_ips(vec![announced.clone()], RTCIceCandidateType::Host);
        }
        if !self.listen_ip.is_unspecified() {
            let listen_ip = self.listen_ip;
            setting_engine.set_ip_filter(Box::new(move |ip: IpAddr| ip == listen_ip));
        }
        Ok(setting_engine)
    }

    async fn remove_consumer(&mut self, consumer_id: Uuid) {
        let Some(consumer) = self.consumers.remove(&consumer_id) else {
            return;
        };
        if let Some(transport) = self.transports.get_mut(&consumer.transport_id) {
            transport.consumers.remove(&consumer_id);
        }
        if let Some(producer) = self.producers.get_mut(&consumer.producer_id) {
            producer.consumers.remove(&consumer_id);
            producer.fanout.write().await.remove(&consumer_id);
        }
        self.context.emit(RelayEvent::ConsumerClosed {
            router_id: consumer.router_id,
            consumer_id,
            producer_id: consumer.producer_id,
        });
    }

    async fn remove_producer(&mut self, producer_id: Uuid) {
        let Some(producer) = self.producers.remove(&producer_id) else {
            return;
        };
        for consumer_id in &producer.consumers {
            self.remove_consumer(*consumer_id).await;
        }
        if let Some(transport) = self.transports.get_mut(&producer.transport_id) {
            transport.producers.remove(&producer_id);
        }
        self.context.emit(RelayEvent::ProducerClosed {
            router_id: producer.router_id,
            producer_id,
        });
    }

    async fn remove_transport(&mut self, transport_id: Uuid) {
        let Some(transport) = self.transports.remove(&transport_id) else {
            return;
        };
        for producer_id in &transport.producers {
            self.remove_producer(*producer_id).await;
        }
        for consumer_id in &transport.consumers {
            self.remove_consumer(*consumer_id).await;
        }
        if let Some(router) = self.routers.get_mut(&transport.router_id) {
            router.transports.remove(&transport_id);
        }

        if let Some(handshake) = &transport.handshake {
            handshake.abort();
        }
        let RtcTransport {
            gatherer, ice, dtls, ..
        } = transport;
        tokio::spawn(async move {
            if let Err(e) = dtls.stop().await {
                tracing::debug!("DTLS stop: {}", e);
            }
            if let Err(e) = ice.stop().await {
                tracing::debug!("ICE stop: {}", e);
            }
            if let Err(e) = gatherer.close().await {
                tracing::debug!("ICE gatherer close: {}", e);
            }
        });

        self.context.emit(RelayEvent::TransportClosed {
            router_id: transport.router_id,
            transport_id,
        });
    }
}

#[async_trait]
impl Engine for RtcEngine {
    async fn create_router(
        &mut self,
        codecs: Vec<RtpCodecCapability>,
    ) -> Result<(Uuid, RtpCapabilities), RelayError> {
        if codecs.is_empty() {
            return Err(RelayError::Unsupported(
                "router needs at least one codec".to_string(),
            ));
        }

        let mut payload_types = HashSet::new();
        let mut media_engine = MediaEngine::default();
        for codec in &codecs {
            if !payload_types.insert(codec.preferred_payload_type) {
                return Err(RelayError::Unsupported(format!(
                    "duplicate payload type {}",
                    codec.preferred_payload_type
                )));
            }
            media_engine
                .register_codec(codec_parameters(codec), codec_type(codec.kind))
                .map_err(|e| RelayError::Unsupported(format!("codec {}: {}", codec.mime_type, e)))?;
        }

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(failed)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(self.setting_engine()?)
            .build();

        let id = Uuid::new_v4();
        let capabilities = RtpCapabilities { codecs };
        self.routers.insert(
            id,
            RtcRouter {
                api: Arc::new(api),
                capabilities: capabilities.clone(),
                transports: HashSet::new(),
            },
        );

        tracing::debug!(worker_id = self.context.worker_id, router_id = %id, "Router created");
        Ok((id, capabilities))
    }

    async fn close_router(&mut self, router_id: Uuid) {
        let Some(router) = self.routers.get(&router_id) else {
            return;
        };
        let transports: Vec<Uuid> = router.transports.iter().copied().collect();
        for transport_id in transports {
            self.remove_transport(transport_id).await;
        }
        self.routers.remove(&router_id);
        tracing::debug!(worker_id = self.context.worker_id, router_id = %router_id, "Router closed");
    }

    async fn create_transport(&mut self, router_id: Uuid) -> Result<TransportOptions, RelayError> {
        let api = self
            .routers
            .get(&router_id)
            .map(|router| router.api.clone())
            .ok_or_else(|| RelayError::NotFound(format!("router {}", router_id)))?;

        let gatherer = Arc::new(
            api.new_ice_gatherer(RTCIceGatherOptions::default())
                .map_err(failed)?,
        );
        let ice = Arc::new(api.new_ice_transport(gatherer.clone()));
        let dtls = Arc::new(api.new_dtls_transport(ice.clone(), vec![]).map_err(failed)?);

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
        gatherer.gather().await.map_err(failed)?;
        if tokio::time::timeout(GATHER_TIMEOUT, done_rx).await.is_err() {
            tracing::warn!(router_id = %router_id, "ICE gathering timed out, using partial candidates");
        }

        let local_ice = gatherer.get_local_parameters().await.map_err(failed)?;
        let candidates = gatherer.get_local_candidates().await.map_err(failed)?;
        let local_dtls = dtls.get_local_parameters().map_err(failed)?;

        let interceptor = register_default_interceptors(Registry::new(), &mut MediaEngine::default())
            .map_err(failed)?
            .build("")
            .map_err(failed)?;

        let id = Uuid::new_v4();
        let (connect, ready) = watch::channel(false);
        self.transports.insert(
            id,
            RtcTransport {
                router_id,
                api,
                gatherer,
                ice,
                dtls,
                interceptor,
                connect: Some(connect),
                ready,
                handshake: None,
                max_incoming_bitrate: None,
                producers: HashSet::new(),
                consumers: HashSet::new(),
            },
        );
        if let Some(router) = self.routers.get_mut(&router_id) {
            router.transports.insert(id);
        }

        tracing::debug!(
            worker_id = self.context.worker_id,
            transport_id = %id,
            candidates = candidates.len(),
            "Transport created"
        );
        Ok(TransportOptions {
            id,
            ice_parameters: IceParameters {
                username_fragment: local_ice.username_fragment,
                password: local_ice.password,
                ice_lite: local_ice.ice_lite,
            },
            ice_candidates: candidates.iter().map(ice_candidate).collect(),
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: local_dtls
                    .fingerprints
                    .into_iter()
                    .map(|f| DtlsFingerprint {
                        algorithm: f.algorithm,
                        value: f.value,
                    })
                    .collect(),
            },
        })
    }

    async fn connect_transport(
        &mut self,
        transport_id: Uuid,
        ice_parameters: IceParameters,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), RelayError> {
        let transport = self
            .transports
            .get_mut(&transport_id)
            .ok_or_else(|| RelayError::NotFound(format!("transport {}", transport_id)))?;

        if dtls_parameters.fingerprints.is_empty() {
            return Err(RelayError::Failed("missing DTLS fingerprint".to_string()));
        }
        let Some(connect) = transport.connect.take() else {
            return Err(RelayError::Failed(format!(
                "transport {} already connected",
                transport_id
            )));
        };

        let remote_ice = RTCIceParameters {
            username_fragment: ice_parameters.username_fragment,
            password: ice_parameters.password,
            ice_lite: ice_parameters.ice_lite,
        };
        let remote_dtls = DTLSParameters {
            role: match dtls_parameters.role {
                DtlsRole::Auto => DTLSRole::Auto,
                DtlsRole::Client => DTLSRole::Client,
                DtlsRole::Server => DTLSRole::Server,
            },
            fingerprints: dtls_parameters
                .fingerprints
                .into_iter()
                .map(|f| RTCDtlsFingerprint {
                    algorithm: f.algorithm,
                    value: f.value,
                })
                .collect(),
        };

        let ice = transport.ice.clone();
        let dtls = transport.dtls.clone();
        let context = self.context.clone();
        transport.handshake = Some(tokio::spawn(async move {
            let result = async {
                ice.start(&remote_ice, Some(RTCIceRole::Controlled)).await?;
                dtls.start(remote_dtls).await?;
                Ok::<_, webrtc::Error>(())
            }
            .await;

            match result {
                Ok(()) => {
                    tracing::debug!(transport_id = %transport_id, "Transport connected");
                    let _ = connect.send(true);
                }
                Err(e) => {
                    tracing::warn!(transport_id = %transport_id, "Transport handshake failed: {}", e);
                    context.close_transport_later(transport_id);
                }
            }
        }));
        Ok(())
    }

    async fn set_max_incoming_bitrate(
        &mut self,
        transport_id: Uuid,
        bitrate: u32,
    ) -> Result<(), RelayError> {
        let limit = self.settings.worker_bitrate_limit;
        let transport = self
            .transports
            .get_mut(&transport_id)
            .ok_or_else(|| RelayError::NotFound(format!("transport {}", transport_id)))?;

        if bitrate > limit {
            return Err(RelayError::Failed(format!(
                "bitrate {} above worker limit {}",
                bitrate, limit
            )));
        }

        transport.max_incoming_bitrate = Some(bitrate);
        Ok(())
    }

    async fn produce(
        &mut self,
        transport_id: Uuid,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Uuid, RelayError> {
        let transport = self
            .transports
            .get(&transport_id)
            .ok_or_else(|| RelayError::NotFound(format!("transport {}", transport_id)))?;
        let router = self
            .routers
            .get(&transport.router_id)
            .ok_or_else(|| RelayError::NotFound(format!("router {}", transport.router_id)))?;

        let codec = rtp_parameters
            .primary_codec()
            .ok_or_else(|| RelayError::Unsupported("produce without codec".to_string()))?;
        let capability = router
            .capabilities
            .find(&codec.mime_type)
            .ok_or_else(|| RelayError::Unsupported(format!("codec {}", codec.mime_type)))?;
        if capability.kind != kind {
            return Err(RelayError::Unsupported(format!(
                "codec {} is not {}",
                codec.mime_type, kind
            )));
        }
        if codec.payload_type != capability.preferred_payload_type {
            return Err(RelayError::Unsupported(format!(
                "{} must use payload type {}",
                codec.mime_type, capability.preferred_payload_type
            )));
        }
        let ssrc = rtp_parameters
            .encodings
            .first()
            .map(|encoding| encoding.ssrc)
            .ok_or_else(|| RelayError::Unsupported("produce without ssrc".to_string()))?;

        let id = Uuid::new_v4();
        let fanout = Fanout::default();
        let (stop, stopped) = oneshot::channel();
        tokio::spawn(forward(
            id,
            Receive {
                api: transport.api.clone(),
                kind: codec_type(kind),
                dtls: transport.dtls.clone(),
                interceptor: transport.interceptor.clone(),
                ssrc,
                payload_type: codec.payload_type,
            },
            transport.ready.clone(),
            fanout.clone(),
            stopped,
        ));

        self.producers.insert(
            id,
            RtcProducer {
                router_id: transport.router_id,
                transport_id,
                kind,
                codec: codec.clone(),
                consumers: HashSet::new(),
                fanout,
                _stop: stop,
            },
        );
        if let Some(transport) = self.transports.get_mut(&transport_id) {
            transport.producers.insert(id);
        }

        Ok(id)
    }

    async fn consume(
        &mut self,
        transport_id: Uuid,
        producer_id: Uuid,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerOptions, RelayError> {
        let transport = self
            .transports
            .get(&transport_id)
            .ok_or_else(|| RelayError::NotFound(format!("transport {}", transport_id)))?;
        let producer = self
            .producers
            .get(&producer_id)
            .ok_or_else(|| RelayError::NotFound(format!("producer {}", producer_id)))?;

        if producer.router_id != transport.router_id {
            return Err(RelayError::Unsupported(
                "producer belongs to another router".to_string(),
            ));
        }
        if !rtp_capabilities.supports(&producer.codec.mime_type) {
            return Err(RelayError::Unsupported(format!(
                "consumer cannot receive {}",
                producer.codec.mime_type
            )));
        }

        let router = self
            .routers
            .get(&transport.router_id)
            .ok_or_else(|| RelayError::NotFound(format!("router {}", transport.router_id)))?;
        let capability = router
            .capabilities
            .find(&producer.codec.mime_type)
            .ok_or_else(|| {
                RelayError::Unsupported(format!("codec {}", producer.codec.mime_type))
            })?;

        let id = Uuid::new_v4();
        let track = Arc::new(TrackLocalStaticRTP::new(
            rtc_capability(capability),
            id.to_string(),
            producer_id.to_string(),
        ));
        let sender = Arc::new(
            transport
                .api
                .new_rtp_sender(
                    Some(track.clone() as Arc<dyn TrackLocal + Send + Sync>),
                    transport.dtls.clone(),
                    transport.interceptor.clone(),
                )
                .await,
        );
        let ssrc = sender
            .get_parameters()
            .await
            .encodings
            .first()
            .map(|encoding| encoding.ssrc)
            .ok_or_else(|| RelayError::Failed("sender has no encoding".to_string()))?;

        let rtp_parameters = RtpParameters {
            mid: Some(transport.consumers.len().to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: capability.mime_type.clone(),
                payload_type: capability.preferred_payload_type,
                clock_rate: capability.clock_rate,
                channels: capability.channels,
                parameters: capability.parameters.clone(),
            }],
            encodings: vec![RtpEncoding {
                ssrc,
                max_bitrate: None,
            }],
        };
        let kind = producer.kind;

        let (stop, stopped) = oneshot::channel();
        tokio::spawn(send(id, sender, transport.ready.clone(), stopped));
        producer.fanout.write().await.insert(id, track);

        self.consumers.insert(
            id,
            RtcConsumer {
                router_id: transport.router_id,
                transport_id,
                producer_id,
                _stop: stop,
            },
        );
        if let Some(transport) = self.transports.get_mut(&transport_id) {
            transport.consumers.insert(id);
        }
        if let Some(producer) = self.producers.get_mut(&producer_id) {
            producer.consumers.insert(id);
        }

        Ok(ConsumerOptions {
            id,
            producer_id,
            kind,
            rtp_parameters,
        })
    }

    async fn close_producer(&mut self, producer_id: Uuid) {
        self.remove_producer(producer_id).await;
    }

    async fn close_consumer(&mut self, consumer_id: Uuid) {
        self.remove_consumer(consumer_id).await;
    }

    async fn close_transport(&mut self, transport_id: Uuid) {
        self.remove_transport(transport_id).await;
    }

    async fn shutdown(&mut self) {
        let routers: Vec<Uuid> = self.routers.keys().copied().collect();
        for router_id in routers {
            self.close_router(router_id).await;
        }
    }
}

/// False if the transport went away before DTLS was up
async fn wait_ready(mut ready: watch::Receiver<bool>) -> bool {
    ready.wait_for(|up| *up).await.is_ok()
}

/// How a producer's RTP receiver is built once its transport is up
struct Receive {
    api: Arc<API>,
    kind: RTPCodecType,
    dtls: Arc<RTCDtlsTransport>,
    interceptor: Arc<dyn Interceptor + Send + Sync>,
    ssrc: u32,
    payload_type: u8,
}

/// Forward a producer's RTP to every consumer track until stopped
async fn forward(
    producer_id: Uuid,
    receive: Receive,
    ready: watch::Receiver<bool>,
    fanout: Fanout,
    mut stop: oneshot::Receiver<()>,
) {
    tokio::select! {
        _ = &mut stop => return,
        up = wait_ready(ready) => if !up {
            return;
        },
    }

    let receiver = receive
        .api
        .new_rtp_receiver(receive.kind, receive.dtls, receive.interceptor);
    let parameters = RTCRtpReceiveParameters {
        encodings: vec![RTCRtpDecodingParameters {
            ssrc: receive.ssrc,
            payload_type: receive.payload_type,
            ..Default::default()
        }],
    };
    if let Err(e) = receiver.receive(&parameters).await {
        tracing::warn!(producer_id = %producer_id, "Failed to start receiving: {}", e);
        return;
    }
    let Some(track) = receiver.tracks().await.into_iter().next() else {
        tracing::warn!(producer_id = %producer_id, "Receiver has no track");
        let _ = receiver.stop().await;
        return;
    };

    let mut forwarded = 0u64;
    loop {
        tokio::select! {
            _ = &mut stop => break,
            read = track.read_rtp() => match read {
                Ok((packet, _)) => {
                    forwarded += 1;
                    let tracks = fanout.read().await;
                    for (consumer_id, local) in tracks.iter() {
                        if let Err(e) = local.write_rtp(&packet).await {
                            tracing::debug!(consumer_id = %consumer_id, "RTP write failed: {}", e);
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(producer_id = %producer_id, "Producer track ended: {}", e);
                    break;
                }
            },
        }
    }

    tracing::debug!(producer_id = %producer_id, forwarded, "Forwarding stopped");
    if let Err(e) = receiver.stop().await {
        tracing::debug!("RTP receiver stop: {}", e);
    }
}

/// Send a consumer's track once its transport is up, draining RTCP until
/// stopped
async fn send(
    consumer_id: Uuid,
    sender: Arc<RTCRtpSender>,
    ready: watch::Receiver<bool>,
    mut stop: oneshot::Receiver<()>,
) {
    let up = tokio::select! {
        _ = &mut stop => false,
        up = wait_ready(ready) => up,
    };

    if up {
        let parameters = sender.get_parameters().await;
        match sender.send(&parameters).await {
            Ok(()) => loop {
                tokio::select! {
                    _ = &mut stop => break,
                    rtcp = sender.read_rtcp() => if rtcp.is_err() {
                        break;
                    },
                }
            },
            Err(e) => {
                tracing::warn!(consumer_id = %consumer_id, "Failed to start sending: {}", e);
            }
        }
    }

    if let Err(e) = sender.stop().await {
        tracing::debug!("RTP sender stop: {}", e);
    }
}

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

fn rtc_capability(codec: &RtpCodecCapability) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: codec.mime_type.clone(),
        clock_rate: codec.clock_rate,
        channels: codec.channels.unwrap_or(0) as u16,
        sdp_fmtp_line: codec.parameters.clone(),
        rtcp_feedback: codec
            .rtcp_feedback
            .iter()
            .map(|feedback| {
                // "nack pli" is type "nack" with parameter "pli"
                let (typ, parameter) = feedback.split_once(' ').unwrap_or((feedback.as_str(), ""));
                RTCPFeedback {
                    typ: typ.to_string(),
                    parameter: parameter.to_string(),
                }
            })
            .collect(),
    }
}

fn codec_parameters(codec: &RtpCodecCapability) -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: rtc_capability(codec),
        payload_type: codec.preferred_payload_type,
        ..Default::default()
    }
}

fn ice_candidate(candidate: &RTCIceCandidate) -> IceCandidate {
    IceCandidate {
        foundation: candidate.foundation.clone(),
        priority: candidate.priority,
        ip: candidate.address.clone(),
        port: candidate.port,
        protocol: candidate.protocol.to_string(),
        candidate_type: candidate.typ.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> RelaySettings {
        RelaySettings {
            workers: 1,
            listen_ip: "127.0.0.1".to_string(),
            rtc_min_port: 45000,
            rtc_max_port: 45099,
            worker_bitrate_limit: 2_000_000,
            ..Default::default()
        }
    }

    fn opus_parameters() -> RtpParameters {
        RtpParameters {
            mid: None,
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 111,
                clock_rate: 48000,
                channels: Some(2),
                parameters: String::new(),
            }],
            encodings: vec![RtpEncoding {
                ssrc: 1234,
                max_bitrate: None,
            }],
        }
    }

    fn client_ice() -> IceParameters {
        IceParameters {
            username_fragment: "clientufrag".to_string(),
            password: "clientpassword0123456789".to_string(),
            ice_lite: false,
        }
    }

    fn client_dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AA:BB".to_string(),
            }],
        }
    }

    async fn worker() -> Arc<dyn RelayWorker> {
        RtcWorkerSpawner::new(settings()).spawn(0).await.unwrap()
    }

    async fn router(worker: &Arc<dyn RelayWorker>) -> Uuid {
        let (router_id, _) = worker
            .create_router(vec![RtpCodecCapability::opus(), RtpCodecCapability::vp8()])
            .await
            .unwrap();
        router_id
    }

    #[tokio::test]
    async fn test_router_codecs_are_validated() {
        let worker = worker().await;

        let mut clash = RtpCodecCapability::vp8();
        clash.preferred_payload_type = RtpCodecCapability::opus().preferred_payload_type;
        let result = worker
            .create_router(vec![RtpCodecCapability::opus(), clash])
            .await;
        assert!(matches!(result, Err(RelayError::Unsupported(_))));
        assert!(matches!(
            worker.create_router(vec![]).await,
            Err(RelayError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_transport_offers_certificate_fingerprint() {
        let worker = worker().await;
        let router_id = router(&worker).await;

        let options = worker.create_webrtc_transport(router_id).await.unwrap();
        assert!(!options.ice_parameters.username_fragment.is_empty());
        assert!(!options.ice_parameters.password.is_empty());
        assert_eq!(options.dtls_parameters.role, DtlsRole::Auto);

        let fingerprint = options
            .dtls_parameters
            .fingerprints
            .iter()
            .find(|f| f.algorithm == "sha-256")
            .unwrap();
        // 32 bytes as colon separated hex
        assert_eq!(fingerprint.value.len(), 95);
        for candidate in &options.ice_candidates {
            assert!((45000..=45099).contains(&candidate.port));
            assert_eq!(candidate.ip, "127.0.0.1");
        }

        let other = worker.create_webrtc_transport(router_id).await.unwrap();
        assert_ne!(
            other.ice_parameters.username_fragment,
            options.ice_parameters.username_fragment
        );
    }

    #[tokio::test]
    async fn test_connect_needs_fingerprint_and_happens_once() {
        let worker = worker().await;
        let router_id = router(&worker).await;
        let transport = worker.create_webrtc_transport(router_id).await.unwrap();

        let mut bare = client_dtls();
        bare.fingerprints.clear();
        assert!(matches!(
            worker.connect_transport(transport.id, client_ice(), bare).await,
            Err(RelayError::Failed(_))
        ));

        worker
            .connect_transport(transport.id, client_ice(), client_dtls())
            .await
            .unwrap();
        assert!(worker
            .connect_transport(transport.id, client_ice(), client_dtls())
            .await
            .is_err());
        assert!(matches!(
            worker
                .connect_transport(Uuid::new_v4(), client_ice(), client_dtls())
                .await,
            Err(RelayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_produce_checks_payload_type_and_ssrc() {
        let worker = worker().await;
        let router_id = router(&worker).await;
        let transport = worker.create_webrtc_transport(router_id).await.unwrap();

        let mut wrong_pt = opus_parameters();
        wrong_pt.codecs[0].payload_type = 100;
        assert!(matches!(
            worker.produce(transport.id, MediaKind::Audio, wrong_pt).await,
            Err(RelayError::Unsupported(_))
        ));

        let mut no_ssrc = opus_parameters();
        no_ssrc.encodings.clear();
        assert!(matches!(
            worker.produce(transport.id, MediaKind::Audio, no_ssrc).await,
            Err(RelayError::Unsupported(_))
        ));

        assert!(matches!(
            worker
                .produce(transport.id, MediaKind::Video, opus_parameters())
                .await,
            Err(RelayError::Unsupported(_))
        ));
        worker
            .produce(transport.id, MediaKind::Audio, opus_parameters())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_closing_send_transport_cascades_to_remote_consumers() {
        let worker = worker().await;
        let mut events = worker.subscribe();
        let router_id = router(&worker).await;

        let send = worker.create_webrtc_transport(router_id).await.unwrap();
        let recv = worker.create_webrtc_transport(router_id).await.unwrap();
        let producer_id = worker
            .produce(send.id, MediaKind::Audio, opus_parameters())
            .await
            .unwrap();
        let consumer = worker
            .consume(
                recv.id,
                producer_id,
                RtpCapabilities {
                    codecs: vec![RtpCodecCapability::opus()],
                },
            )
            .await
            .unwrap();
        assert_eq!(consumer.kind, MediaKind::Audio);
        assert_eq!(consumer.rtp_parameters.codecs[0].payload_type, 111);
        assert_ne!(consumer.rtp_parameters.encodings[0].ssrc, 0);

        worker.close_transport(send.id).await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            RelayEvent::ConsumerClosed {
                router_id,
                consumer_id: consumer.id,
                producer_id,
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            RelayEvent::ProducerClosed {
                router_id,
                producer_id,
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            RelayEvent::TransportClosed {
                router_id,
                transport_id: send.id,
            }
        );

        worker.close_transport(send.id).await.unwrap();
        worker.close().await;
    }

    #[tokio::test]
    async fn test_spawner_rejects_bad_listen_address() {
        let spawner = RtcWorkerSpawner::new(RelaySettings {
            listen_ip: "not-an-ip".to_string(),
            ..settings()
        });
        assert!(matches!(
            spawner.spawn(0).await,
            Err(RelayError::PoolInit(_))
        ));
    }
}
