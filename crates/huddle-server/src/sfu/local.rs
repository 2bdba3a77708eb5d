//! In-memory relay engine
//!
//! Keeps the routing tables of a real worker without opening sockets, so the
//! coordinator and allocator can be exercised deterministically.

use super::relay::{ConsumerOptions, RelayError, RelayEvent, RelayWorker, WorkerSpawner};
use super::worker::{worker_settings, Engine, WorkerContext, WorkerHandle};
use super::RelaySettings;
use async_trait::async_trait;
use huddle_protocol::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind,
    RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpEncoding, RtpParameters,
    TransportOptions,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Start a worker backed by a [`LocalEngine`] on the ports of `settings`
pub(crate) fn spawn_local(id: usize, settings: &RelaySettings) -> Arc<WorkerHandle> {
    let settings = settings.clone();
    WorkerHandle::spawn(id, move |context| LocalEngine::new(context, &settings))
}

/// Spawns in-memory workers, each on its slice of the RTC port range
pub(crate) struct LocalWorkerSpawner {
    settings: RelaySettings,
}

impl LocalWorkerSpawner {
    pub fn new(settings: RelaySettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl WorkerSpawner for LocalWorkerSpawner {
    async fn spawn(&self, worker_id: usize) -> Result<Arc<dyn RelayWorker>, RelayError> {
        let settings = worker_settings(&self.settings, worker_id)?;
        Ok(spawn_local(worker_id, &settings))
    }
}

struct RouterState {
    capabilities: RtpCapabilities,
    transports: HashSet<Uuid>,
}

struct TransportState {
    router_id: Uuid,
    port: u16,
    connected: bool,
    max_incoming_bitrate: Option<u32>,
    producers: HashSet<Uuid>,
    consumers: HashSet<Uuid>,
}

struct ProducerState {
    router_id: Uuid,
    transport_id: Uuid,
    kind: MediaKind,
    codec: RtpCodecParameters,
    consumers: HashSet<Uuid>,
}

struct ConsumerState {
    router_id: Uuid,
    transport_id: Uuid,
    producer_id: Uuid,
}

pub(crate) struct LocalEngine {
    context: WorkerContext,
    announced_ip: String,
    min_port: u16,
    max_port: u16,
    next_port: u16,
    bitrate_limit: u32,
    fingerprint: DtlsFingerprint,
    routers: HashMap<Uuid, RouterState>,
    transports: HashMap<Uuid, TransportState>,
    producers: HashMap<Uuid, ProducerState>,
    consumers: HashMap<Uuid, ConsumerState>,
    used_ports: HashSet<u16>,
}

impl LocalEngine {
    fn new(context: WorkerContext, settings: &RelaySettings) -> Self {
        let mut rng = rand::thread_rng();
        let fingerprint = (0..32)
            .map(|_| format!("{:02X}", rng.r#gen::<u8>()))
            .collect::<Vec<_>>()
            .join(":");

        Self {
            context,
            announced_ip: settings
                .announced_address
                .clone()
                .unwrap_or_else(|| settings.listen_ip.clone()),
            min_port: settings.rtc_min_port,
            max_port: settings.rtc_max_port,
            next_port: settings.rtc_min_port,
            bitrate_limit: settings.worker_bitrate_limit,
            fingerprint: DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: fingerprint,
            },
            routers: HashMap::new(),
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            used_ports: HashSet::new(),
        }
    }

    fn allocate_port(&mut self) -> Option<u16> {
        let range = (self.max_port - self.min_port) as usize + 1;
        for _ in 0..range {
            let port = self.next_port;
            self.next_port = if port >= self.max_port {
                self.min_port
            } else {
                port + 1
            };
            if self.used_ports.insert(port) {
                return Some(port);
            }
        }
        None
    }

    fn remove_consumer(&mut self, consumer_id: Uuid) {
        let Some(consumer) = self.consumers.remove(&consumer_id) else {
            return;
        };
        if let Some(transport) = self.transports.get_mut(&consumer.transport_id) {
            transport.consumers.remove(&consumer_id);
        }
        if let Some(producer) = self.producers.get_mut(&consumer.producer_id) {
            producer.consumers.remove(&consumer_id);
        }
        self.context.emit(RelayEvent::ConsumerClosed {
            router_id: consumer.router_id,
            consumer_id,
            producer_id: consumer.producer_id,
        });
    }

    fn remove_producer(&mut self, producer_id: Uuid) {
        let Some(producer) = self.producers.remove(&producer_id) else {
            return;
        };
        for consumer_id in producer.consumers {
            self.remove_consumer(consumer_id);
        }
        if let Some(transport) = self.transports.get_mut(&producer.transport_id) {
            transport.producers.remove(&producer_id);
        }
        self.context.emit(RelayEvent::ProducerClosed {
            router_id: producer.router_id,
            producer_id,
        });
    }

    fn remove_transport(&mut self, transport_id: Uuid) {
        let Some(transport) = self.transports.remove(&transport_id) else {
            return;
        };
        for producer_id in transport.producers {
            self.remove_producer(producer_id);
        }
        for consumer_id in transport.consumers {
            self.remove_consumer(consumer_id);
        }
        self.used_ports.remove(&transport.port);
        if let Some(router) = self.routers.get_mut(&transport.router_id) {
            router.transports.remove(&transport_id);
        }
        self.context.emit(RelayEvent::TransportClosed {
            router_id: transport.router_id,
            transport_id,
        });
    }
}

#[async_trait]
impl Engine for LocalEngine {
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
        for codec in &codecs {
            if !payload_types.insert(codec.preferred_payload_type) {
                return Err(RelayError::Unsupported(format!(
                    "duplicate payload type {}",
                    codec.preferred_payload_type
                )));
            }
        }

        let id = Uuid::new_v4();
        let capabilities = RtpCapabilities { codecs };
        self.routers.insert(
            id,
            RouterState {
                capabilities: capabilities.clone(),
                transports: HashSet::new(),
            },
        );
        Ok((id, capabilities))
    }

    async fn close_router(&mut self, router_id: Uuid) {
        let Some(router) = self.routers.get(&router_id) else {
            return;
        };
        let transports: Vec<Uuid> = router.transports.iter().copied().collect();
        for transport_id in transports {
            self.remove_transport(transport_id);
        }
        self.routers.remove(&router_id);
    }

    async fn create_transport(&mut self, router_id: Uuid) -> Result<TransportOptions, RelayError> {
        if !self.routers.contains_key(&router_id) {
            return Err(RelayError::NotFound(format!("router {}", router_id)));
        }

        let port = self.allocate_port().ok_or_else(|| {
            RelayError::Failed(format!(
                "worker {} has no free RTC ports",
                self.context.worker_id
            ))
        })?;

        let id = Uuid::new_v4();
        self.transports.insert(
            id,
            TransportState {
                router_id,
                port,
                connected: false,
                max_incoming_bitrate: None,
                producers: HashSet::new(),
                consumers: HashSet::new(),
            },
        );
        if let Some(router) = self.routers.get_mut(&router_id) {
            router.transports.insert(id);
        }

        Ok(TransportOptions {
            id,
            ice_parameters: IceParameters {
                username_fragment: random_string(16),
                password: random_string(32),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1_076_302_079,
                ip: self.announced_ip.clone(),
                port,
                protocol: "udp".to_string(),
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![self.fingerprint.clone()],
            },
        })
    }

    async fn connect_transport(
        &mut self,
        transport_id: Uuid,
        _ice_parameters: IceParameters,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), RelayError> {
        let transport = self
            .transports
            .get_mut(&transport_id)
            .ok_or_else(|| RelayError::NotFound(format!("transport {}", transport_id)))?;

        if transport.connected {
            return Err(RelayError::Failed(format!(
                "transport {} already connected",
                transport_id
            )));
        }
        if dtls_parameters.fingerprints.is_empty() {
            return Err(RelayError::Failed("missing DTLS fingerprint".to_string()));
        }

        transport.connected = true;
        Ok(())
    }

    async fn set_max_incoming_bitrate(
        &mut self,
        transport_id: Uuid,
        bitrate: u32,
    ) -> Result<(), RelayError> {
        let limit = self.bitrate_limit;
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

        let id = Uuid::new_v4();
        let producer = ProducerState {
            router_id: transport.router_id,
            transport_id,
            kind,
            codec: codec.clone(),
            consumers: HashSet::new(),
        };
        self.producers.insert(id, producer);
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
                ssrc: rand::thread_rng().r#gen(),
                max_bitrate: None,
            }],
        };
        let kind = producer.kind;

        self.consumers.insert(
            id,
            ConsumerState {
                router_id: transport.router_id,
                transport_id,
                producer_id,
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
        self.remove_producer(producer_id);
    }

    async fn close_consumer(&mut self, consumer_id: Uuid) {
        self.remove_consumer(consumer_id);
    }

    async fn close_transport(&mut self, transport_id: Uuid) {
        self.remove_transport(transport_id);
    }
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_protocol::RtpCodecCapability;

    fn settings() -> RelaySettings {
        RelaySettings {
            workers: 1,
            rtc_min_port: 40000,
            rtc_max_port: 40009,
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

    async fn router(worker: &WorkerHandle) -> Uuid {
        let (router_id, _) = worker
            .create_router(vec![RtpCodecCapability::opus(), RtpCodecCapability::vp8()])
            .await
            .unwrap();
        router_id
    }

    #[tokio::test]
    async fn test_bitrate_above_limit_fails() {
        let worker = spawn_local(0, &settings());
        let router_id = router(&worker).await;
        let transport = worker.create_webrtc_transport(router_id).await.unwrap();

        assert!(worker
            .set_max_incoming_bitrate(transport.id, 1_000_000)
            .await
            .is_ok());
        assert!(matches!(
            worker.set_max_incoming_bitrate(transport.id, 5_000_000).await,
            Err(RelayError::Failed(_))
        ));
    }

    #[tokio::test]
    async fn test_consume_requires_receivable_codec() {
        let worker = spawn_local(0, &settings());
        let router_id = router(&worker).await;
        let send = worker.create_webrtc_transport(router_id).await.unwrap();
        let recv = worker.create_webrtc_transport(router_id).await.unwrap();
        let producer_id = worker
            .produce(send.id, MediaKind::Audio, opus_parameters())
            .await
            .unwrap();

        let result = worker
            .consume(
                recv.id,
                producer_id,
                RtpCapabilities {
                    codecs: vec![RtpCodecCapability::vp8()],
                },
            )
            .await;
        assert!(matches!(result, Err(RelayError::Unsupported(_))));
    }
}
