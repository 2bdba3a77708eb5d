//! Relay engine contract
//!
//! A relay worker hosts routers (one per room) and, inside a router, the
//! transports, producers and consumers of the peers in that room. Workers are
//! driven through async requests and report spontaneous state changes through
//! a broadcast stream of [`RelayEvent`]s.

use async_trait::async_trait;
use huddle_protocol::{
    DtlsParameters, IceParameters, MediaKind, RtpCapabilities, RtpCodecCapability, RtpParameters,
    TransportOptions,
};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay worker {0} died")]
    WorkerDied(usize),

    #[error("relay pool failed to start: {0}")]
    PoolInit(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("relay request failed: {0}")]
    Failed(String),
}

impl RelayError {
    /// Fatal errors leave relay state untrustworthy; the process must restart
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::WorkerDied(_) | RelayError::PoolInit(_))
    }
}

/// State changes emitted by a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    TransportClosed {
        router_id: Uuid,
        transport_id: Uuid,
    },
    ProducerClosed {
        router_id: Uuid,
        producer_id: Uuid,
    },
    ConsumerClosed {
        router_id: Uuid,
        consumer_id: Uuid,
        producer_id: Uuid,
    },
    WorkerDied {
        worker_id: usize,
    },
}

/// Result of a successful consume
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerOptions {
    pub id: Uuid,
    pub producer_id: Uuid,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[async_trait]
pub trait RelayWorker: Send + Sync {
    fn id(&self) -> usize;

    /// Subscribe to events emitted from now on
    fn subscribe(&self) -> broadcast::Receiver<RelayEvent>;

    async fn create_router(
        &self,
        codecs: Vec<RtpCodecCapability>,
    ) -> Result<(Uuid, RtpCapabilities), RelayError>;

    /// Closes the router and everything built on it
    async fn close_router(&self, router_id: Uuid) -> Result<(), RelayError>;

    async fn create_webrtc_transport(&self, router_id: Uuid)
    -> Result<TransportOptions, RelayError>;

    /// Start ICE and DTLS towards the remote side. Resolves once the
    /// parameters are accepted; the handshake itself completes later.
    async fn connect_transport(
        &self,
        transport_id: Uuid,
        ice_parameters: IceParameters,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), RelayError>;

    async fn set_max_incoming_bitrate(
        &self,
        transport_id: Uuid,
        bitrate: u32,
    ) -> Result<(), RelayError>;

    async fn produce(
        &self,
        transport_id: Uuid,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Uuid, RelayError>;

    async fn consume(
        &self,
        transport_id: Uuid,
        producer_id: Uuid,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerOptions, RelayError>;

    async fn close_producer(&self, producer_id: Uuid) -> Result<(), RelayError>;

    async fn close_consumer(&self, consumer_id: Uuid) -> Result<(), RelayError>;

    /// Closes the transport, its producers and consumers, and every consumer
    /// of those producers
    async fn close_transport(&self, transport_id: Uuid) -> Result<(), RelayError>;

    /// Orderly shutdown; does not count as a worker death
    async fn close(&self);
}

/// Starts relay workers for the allocator's pool
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, worker_id: usize) -> Result<Arc<dyn RelayWorker>, RelayError>;
}

/// A room's router and the worker hosting it
#[derive(Clone)]
pub struct RouterHandle {
    id: Uuid,
    worker: Arc<dyn RelayWorker>,
    rtp_capabilities: RtpCapabilities,
}

impl RouterHandle {
    pub fn new(id: Uuid, worker: Arc<dyn RelayWorker>, rtp_capabilities: RtpCapabilities) -> Self {
        Self {
            id,
            worker,
            rtp_capabilities,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn worker_id(&self) -> usize {
        self.worker.id()
    }

    pub fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.rtp_capabilities
    }

    pub async fn create_webrtc_transport(&self) -> Result<TransportOptions, RelayError> {
        self.worker.create_webrtc_transport(self.id).await
    }

    pub async fn connect_transport(
        &self,
        transport_id: Uuid,
        ice_parameters: IceParameters,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), RelayError> {
        self.worker
            .connect_transport(transport_id, ice_parameters, dtls_parameters)
            .await
    }

    pub async fn set_max_incoming_bitrate(
        &self,
        transport_id: Uuid,
        bitrate: u32,
    ) -> Result<(), RelayError> {
        self.worker
            .set_max_incoming_bitrate(transport_id, bitrate)
            .await
    }

    pub async fn produce(
        &self,
        transport_id: Uuid,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Uuid, RelayError> {
        self.worker.produce(transport_id, kind, rtp_parameters).await
    }

    pub async fn consume(
        &self,
        transport_id: Uuid,
        producer_id: Uuid,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerOptions, RelayError> {
        self.worker
            .consume(transport_id, producer_id, rtp_capabilities)
            .await
    }

    pub async fn close_producer(&self, producer_id: Uuid) -> Result<(), RelayError> {
        self.worker.close_producer(producer_id).await
    }

    pub async fn close_consumer(&self, consumer_id: Uuid) -> Result<(), RelayError> {
        self.worker.close_consumer(consumer_id).await
    }

    pub async fn close_transport(&self, transport_id: Uuid) -> Result<(), RelayError> {
        self.worker.close_transport(transport_id).await
    }

    pub async fn close(&self) -> Result<(), RelayError> {
        self.worker.close_router(self.id).await
    }
}

impl fmt::Debug for RouterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterHandle")
            .field("id", &self.id)
            .field("worker_id", &self.worker.id())
            .finish()
    }
}
