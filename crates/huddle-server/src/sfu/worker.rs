//! Relay worker actor
//!
//! Every worker is a tokio task that exclusively owns an [`Engine`]. Requests
//! reach it over an mpsc channel and are answered over oneshot channels, so
//! callers on any task can drive it concurrently. A worker task that stops
//! without being closed is reported as dead.

use super::relay::{ConsumerOptions, RelayError, RelayEvent, RelayWorker};
use super::RelaySettings;
use async_trait::async_trait;
use huddle_protocol::{
    DtlsParameters, IceParameters, MediaKind, RtpCapabilities, RtpCodecCapability,
    RtpParameters, TransportOptions,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;
use uuid::Uuid;

const REQUEST_QUEUE: usize = 256;
const EVENT_QUEUE: usize = 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub(crate) type Reply<T> = oneshot::Sender<Result<T, RelayError>>;

pub(crate) enum Request {
    CreateRouter {
        codecs: Vec<RtpCodecCapability>,
        reply: Reply<(Uuid, RtpCapabilities)>,
    },
    CloseRouter {
        router_id: Uuid,
        reply: Reply<()>,
    },
    CreateTransport {
        router_id: Uuid,
        reply: Reply<TransportOptions>,
    },
    ConnectTransport {
        transport_id: Uuid,
        ice_parameters: IceParameters,
        dtls_parameters: DtlsParameters,
        reply: Reply<()>,
    },
    SetMaxIncomingBitrate {
        transport_id: Uuid,
        bitrate: u32,
        reply: Reply<()>,
    },
    Produce {
        transport_id: Uuid,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        reply: Reply<Uuid>,
    },
    Consume {
        transport_id: Uuid,
        producer_id: Uuid,
        rtp_capabilities: RtpCapabilities,
        reply: Reply<ConsumerOptions>,
    },
    CloseProducer {
        producer_id: Uuid,
        reply: Reply<()>,
    },
    CloseConsumer {
        consumer_id: Uuid,
        reply: Reply<()>,
    },
    CloseTransport {
        transport_id: Uuid,
        reply: Reply<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// The routing tables a worker task owns. Close operations on unknown ids
/// are no-ops.
#[async_trait]
pub(crate) trait Engine: Send + 'static {
    async fn create_router(
        &mut self,
        codecs: Vec<RtpCodecCapability>,
    ) -> Result<(Uuid, RtpCapabilities), RelayError>;

    async fn close_router(&mut self, router_id: Uuid);

    async fn create_transport(&mut self, router_id: Uuid) -> Result<TransportOptions, RelayError>;

    async fn connect_transport(
        &mut self,
        transport_id: Uuid,
        ice_parameters: IceParameters,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), RelayError>;

    async fn set_max_incoming_bitrate(
        &mut self,
        transport_id: Uuid,
        bitrate: u32,
    ) -> Result<(), RelayError>;

    async fn produce(
        &mut self,
        transport_id: Uuid,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Uuid, RelayError>;

    async fn consume(
        &mut self,
        transport_id: Uuid,
        producer_id: Uuid,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerOptions, RelayError>;

    async fn close_producer(&mut self, producer_id: Uuid);

    async fn close_consumer(&mut self, consumer_id: Uuid);

    async fn close_transport(&mut self, transport_id: Uuid);

    /// Release sockets and background tasks before the worker stops
    async fn shutdown(&mut self) {}
}

/// What an engine gets from the worker hosting it
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub worker_id: usize,
    events: broadcast::Sender<RelayEvent>,
    requests: mpsc::WeakSender<Request>,
}

impl WorkerContext {
    pub fn emit(&self, event: RelayEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Queue a transport close from outside the request loop, e.g. from a
    /// handshake task that failed
    pub fn close_transport_later(&self, transport_id: Uuid) {
        let Some(requests) = self.requests.upgrade() else {
            return;
        };
        let (reply, _) = oneshot::channel();
        if requests
            .try_send(Request::CloseTransport {
                transport_id,
                reply,
            })
            .is_err()
        {
            tracing::warn!(
                worker_id = self.worker_id,
                transport_id = %transport_id,
                "Relay worker queue full, transport left open"
            );
        }
    }
}

/// Handle to a relay worker task
pub struct WorkerHandle {
    id: usize,
    requests: mpsc::Sender<Request>,
    events: broadcast::Sender<RelayEvent>,
    closing: Arc<AtomicBool>,
    task: AbortHandle,
}

impl WorkerHandle {
    pub(crate) fn spawn<E, F>(id: usize, build: F) -> Arc<Self>
    where
        E: Engine,
        F: FnOnce(WorkerContext) -> E,
    {
        let (requests, rx) = mpsc::channel(REQUEST_QUEUE);
        let (events, _) = broadcast::channel(EVENT_QUEUE);
        let closing = Arc::new(AtomicBool::new(false));

        let engine = build(WorkerContext {
            worker_id: id,
            events: events.clone(),
            requests: requests.downgrade(),
        });
        let task = tokio::spawn(run(id, engine, rx));
        let abort = task.abort_handle();

        // Watch for the task ending without an orderly close
        let monitor_events = events.clone();
        let monitor_closing = closing.clone();
        tokio::spawn(async move {
            let outcome = task.await;
            if monitor_closing.load(Ordering::SeqCst) {
                return;
            }
            match outcome {
                Err(e) if e.is_panic() => {
                    tracing::error!("Relay worker {} panicked", id)
                }
                _ => tracing::error!("Relay worker {} exited unexpectedly", id),
            }
            let _ = monitor_events.send(RelayEvent::WorkerDied { worker_id: id });
        });

        Arc::new(Self {
            id,
            requests,
            events,
            closing,
            task: abort,
        })
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> Result<T, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .await
            .map_err(|_| RelayError::WorkerDied(self.id))?;
        rx.await.map_err(|_| RelayError::WorkerDied(self.id))?
    }

    /// Kill the worker task as if the process had crashed
    #[cfg(test)]
    pub(crate) fn crash(&self) {
        self.task.abort();
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

#[async_trait]
impl RelayWorker for WorkerHandle {
    fn id(&self) -> usize {
        self.id
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    async fn create_router(
        &self,
        codecs: Vec<RtpCodecCapability>,
    ) -> Result<(Uuid, RtpCapabilities), RelayError> {
        self.request(|reply| Request::CreateRouter { codecs, reply })
            .await
    }

    async fn close_router(&self, router_id: Uuid) -> Result<(), RelayError> {
        self.request(|reply| Request::CloseRouter { router_id, reply })
            .await
    }

    async fn create_webrtc_transport(
        &self,
        router_id: Uuid,
    ) -> Result<TransportOptions, RelayError> {
        self.request(|reply| Request::CreateTransport { router_id, reply })
            .await
    }

    async fn connect_transport(
        &self,
        transport_id: Uuid,
        ice_parameters: IceParameters,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), RelayError> {
        self.request(|reply| Request::ConnectTransport {
            transport_id,
            ice_parameters,
            dtls_parameters,
            reply,
        })
        .await
    }

    async fn set_max_incoming_bitrate(
        &self,
        transport_id: Uuid,
        bitrate: u32,
    ) -> Result<(), RelayError> {
        self.request(|reply| Request::SetMaxIncomingBitrate {
            transport_id,
            bitrate,
            reply,
        })
        .await
    }

    async fn produce(
        &self,
        transport_id: Uuid,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Uuid, RelayError> {
        self.request(|reply| Request::Produce {
            transport_id,
            kind,
            rtp_parameters,
            reply,
        })
        .await
    }

    async fn consume(
        &self,
        transport_id: Uuid,
        producer_id: Uuid,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerOptions, RelayError> {
        self.request(|reply| Request::Consume {
            transport_id,
            producer_id,
            rtp_capabilities,
            reply,
        })
        .await
    }

    async fn close_producer(&self, producer_id: Uuid) -> Result<(), RelayError> {
        self.request(|reply| Request::CloseProducer { producer_id, reply })
            .await
    }

    async fn close_consumer(&self, consumer_id: Uuid) -> Result<(), RelayError> {
        self.request(|reply| Request::CloseConsumer { consumer_id, reply })
            .await
    }

    async fn close_transport(&self, transport_id: Uuid) -> Result<(), RelayError> {
        self.request(|reply| Request::CloseTransport {
            transport_id,
            reply,
        })
        .await
    }

    async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let (reply, done) = oneshot::channel();
        if self.requests.send(Request::Shutdown { reply }).await.is_ok() {
            if tokio::time::timeout(SHUTDOWN_GRACE, done).await.is_err() {
                tracing::warn!("Relay worker {} did not shut down in time", self.id);
            }
        }
        self.task.abort();
        tracing::info!("Relay worker {} closed", self.id);
    }
}

async fn run<E: Engine>(worker_id: usize, mut engine: E, mut requests: mpsc::Receiver<Request>) {
    while let Some(request) = requests.recv().await {
        match request {
            Request::CreateRouter { codecs, reply } => {
                let _ = reply.send(engine.create_router(codecs).await);
            }
            Request::CloseRouter { router_id, reply } => {
                engine.close_router(router_id).await;
                let _ = reply.send(Ok(()));
            }
            Request::CreateTransport { router_id, reply } => {
                let _ = reply.send(engine.create_transport(router_id).await);
            }
            Request::ConnectTransport {
                transport_id,
                ice_parameters,
                dtls_parameters,
                reply,
            } => {
                let result = engine
                    .connect_transport(transport_id, ice_parameters, dtls_parameters)
                    .await;
                let _ = reply.send(result);
            }
            Request::SetMaxIncomingBitrate {
                transport_id,
                bitrate,
                reply,
            } => {
                let _ = reply.send(engine.set_max_incoming_bitrate(transport_id, bitrate).await);
            }
            Request::Produce {
                transport_id,
                kind,
                rtp_parameters,
                reply,
            } => {
                let _ = reply.send(engine.produce(transport_id, kind, rtp_parameters).await);
            }
            Request::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
                reply,
            } => {
                let result = engine
                    .consume(transport_id, producer_id, rtp_capabilities)
                    .await;
                let _ = reply.send(result);
            }
            Request::CloseProducer { producer_id, reply } => {
                engine.close_producer(producer_id).await;
                let _ = reply.send(Ok(()));
            }
            Request::CloseConsumer { consumer_id, reply } => {
                engine.close_consumer(consumer_id).await;
                let _ = reply.send(Ok(()));
            }
            Request::CloseTransport {
                transport_id,
                reply,
            } => {
                engine.close_transport(transport_id).await;
                let _ = reply.send(Ok(()));
            }
            Request::Shutdown { reply } => {
                engine.shutdown().await;
                let _ = reply.send(());
                break;
            }
        }
    }
    tracing::debug!("Relay worker {} request loop finished", worker_id);
}

/// `settings` narrowed to worker `worker_id`'s equal slice of the RTC port
/// range
pub(crate) fn worker_settings(
    settings: &RelaySettings,
    worker_id: usize,
) -> Result<RelaySettings, RelayError> {
    let workers = settings.workers.max(1) as u32;
    let min = settings.rtc_min_port as u32;
    let max = settings.rtc_max_port as u32;
    if max < min {
        return Err(RelayError::PoolInit(format!(
            "invalid RTC port range {}-{}",
            min, max
        )));
    }

    let span = (max - min + 1) / workers;
    if span == 0 {
        return Err(RelayError::PoolInit(format!(
            "RTC port range {}-{} too small for {} workers",
            min, max, workers
        )));
    }

    let first = min + span * worker_id as u32;
    let mut narrowed = settings.clone();
    narrowed.rtc_min_port = first as u16;
    narrowed.rtc_max_port = (first + span - 1) as u16;
    Ok(narrowed)
}
