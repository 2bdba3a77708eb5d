//! Worker Allocator
//!
//! Owns the relay worker pool and the per-room router cache. The pool is
//! started lazily and exactly once; rooms are spread over workers
//! round-robin and each room gets one router for as long as it is cached.

use super::rtc::RtcWorkerSpawner;
use super::relay::{RelayError, RelayEvent, RelayWorker, RouterHandle, WorkerSpawner};
use super::RelaySettings;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, OnceCell};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

const EVENT_QUEUE: usize = 4096;

pub struct WorkerAllocator {
    settings: RelaySettings,
    spawner: Arc<dyn WorkerSpawner>,
    workers: OnceCell<Vec<Arc<dyn RelayWorker>>>,
    next_worker: AtomicUsize,
    /// Room id -> router; the cell is shared so concurrent first callers
    /// await a single creation
    routers: Mutex<HashMap<Uuid, Arc<OnceCell<RouterHandle>>>>,
    events: broadcast::Sender<RelayEvent>,
}

impl WorkerAllocator {
    pub fn new(settings: RelaySettings, spawner: Arc<dyn WorkerSpawner>) -> Self {
        let (events, _) = broadcast::channel(EVENT_QUEUE);
        Self {
            settings,
            spawner,
            workers: OnceCell::new(),
            next_worker: AtomicUsize::new(0),
            routers: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Allocator backed by WebRTC workers
    pub fn with_rtc_workers(settings: RelaySettings) -> Self {
        let spawner = Arc::new(RtcWorkerSpawner::new(settings.clone()));
        Self::new(settings, spawner)
    }

    /// Allocator backed by in-memory workers that open no sockets
    #[cfg(test)]
    pub(crate) fn with_local_workers(settings: RelaySettings) -> Self {
        let spawner = Arc::new(super::local::LocalWorkerSpawner::new(settings.clone()));
        Self::new(settings, spawner)
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    async fn workers(&self) -> Result<&[Arc<dyn RelayWorker>], RelayError> {
        let workers = self
            .workers
            .get_or_try_init(|| self.start_pool())
            .await?;
        Ok(workers.as_slice())
    }

    async fn start_pool(&self) -> Result<Vec<Arc<dyn RelayWorker>>, RelayError> {
        let size = self.settings.workers.max(1);
        tracing::info!("Starting relay pool with {} workers", size);

        let mut workers: Vec<Arc<dyn RelayWorker>> = Vec::with_capacity(size);
        for worker_id in 0..size {
            let worker = match self.spawner.spawn(worker_id).await {
                Ok(worker) => worker,
                Err(e) => {
                    for started in &workers {
                        RelayWorker::close(started.as_ref()).await;
                    }
                    return Err(RelayError::PoolInit(e.to_string()));
                }
            };
            self.forward_events(worker.as_ref());
            workers.push(worker);
        }

        Ok(workers)
    }

    /// Merge a worker's events into the allocator-wide stream
    fn forward_events(&self, worker: &dyn RelayWorker) {
        let mut rx = worker.subscribe();
        let tx = self.events.clone();
        let worker_id = worker.id();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let _ = tx.send(event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(worker_id, skipped, "Relay event forwarder lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    /// Start the pool if it is not running yet. Concurrent callers share one
    /// initialization.
    pub async fn init(&self) -> Result<(), RelayError> {
        self.workers().await.map(|_| ())
    }

    /// Next worker in round-robin order
    pub async fn acquire_worker(&self) -> Result<Arc<dyn RelayWorker>, RelayError> {
        let workers = self.workers().await?;
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % workers.len();
        Ok(workers[index].clone())
    }

    /// The room's router, created on first use
    pub async fn get_or_create_router(&self, room_id: Uuid) -> Result<RouterHandle, RelayError> {
        let cell = {
            let mut routers = self.routers.lock().await;
            routers.entry(room_id).or_default().clone()
        };

        let router = cell
            .get_or_try_init(|| async {
                let worker = self.acquire_worker().await?;
                let (router_id, rtp_capabilities) =
                    worker.create_router(self.settings.codecs.clone()).await?;
                tracing::info!(
                    room_id = %room_id,
                    router_id = %router_id,
                    worker_id = worker.id(),
                    "Created router for room"
                );
                Ok::<_, RelayError>(RouterHandle::new(router_id, worker, rtp_capabilities))
            })
            .await?
            .clone();

        // The room may have been released while the router was being built
        let still_cached = self
            .routers
            .lock()
            .await
            .get(&room_id)
            .is_some_and(|current| Arc::ptr_eq(current, &cell));
        if !still_cached {
            let _ = router.close().await;
            return Err(RelayError::NotFound(format!("room {}", room_id)));
        }

        Ok(router)
    }

    /// The room's router if one has been created
    pub async fn router(&self, room_id: Uuid) -> Option<RouterHandle> {
        let routers = self.routers.lock().await;
        routers.get(&room_id).and_then(|cell| cell.get().cloned())
    }

    /// Remove the room from the cache; the caller closes the returned router
    pub async fn take_router(&self, room_id: Uuid) -> Option<RouterHandle> {
        let cell = self.routers.lock().await.remove(&room_id)?;
        cell.get().cloned()
    }

    pub async fn router_count(&self) -> usize {
        let routers = self.routers.lock().await;
        routers.values().filter(|cell| cell.initialized()).count()
    }

    /// Events from every worker in the pool
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Resolves when a worker dies. Worker death is not recoverable in
    /// place; the process has to restart.
    ///
    /// Subscribes immediately, so deaths after this call are never missed.
    pub fn wait_fatal(&self) -> impl Future<Output = RelayError> + Send + use<> {
        let mut rx = self.subscribe();
        async move {
            loop {
                match rx.recv().await {
                    Ok(RelayEvent::WorkerDied { worker_id }) => {
                        return RelayError::WorkerDied(worker_id);
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => std::future::pending::<()>().await,
                }
            }
        }
    }

    /// Orderly shutdown of every worker
    pub async fn close(&self) {
        if let Some(workers) = self.workers.get() {
            for worker in workers {
                worker.close().await;
            }
        }
        self.routers.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sfu::local::spawn_local;
    use crate::sfu::worker::WorkerHandle;
    use async_trait::async_trait;
    use futures_util::future::join_all;

    fn settings(workers: usize) -> RelaySettings {
        RelaySettings {
            workers,
            rtc_min_port: 41000,
            rtc_max_port: 41999,
            ..Default::default()
        }
    }

    /// Keeps concrete handles so tests can crash workers
    struct TrackingSpawner {
        settings: RelaySettings,
        spawned: std::sync::Mutex<Vec<Arc<WorkerHandle>>>,
    }

    #[async_trait]
    impl WorkerSpawner for TrackingSpawner {
        async fn spawn(&self, worker_id: usize) -> Result<Arc<dyn RelayWorker>, RelayError> {
            let worker = spawn_local(worker_id, &self.settings);
            self.spawned.lock().unwrap().push(worker.clone());
            Ok(worker)
        }
    }

    struct FailingSpawner;

    #[async_trait]
    impl WorkerSpawner for FailingSpawner {
        async fn spawn(&self, _worker_id: usize) -> Result<Arc<dyn RelayWorker>, RelayError> {
            Err(RelayError::Failed("binary missing".to_string()))
        }
    }

    #[tokio::test]
    async fn test_concurrent_first_joiners_share_one_router() {
        let allocator = Arc::new(WorkerAllocator::with_local_workers(settings(2)));
        let room_id = Uuid::new_v4();

        let handles = join_all((0..16).map(|_| {
            let allocator = allocator.clone();
            tokio::spawn(async move { allocator.get_or_create_router(room_id).await })
        }))
        .await;

        let ids: Vec<Uuid> = handles
            .into_iter()
            .map(|h| h.unwrap().unwrap().id())
            .collect();
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(allocator.router_count().await, 1);
    }

    #[tokio::test]
    async fn test_rooms_are_spread_round_robin() {
        let allocator = WorkerAllocator::with_local_workers(settings(2));

        let a = allocator.get_or_create_router(Uuid::new_v4()).await.unwrap();
        let b = allocator.get_or_create_router(Uuid::new_v4()).await.unwrap();
        let c = allocator.get_or_create_router(Uuid::new_v4()).await.unwrap();

        assert_ne!(a.worker_id(), b.worker_id());
        assert_eq!(a.worker_id(), c.worker_id());
    }

    #[tokio::test]
    async fn test_take_router_releases_room() {
        let allocator = WorkerAllocator::with_local_workers(settings(1));
        let room_id = Uuid::new_v4();

        let first = allocator.get_or_create_router(room_id).await.unwrap();
        let taken = allocator.take_router(room_id).await.unwrap();
        assert_eq!(first.id(), taken.id());
        taken.close().await.unwrap();

        assert!(allocator.router(room_id).await.is_none());
        let second = allocator.get_or_create_router(room_id).await.unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn test_pool_start_failure_is_fatal() {
        let allocator = WorkerAllocator::new(settings(2), Arc::new(FailingSpawner));

        let err = allocator.init().await.unwrap_err();
        assert!(matches!(err, RelayError::PoolInit(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_worker_death_resolves_wait_fatal() {
        let spawner = Arc::new(TrackingSpawner {
            settings: settings(2),
            spawned: std::sync::Mutex::new(Vec::new()),
        });
        let allocator = WorkerAllocator::new(settings(2), spawner.clone());
        allocator.init().await.unwrap();

        let fatal = allocator.wait_fatal();

        let victim = spawner.spawned.lock().unwrap()[1].clone();
        victim.crash();

        let err = tokio::time::timeout(std::time::Duration::from_secs(2), fatal)
            .await
            .unwrap();
        assert_eq!(err, RelayError::WorkerDied(1));
    }
}
