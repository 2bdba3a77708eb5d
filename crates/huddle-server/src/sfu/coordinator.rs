//! Signaling Coordinator
//!
//! Handles one operation per client request and is the only writer of the
//! room registry. Multi-step operations reserve registry state, call the
//! relay without holding the registry lock, then re-check and commit.
//!
//! Announcements of things that now exist (members, producers, consumers)
//! are sent while the registry lock is held, so every connection sees them in
//! registry order. Close announcements are sent only after the registry has
//! forgotten the object and the relay has closed it.

use super::allocator::WorkerAllocator;
use super::registry::{
    Departure, PeerSession, ProducerClosure, RegistryError, RoomRegistry, RoomStats,
};
use super::relay::{RelayError, RelayEvent, RouterHandle};
use super::RoomLifetime;
use crate::directory::{Authorizer, UserDirectory};
use crate::error::SignalError;
use crate::ws::Notifier;
use huddle_protocol::{
    BrowserInputEvent, ClientMessage, DtlsParameters, IceParameters, MediaKind, MemberInfo,
    ProducerSource, RequestSubject, RtpCapabilities, RtpParameters, ServerMessage,
    TransportDirection,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// An authenticated user on a specific connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub user_id: Uuid,
    pub connection_id: Uuid,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Mutex<RoomRegistry>,
    allocator: Arc<WorkerAllocator>,
    notifier: Arc<dyn Notifier>,
    authorizer: Arc<dyn Authorizer>,
    directory: Arc<dyn UserDirectory>,
    lifetime: RoomLifetime,
}

/// The peer's session, if it belongs to this connection
fn current_session(registry: &RoomRegistry, peer: Peer) -> Option<&PeerSession> {
    registry
        .session(peer.user_id)
        .filter(|s| s.connection_id() == peer.connection_id)
}

fn is_member(registry: &RoomRegistry, peer: Peer, room_id: Uuid) -> bool {
    current_session(registry, peer).is_some_and(|s| s.room_id() == room_id)
}

fn require_member(registry: &RoomRegistry, peer: Peer, room_id: Uuid) -> Result<(), SignalError> {
    if is_member(registry, peer, room_id) {
        Ok(())
    } else {
        Err(SignalError::Registry(RegistryError::NotInRoom))
    }
}

fn require_session(registry: &RoomRegistry, peer: Peer) -> Result<Uuid, SignalError> {
    current_session(registry, peer)
        .map(|s| s.room_id())
        .ok_or(SignalError::Registry(RegistryError::NoSession))
}

impl Coordinator {
    pub fn new(
        allocator: Arc<WorkerAllocator>,
        notifier: Arc<dyn Notifier>,
        authorizer: Arc<dyn Authorizer>,
        directory: Arc<dyn UserDirectory>,
        lifetime: RoomLifetime,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(RoomRegistry::new()),
                allocator,
                notifier,
                authorizer,
                directory,
                lifetime,
            }),
        }
    }

    async fn send(&self, connection_id: Uuid, message: ServerMessage) {
        self.inner
            .notifier
            .send_to_connection(connection_id, &message)
            .await;
    }

    async fn broadcast(&self, recipients: &[Uuid], message: ServerMessage) {
        for connection_id in recipients {
            self.inner
                .notifier
                .send_to_connection(*connection_id, &message)
                .await;
        }
    }

    async fn router(&self, room_id: Uuid) -> Result<RouterHandle, SignalError> {
        self.inner
            .allocator
            .router(room_id)
            .await
            .ok_or_else(|| SignalError::Relay(RelayError::NotFound(format!("router for room {}", room_id))))
    }

    /// Route a request from an authenticated peer
    pub async fn dispatch(&self, peer: Peer, message: ClientMessage) -> Result<(), SignalError> {
        match message {
            ClientMessage::JoinVoiceRoom { room_id } => self.join(peer, room_id).await,
            ClientMessage::LeaveVoiceRoom { room_id } => {
                self.leave(peer, Some(room_id)).await;
                Ok(())
            }
            ClientMessage::GetRoomCapabilities { room_id } => {
                self.room_capabilities(peer, room_id).await
            }
            ClientMessage::CreateTransport { room_id, direction } => {
                self.create_transport(peer, room_id, direction).await
            }
            ClientMessage::ConnectTransport {
                transport_id,
                ice_parameters,
                dtls_parameters,
            } => {
                self.connect_transport(peer, transport_id, ice_parameters, dtls_parameters)
                    .await
            }
            ClientMessage::Produce {
                transport_id,
                kind,
                rtp_parameters,
                app_data,
            } => {
                self.produce(peer, transport_id, kind, rtp_parameters, app_data.source)
                    .await
            }
            ClientMessage::GetProducers { room_id } => self.list_producers(peer, room_id).await,
            ClientMessage::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
            } => {
                self.consume(peer, transport_id, producer_id, rtp_capabilities)
                    .await
            }
            ClientMessage::CloseProducer { producer_id } => {
                self.close_producer(peer, producer_id).await
            }
            ClientMessage::StartSharedBrowser { room_id, url } => {
                self.start_shared_browser(peer, room_id, url).await
            }
            ClientMessage::StopSharedBrowser { room_id } => {
                self.stop_shared_browser(peer, room_id).await
            }
            ClientMessage::SharedBrowserInput { room_id, event } => {
                self.forward_browser_input(peer, room_id, event).await
            }
            ClientMessage::Authenticate { .. } => {
                Err(SignalError::Rejected("already authenticated".to_string()))
            }
            ClientMessage::Ping => Ok(()),
        }
    }

    pub async fn join(&self, peer: Peer, room_id: Uuid) -> Result<(), SignalError> {
        if !self.inner.authorizer.may_join(peer.user_id, room_id).await {
            return Err(SignalError::Rejected(
                "not allowed to join this room".to_string(),
            ));
        }

        let current = {
            let registry = self.inner.registry.lock().await;
            registry
                .session(peer.user_id)
                .map(|s| (s.room_id(), s.connection_id()))
        };
        if let Some(current) = current {
            if current == (room_id, peer.connection_id) {
                return Err(RegistryError::AlreadyInRoom.into());
            }
            // One room per user; a join elsewhere (or from another
            // connection) replaces the old session
            self.depart(peer.user_id, |_| true).await;
        }

        let display = self.inner.directory.display_info(peer.user_id).await;
        let member = MemberInfo {
            user_id: peer.user_id,
            display_name: display.name,
            avatar_url: display.avatar_ref,
        };

        let mut registry = self.inner.registry.lock().await;
        let snapshot = registry.join(room_id, member.clone(), peer.connection_id)?;

        self.broadcast(
            &snapshot.recipients,
            ServerMessage::UserJoinedVoice {
                room_id,
                user: member,
            },
        )
        .await;
        self.send(
            peer.connection_id,
            ServerMessage::ExistingVoiceMembers {
                room_id,
                members: snapshot.existing,
                shared_browser: snapshot.shared_browser,
            },
        )
        .await;
        drop(registry);

        tracing::info!(
            user_id = %peer.user_id,
            room_id = %room_id,
            "User joined voice room"
        );
        Ok(())
    }

    /// Leave the peer's room; a no-op if it is not in `room_id` (or in any
    /// room when `room_id` is `None`)
    pub async fn leave(&self, peer: Peer, room_id: Option<Uuid>) {
        self.depart(peer.user_id, |session| {
            session.connection_id() == peer.connection_id
                && room_id.is_none_or(|room_id| session.room_id() == room_id)
        })
        .await;
    }

    /// Connection closed; only ends the session this connection owns
    pub async fn disconnect(&self, peer: Peer) {
        self.leave(peer, None).await;
    }

    async fn depart(&self, user_id: Uuid, should_leave: impl FnOnce(&PeerSession) -> bool) {
        let (departure, vacancy) = {
            let mut registry = self.inner.registry.lock().await;
            match registry.session(user_id) {
                Some(session) if should_leave(session) => {}
                _ => return,
            }
            let Some(departure) = registry.leave(user_id) else {
                return;
            };
            let vacancy = match self.inner.lifetime.grace_period() {
                Some(_) if departure.room_empty => Some(registry.mark_vacant(departure.room_id)),
                _ => None,
            };
            (departure, vacancy)
        };

        let room_id = departure.room_id;
        self.finish_departure(departure).await;

        if let Some(token) = vacancy {
            self.room_vacated(room_id, token).await;
        }
    }

    async fn finish_departure(&self, departure: Departure) {
        let Departure {
            room_id,
            member,
            remaining,
            teardown,
            browser,
            ..
        } = departure;

        if let Some(router) = self.inner.allocator.router(room_id).await {
            for consumer_id in &teardown.consumers {
                log_close(router.close_consumer(*consumer_id).await, "consumer", *consumer_id);
            }
            for producer in &teardown.producers {
                log_close(router.close_producer(producer.id).await, "producer", producer.id);
            }
            for transport_id in &teardown.transports {
                log_close(router.close_transport(*transport_id).await, "transport", *transport_id);
            }
        }

        for producer in &teardown.producers {
            self.broadcast(
                &remaining,
                ServerMessage::ProducerClosed {
                    producer_id: producer.id,
                    user_id: member.user_id,
                },
            )
            .await;
        }
        if let Some(session) = browser {
            tracing::info!(room_id = %room_id, "Shared browser ended with its owner");
            self.broadcast(
                &remaining,
                ServerMessage::SharedBrowserStopped {
                    room_id,
                    owner_id: session.owner_id,
                    url: session.url,
                },
            )
            .await;
        }
        self.broadcast(
            &remaining,
            ServerMessage::UserLeftVoice {
                room_id,
                user_id: member.user_id,
            },
        )
        .await;

        tracing::info!(
            user_id = %member.user_id,
            room_id = %room_id,
            producers = teardown.producers.len(),
            "User left voice room"
        );
    }

    pub async fn room_capabilities(&self, peer: Peer, room_id: Uuid) -> Result<(), SignalError> {
        require_member(&*self.inner.registry.lock().await, peer, room_id)?;

        let router = self.inner.allocator.get_or_create_router(room_id).await?;

        let registry = self.inner.registry.lock().await;
        if !is_member(&registry, peer, room_id) {
            tracing::debug!(user_id = %peer.user_id, "Left before capabilities were ready");
            return Ok(());
        }
        self.send(
            peer.connection_id,
            ServerMessage::RoomCapabilities {
                room_id,
                rtp_capabilities: router.rtp_capabilities().clone(),
            },
        )
        .await;
        Ok(())
    }

    pub async fn create_transport(
        &self,
        peer: Peer,
        room_id: Uuid,
        direction: TransportDirection,
    ) -> Result<(), SignalError> {
        let token = {
            let mut registry = self.inner.registry.lock().await;
            require_member(&registry, peer, room_id)?;
            registry.reserve_transport(peer.user_id, room_id, direction)?
        };

        let created = async {
            let router = self.inner.allocator.get_or_create_router(room_id).await?;
            let transport = router.create_webrtc_transport().await?;
            Ok::<_, RelayError>((router, transport))
        }
        .await;
        let (router, transport) = match created {
            Ok(created) => created,
            Err(e) => {
                self.inner
                    .registry
                    .lock()
                    .await
                    .abort_transport(peer.user_id, direction, token);
                return Err(e.into());
            }
        };

        if let Some(bitrate) = self.inner.allocator.settings().max_incoming_bitrate {
            if let Err(e) = router.set_max_incoming_bitrate(transport.id, bitrate).await {
                tracing::warn!(
                    transport_id = %transport.id,
                    "Failed to set max incoming bitrate: {}",
                    e
                );
            }
        }

        let mut registry = self.inner.registry.lock().await;
        if !registry.commit_transport(peer.user_id, direction, token, transport.id) {
            drop(registry);
            tracing::debug!(
                user_id = %peer.user_id,
                transport_id = %transport.id,
                "Session ended while transport was created, closing it"
            );
            log_close(router.close_transport(transport.id).await, "transport", transport.id);
            return Ok(());
        }

        tracing::debug!(
            user_id = %peer.user_id,
            transport_id = %transport.id,
            %direction,
            "Transport created"
        );
        self.send(
            peer.connection_id,
            ServerMessage::TransportCreated {
                room_id,
                direction,
                transport,
            },
        )
        .await;
        Ok(())
    }

    pub async fn connect_transport(
        &self,
        peer: Peer,
        transport_id: Uuid,
        ice_parameters: IceParameters,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SignalError> {
        let room_id = {
            let registry = self.inner.registry.lock().await;
            let room_id = require_session(&registry, peer)?;
            registry.transport_direction(peer.user_id, transport_id)?;
            room_id
        };

        let router = self.router(room_id).await?;
        let result = router
            .connect_transport(transport_id, ice_parameters, dtls_parameters)
            .await;

        let registry = self.inner.registry.lock().await;
        if registry
            .transport_direction(peer.user_id, transport_id)
            .is_err()
        {
            tracing::debug!(transport_id = %transport_id, "Transport gone during connect");
            return Ok(());
        }
        result?;
        self.send(
            peer.connection_id,
            ServerMessage::TransportConnected { transport_id },
        )
        .await;
        Ok(())
    }

    pub async fn produce(
        &self,
        peer: Peer,
        transport_id: Uuid,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        source: ProducerSource,
    ) -> Result<(), SignalError> {
        let mime_type = rtp_parameters
            .primary_codec()
            .map(|codec| codec.mime_type.clone())
            .ok_or_else(|| SignalError::Rejected("produce requires a codec".to_string()))?;

        let reservation = {
            let mut registry = self.inner.registry.lock().await;
            require_session(&registry, peer)?;
            registry.reserve_producer(peer.user_id, transport_id, source, kind)?
        };

        let produced = async {
            let router = self.router(reservation.room_id).await?;
            let producer_id = router.produce(transport_id, kind, rtp_parameters).await?;
            Ok::<_, SignalError>((router, producer_id))
        }
        .await;
        let (router, producer_id) = match produced {
            Ok(produced) => produced,
            Err(e) => {
                self.inner
                    .registry
                    .lock()
                    .await
                    .abort_producer(&reservation);
                return Err(e);
            }
        };

        let mut registry = self.inner.registry.lock().await;
        let Some((record, recipients)) =
            registry.commit_producer(&reservation, producer_id, mime_type)
        else {
            drop(registry);
            tracing::debug!(
                producer_id = %producer_id,
                "Producer no longer wanted, closing it"
            );
            log_close(router.close_producer(producer_id).await, "producer", producer_id);
            self.send(
                peer.connection_id,
                ServerMessage::RequestRejected {
                    request: "produce".to_string(),
                    reason: format!("{} is no longer wanted", source),
                    subject: Some(RequestSubject::Produce { source }),
                },
            )
            .await;
            return Ok(());
        };

        self.send(
            peer.connection_id,
            ServerMessage::ProducerCreated {
                producer_id,
                source,
            },
        )
        .await;
        self.broadcast(
            &recipients,
            ServerMessage::NewPeerProducer {
                producer_id,
                user_id: peer.user_id,
                source,
                kind,
            },
        )
        .await;
        drop(registry);

        tracing::info!(
            user_id = %peer.user_id,
            room_id = %record.room_id,
            producer_id = %producer_id,
            %source,
            "Producer created"
        );
        Ok(())
    }

    pub async fn list_producers(&self, peer: Peer, room_id: Uuid) -> Result<(), SignalError> {
        let registry = self.inner.registry.lock().await;
        require_member(&registry, peer, room_id)?;
        let producers = registry.producers_in_room(peer.user_id, room_id)?;

        self.send(
            peer.connection_id,
            ServerMessage::ProducersList { room_id, producers },
        )
        .await;
        Ok(())
    }

    pub async fn consume(
        &self,
        peer: Peer,
        transport_id: Uuid,
        producer_id: Uuid,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<(), SignalError> {
        let (room_id, reservation) = {
            let mut registry = self.inner.registry.lock().await;
            let room_id = require_session(&registry, peer)?;
            let reservation =
                match registry.reserve_consumer(peer.user_id, transport_id, producer_id) {
                    Ok(reservation) => reservation,
                    Err(RegistryError::UnknownProducer) => {
                        tracing::debug!(producer_id = %producer_id, "Consume for a closed producer");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                };
            if !rtp_capabilities.supports(&reservation.producer.mime_type) {
                registry.abort_consumer(&reservation);
                return Err(SignalError::Rejected(format!(
                    "cannot receive {}",
                    reservation.producer.mime_type
                )));
            }
            (room_id, reservation)
        };

        let consumed = async {
            let router = self.router(room_id).await?;
            let options = router
                .consume(transport_id, producer_id, rtp_capabilities)
                .await?;
            Ok::<_, SignalError>((router, options))
        }
        .await;
        let (router, options) = match consumed {
            Ok(consumed) => consumed,
            Err(e) => {
                let mut registry = self.inner.registry.lock().await;
                registry.abort_consumer(&reservation);
                if registry.producer(producer_id).is_none() {
                    tracing::debug!(producer_id = %producer_id, "Producer closed during consume");
                    return Ok(());
                }
                return Err(e);
            }
        };

        let mut registry = self.inner.registry.lock().await;
        if !registry.commit_consumer(&reservation, options.id) {
            drop(registry);
            tracing::debug!(
                producer_id = %producer_id,
                consumer_id = %options.id,
                "Consumer no longer wanted, closing it"
            );
            log_close(router.close_consumer(options.id).await, "consumer", options.id);
            return Ok(());
        }

        self.send(
            peer.connection_id,
            ServerMessage::ConsumerCreated {
                consumer_id: options.id,
                producer_id,
                user_id: reservation.producer.owner,
                source: reservation.producer.source,
                kind: options.kind,
                rtp_parameters: options.rtp_parameters,
            },
        )
        .await;
        Ok(())
    }

    pub async fn close_producer(&self, peer: Peer, producer_id: Uuid) -> Result<(), SignalError> {
        let closure = {
            let mut registry = self.inner.registry.lock().await;
            require_session(&registry, peer)?;
            match registry.producer(producer_id) {
                None => {
                    tracing::debug!(producer_id = %producer_id, "Producer already closed");
                    return Ok(());
                }
                Some(record) if record.owner != peer.user_id => {
                    return Err(SignalError::Rejected(
                        "producer belongs to another user".to_string(),
                    ));
                }
                Some(_) => {}
            }
            registry.remove_producer(producer_id)
        };

        if let Some(closure) = closure {
            self.finish_producer_closure(closure).await;
        }
        Ok(())
    }

    /// Close a producer already removed from the registry and tell the room
    async fn finish_producer_closure(&self, closure: ProducerClosure) {
        let ProducerClosure {
            record,
            consumers,
            recipients,
        } = closure;

        if let Some(router) = self.inner.allocator.router(record.room_id).await {
            for consumer_id in consumers {
                log_close(router.close_consumer(consumer_id).await, "consumer", consumer_id);
            }
            log_close(router.close_producer(record.id).await, "producer", record.id);
        }

        self.broadcast(
            &recipients,
            ServerMessage::ProducerClosed {
                producer_id: record.id,
                user_id: record.owner,
            },
        )
        .await;

        tracing::info!(
            user_id = %record.owner,
            producer_id = %record.id,
            source = %record.source,
            "Producer closed"
        );
    }

    pub async fn start_shared_browser(
        &self,
        peer: Peer,
        room_id: Uuid,
        url: String,
    ) -> Result<(), SignalError> {
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(SignalError::Rejected(
                "shared browser url must be http or https".to_string(),
            ));
        }

        let mut registry = self.inner.registry.lock().await;
        require_member(&registry, peer, room_id)?;
        let (info, recipients) = registry.start_browser(peer.user_id, room_id, url)?;

        self.broadcast(
            &recipients,
            ServerMessage::SharedBrowserStarted {
                room_id,
                owner_id: info.owner_id,
                url: info.url.clone(),
            },
        )
        .await;
        drop(registry);

        tracing::info!(
            room_id = %room_id,
            owner_id = %peer.user_id,
            url = %info.url,
            "Shared browser started"
        );
        Ok(())
    }

    pub async fn stop_shared_browser(&self, peer: Peer, room_id: Uuid) -> Result<(), SignalError> {
        let stop = {
            let mut registry = self.inner.registry.lock().await;
            require_member(&registry, peer, room_id)?;
            registry.stop_browser(peer.user_id, room_id)?
        };

        for closure in stop.producers {
            self.finish_producer_closure(closure).await;
        }
        self.broadcast(
            &stop.recipients,
            ServerMessage::SharedBrowserStopped {
                room_id,
                owner_id: stop.info.owner_id,
                url: stop.info.url,
            },
        )
        .await;

        tracing::info!(room_id = %room_id, "Shared browser stopped");
        Ok(())
    }

    /// Deliver input to the shared browser's owner; dropped when no session
    /// is active
    pub async fn forward_browser_input(
        &self,
        peer: Peer,
        room_id: Uuid,
        event: BrowserInputEvent,
    ) -> Result<(), SignalError> {
        let registry = self.inner.registry.lock().await;
        require_member(&registry, peer, room_id)?;

        match (
            registry.browser_owner(room_id),
            registry.browser_owner_connection(room_id),
        ) {
            (Some(owner), Some(connection_id)) if owner != peer.user_id => {
                self.send(
                    connection_id,
                    ServerMessage::SharedBrowserInput {
                        room_id,
                        from_user_id: peer.user_id,
                        event,
                    },
                )
                .await;
            }
            (Some(_), _) => {}
            (None, _) => {
                tracing::debug!(room_id = %room_id, "Browser input without active session dropped");
            }
        }
        Ok(())
    }

    /// Reconcile the registry with a state change the relay made on its own
    pub async fn handle_relay_event(&self, event: RelayEvent) {
        match event {
            RelayEvent::TransportClosed { transport_id, .. } => {
                let closure = self.inner.registry.lock().await.remove_transport(transport_id);
                let Some(closure) = closure else {
                    return;
                };
                tracing::warn!(
                    user_id = %closure.owner,
                    transport_id = %transport_id,
                    direction = %closure.direction,
                    "Relay closed transport"
                );
                if let Some(router) = self.inner.allocator.router(closure.room_id).await {
                    for consumer_id in &closure.consumers {
                        log_close(router.close_consumer(*consumer_id).await, "consumer", *consumer_id);
                    }
                }
                for producer in closure.producers {
                    self.finish_producer_closure(producer).await;
                }
            }
            RelayEvent::ProducerClosed { producer_id, .. } => {
                let closure = self.inner.registry.lock().await.remove_producer(producer_id);
                if let Some(closure) = closure {
                    self.finish_producer_closure(closure).await;
                }
            }
            RelayEvent::ConsumerClosed { consumer_id, .. } => {
                if let Some(record) = self.inner.registry.lock().await.remove_consumer(consumer_id) {
                    tracing::debug!(
                        user_id = %record.owner,
                        consumer_id = %consumer_id,
                        "Relay closed consumer"
                    );
                }
            }
            RelayEvent::WorkerDied { worker_id } => {
                tracing::error!("Relay worker {} died, media state is lost", worker_id);
            }
        }
    }

    /// Feed allocator events into [`Coordinator::handle_relay_event`]
    pub fn spawn_relay_listener(&self) -> JoinHandle<()> {
        let mut rx = self.inner.allocator.subscribe();
        let coordinator = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => coordinator.handle_relay_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Relay event listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Apply the room lifetime policy to a room that just became empty
    async fn room_vacated(&self, room_id: Uuid, token: u64) {
        let Some(grace) = self.inner.lifetime.grace_period() else {
            return;
        };

        if grace.is_zero() {
            self.destroy_router_if_vacant(room_id, token).await;
            return;
        }

        tracing::debug!(room_id = %room_id, ?grace, "Room empty, router will linger");
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            coordinator.destroy_router_if_vacant(room_id, token).await;
        });
    }

    async fn destroy_router_if_vacant(&self, room_id: Uuid, token: u64) {
        let router = {
            let mut registry = self.inner.registry.lock().await;
            if !registry.claim_vacancy(room_id, token) {
                return;
            }
            self.inner.allocator.take_router(room_id).await
        };

        if let Some(router) = router {
            match router.close().await {
                Ok(()) => tracing::info!(room_id = %room_id, "Closed router of empty room"),
                Err(e) => tracing::warn!(room_id = %room_id, "Failed to close router: {}", e),
            }
        }
    }

    pub async fn room_stats(&self) -> Vec<RoomStats> {
        self.inner.registry.lock().await.stats()
    }
}

fn log_close(result: Result<(), RelayError>, what: &str, id: Uuid) {
    if let Err(e) = result {
        if e.is_fatal() {
            tracing::error!("Failed to close {} {}: {}", what, id, e);
        } else {
            tracing::debug!("Failed to close {} {}: {}", what, id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{RoomAllowList, SessionDirectory};
    use crate::sfu::{BrowserError, RelaySettings};
    use async_trait::async_trait;
    use huddle_protocol::{RtpCodecCapability, RtpCodecParameters, RtpEncoding};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: std::sync::Mutex<Vec<(Uuid, ServerMessage)>>,
    }

    impl RecordingNotifier {
        /// Drain everything sent to `connection_id` so far
        fn take(&self, connection_id: Uuid) -> Vec<ServerMessage> {
            let mut sent = self.sent.lock().unwrap();
            let (mine, rest): (Vec<_>, Vec<_>) =
                sent.drain(..).partition(|(to, _)| *to == connection_id);
            *sent = rest;
            mine.into_iter().map(|(_, message)| message).collect()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_to_connection(&self, connection_id: Uuid, message: &ServerMessage) {
            self.sent
                .lock()
                .unwrap()
                .push((connection_id, message.clone()));
        }
    }

    struct Harness {
        coordinator: Coordinator,
        notifier: Arc<RecordingNotifier>,
        allocator: Arc<WorkerAllocator>,
        room_id: Uuid,
    }

    fn harness_with(lifetime: RoomLifetime, relay: RelaySettings, allowed: Option<Vec<Uuid>>) -> Harness {
        let notifier = Arc::new(RecordingNotifier::default());
        let allocator = Arc::new(WorkerAllocator::with_local_workers(relay));
        let coordinator = Coordinator::new(
            allocator.clone(),
            notifier.clone(),
            Arc::new(RoomAllowList::new(allowed)),
            Arc::new(SessionDirectory::new()),
            lifetime,
        );
        Harness {
            coordinator,
            notifier,
            allocator,
            room_id: Uuid::new_v4(),
        }
    }

    fn relay_settings() -> RelaySettings {
        RelaySettings {
            workers: 1,
            rtc_min_port: 42000,
            rtc_max_port: 42999,
            ..Default::default()
        }
    }

    fn harness(lifetime: RoomLifetime) -> Harness {
        harness_with(lifetime, relay_settings(), None)
    }

    fn peer() -> Peer {
        Peer {
            user_id: Uuid::new_v4(),
            connection_id: Uuid::new_v4(),
        }
    }

    fn opus() -> RtpParameters {
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
                ssrc: 1,
                max_bitrate: None,
            }],
        }
    }

    fn vp8() -> RtpParameters {
        RtpParameters {
            mid: None,
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90000,
                channels: None,
                parameters: String::new(),
            }],
            encodings: vec![RtpEncoding {
                ssrc: 2,
                max_bitrate: None,
            }],
        }
    }

    fn capabilities() -> RtpCapabilities {
        RtpCapabilities {
            codecs: vec![RtpCodecCapability::opus(), RtpCodecCapability::vp8()],
        }
    }

    /// Create both transports and return (send, recv) ids
    async fn transports(h: &Harness, peer: Peer) -> (Uuid, Uuid) {
        for direction in [TransportDirection::Send, TransportDirection::Recv] {
            h.coordinator
                .create_transport(peer, h.room_id, direction)
                .await
                .unwrap();
        }

        let mut send = None;
        let mut recv = None;
        for message in h.notifier.take(peer.connection_id) {
            if let ServerMessage::TransportCreated {
                direction,
                transport,
                ..
            } = message
            {
                match direction {
                    TransportDirection::Send => send = Some(transport.id),
                    TransportDirection::Recv => recv = Some(transport.id),
                }
            }
        }
        (send.unwrap(), recv.unwrap())
    }

    fn new_producers(messages: &[ServerMessage]) -> Vec<(Uuid, ProducerSource)> {
        messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::NewPeerProducer {
                    producer_id, source, ..
                } => Some((*producer_id, *source)),
                _ => None,
            })
            .collect()
    }

    fn closed_producers(messages: &[ServerMessage]) -> Vec<Uuid> {
        messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::ProducerClosed { producer_id, .. } => Some(*producer_id),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_two_peer_room_lifecycle() {
        let h = harness(RoomLifetime::KeepAlive);
        let room_id = h.room_id;
        let (a, b) = (peer(), peer());

        h.coordinator.join(a, room_id).await.unwrap();
        assert_eq!(
            h.notifier.take(a.connection_id),
            vec![ServerMessage::ExistingVoiceMembers {
                room_id,
                members: vec![],
                shared_browser: None,
            }]
        );

        h.coordinator.join(b, room_id).await.unwrap();
        let to_a = h.notifier.take(a.connection_id);
        assert_eq!(to_a.len(), 1);
        assert!(matches!(
            &to_a[0],
            ServerMessage::UserJoinedVoice { user, .. } if user.user_id == b.user_id
        ));
        let to_b = h.notifier.take(b.connection_id);
        assert!(matches!(
            &to_b[..],
            [ServerMessage::ExistingVoiceMembers { members, .. }]
                if members.len() == 1 && members[0].user_id == a.user_id
        ));

        let (a_send, _) = transports(&h, a).await;
        let (_, b_recv) = transports(&h, b).await;

        h.coordinator
            .produce(a, a_send, MediaKind::Audio, opus(), ProducerSource::Mic)
            .await
            .unwrap();
        let to_a = h.notifier.take(a.connection_id);
        assert!(matches!(
            &to_a[..],
            [ServerMessage::ProducerCreated { source: ProducerSource::Mic, .. }]
        ));
        let announced = new_producers(&h.notifier.take(b.connection_id));
        assert_eq!(announced.len(), 1);
        let (mic, _) = announced[0];

        h.coordinator
            .consume(b, b_recv, mic, capabilities())
            .await
            .unwrap();
        let to_b = h.notifier.take(b.connection_id);
        assert!(matches!(
            &to_b[..],
            [ServerMessage::ConsumerCreated { producer_id, user_id, source: ProducerSource::Mic, kind: MediaKind::Audio, .. }]
                if *producer_id == mic && *user_id == a.user_id
        ));

        h.coordinator.leave(a, Some(room_id)).await;
        assert_eq!(
            h.notifier.take(b.connection_id),
            vec![
                ServerMessage::ProducerClosed {
                    producer_id: mic,
                    user_id: a.user_id,
                },
                ServerMessage::UserLeftVoice {
                    room_id,
                    user_id: a.user_id,
                },
            ]
        );

        // Leaving again is a silent no-op
        h.coordinator.leave(a, Some(room_id)).await;
        assert!(h.notifier.take(b.connection_id).is_empty());
        assert!(h.notifier.take(a.connection_id).is_empty());

        let stats = h.coordinator.room_stats().await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].members, 1);
        assert_eq!(stats[0].producers, 0);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_produce_yields_one_producer() {
        let h = harness(RoomLifetime::KeepAlive);
        let (a, b) = (peer(), peer());
        h.coordinator.join(a, h.room_id).await.unwrap();
        h.coordinator.join(b, h.room_id).await.unwrap();
        let (a_send, _) = transports(&h, a).await;
        h.notifier.take(b.connection_id);

        let (first, second) = tokio::join!(
            h.coordinator
                .produce(a, a_send, MediaKind::Audio, opus(), ProducerSource::Mic),
            h.coordinator
                .produce(a, a_send, MediaKind::Audio, opus(), ProducerSource::Mic),
        );

        assert_eq!(first.is_ok() as u8 + second.is_ok() as u8, 1);
        let err = first.err().or(second.err()).unwrap();
        assert!(matches!(
            err,
            SignalError::Registry(RegistryError::SourceActive(ProducerSource::Mic))
        ));
        assert_eq!(new_producers(&h.notifier.take(b.connection_id)).len(), 1);
    }

    #[tokio::test]
    async fn test_kind_must_match_source() {
        let h = harness(RoomLifetime::KeepAlive);
        let a = peer();
        h.coordinator.join(a, h.room_id).await.unwrap();
        let (a_send, _) = transports(&h, a).await;

        let err = h
            .coordinator
            .produce(a, a_send, MediaKind::Audio, opus(), ProducerSource::Webcam)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SignalError::Registry(RegistryError::KindMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_relay_closing_send_transport_announces_each_producer_once() {
        let h = harness(RoomLifetime::KeepAlive);
        let (a, b) = (peer(), peer());
        h.coordinator.join(a, h.room_id).await.unwrap();
        h.coordinator.join(b, h.room_id).await.unwrap();
        let (a_send, _) = transports(&h, a).await;
        let (_, b_recv) = transports(&h, b).await;

        h.coordinator
            .produce(a, a_send, MediaKind::Audio, opus(), ProducerSource::Mic)
            .await
            .unwrap();
        h.coordinator
            .produce(a, a_send, MediaKind::Video, vp8(), ProducerSource::Webcam)
            .await
            .unwrap();
        let announced = new_producers(&h.notifier.take(b.connection_id));
        for (producer_id, _) in &announced {
            h.coordinator
                .consume(b, b_recv, *producer_id, capabilities())
                .await
                .unwrap();
        }
        h.notifier.take(b.connection_id);

        let mut events = h.allocator.subscribe();
        let router = h.allocator.router(h.room_id).await.unwrap();
        router.close_transport(a_send).await.unwrap();

        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            let done = matches!(event, RelayEvent::TransportClosed { transport_id, .. } if transport_id == a_send);
            h.coordinator.handle_relay_event(event).await;
            if done {
                break;
            }
        }

        let mut closed = closed_producers(&h.notifier.take(b.connection_id));
        closed.sort();
        let mut expected: Vec<Uuid> = announced.iter().map(|(id, _)| *id).collect();
        expected.sort();
        assert_eq!(closed, expected);

        // The session keeps no replacement transport
        let err = h
            .coordinator
            .create_transport(a, h.room_id, TransportDirection::Send)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SignalError::Registry(RegistryError::TransportClosed(TransportDirection::Send))
        ));
    }

    #[tokio::test]
    async fn test_consume_rejections() {
        let h = harness(RoomLifetime::KeepAlive);
        let (a, b) = (peer(), peer());
        h.coordinator.join(a, h.room_id).await.unwrap();
        h.coordinator.join(b, h.room_id).await.unwrap();
        let (a_send, a_recv) = transports(&h, a).await;
        let (_, b_recv) = transports(&h, b).await;

        h.coordinator
            .produce(a, a_send, MediaKind::Audio, opus(), ProducerSource::Mic)
            .await
            .unwrap();
        let (mic, _) = new_producers(&h.notifier.take(b.connection_id))[0];

        let video_only = RtpCapabilities {
            codecs: vec![RtpCodecCapability::vp8()],
        };
        assert!(matches!(
            h.coordinator.consume(b, b_recv, mic, video_only).await,
            Err(SignalError::Rejected(_))
        ));
        assert!(matches!(
            h.coordinator.consume(a, a_recv, mic, capabilities()).await,
            Err(SignalError::Registry(RegistryError::OwnProducer))
        ));

        h.coordinator
            .consume(b, b_recv, mic, capabilities())
            .await
            .unwrap();
        assert!(matches!(
            h.coordinator.consume(b, b_recv, mic, capabilities()).await,
            Err(SignalError::Registry(RegistryError::AlreadyConsuming))
        ));
    }

    #[tokio::test]
    async fn test_consume_of_closed_producer_is_silent() {
        let h = harness(RoomLifetime::KeepAlive);
        let (a, b) = (peer(), peer());
        h.coordinator.join(a, h.room_id).await.unwrap();
        h.coordinator.join(b, h.room_id).await.unwrap();
        let (a_send, _) = transports(&h, a).await;
        let (_, b_recv) = transports(&h, b).await;

        h.coordinator
            .produce(a, a_send, MediaKind::Audio, opus(), ProducerSource::Mic)
            .await
            .unwrap();
        let (mic, _) = new_producers(&h.notifier.take(b.connection_id))[0];
        h.coordinator.close_producer(a, mic).await.unwrap();
        assert_eq!(closed_producers(&h.notifier.take(b.connection_id)), vec![mic]);

        // b asked before it saw producer-closed
        h.coordinator
            .consume(b, b_recv, mic, capabilities())
            .await
            .unwrap();
        assert!(h.notifier.take(b.connection_id).is_empty());
    }

    #[tokio::test]
    async fn test_browser_produce_racing_stop_is_answered() {
        let h = harness(RoomLifetime::KeepAlive);
        let a = peer();
        h.coordinator.join(a, h.room_id).await.unwrap();
        let (a_send, _) = transports(&h, a).await;
        h.coordinator
            .start_shared_browser(a, h.room_id, "https://example.com".to_string())
            .await
            .unwrap();
        h.notifier.take(a.connection_id);

        // The produce parks on the relay; the stop lands before it commits
        let (produced, stopped) = tokio::join!(
            h.coordinator
                .produce(a, a_send, MediaKind::Video, vp8(), ProducerSource::Browser),
            h.coordinator.stop_shared_browser(a, h.room_id),
        );
        produced.unwrap();
        stopped.unwrap();

        let to_a = h.notifier.take(a.connection_id);
        assert!(to_a.iter().any(|m| matches!(
            m,
            ServerMessage::RequestRejected {
                subject: Some(RequestSubject::Produce {
                    source: ProducerSource::Browser
                }),
                ..
            }
        )));
        assert!(!to_a
            .iter()
            .any(|m| matches!(m, ServerMessage::ProducerCreated { .. })));
        assert_eq!(h.coordinator.room_stats().await[0].producers, 0);
    }

    #[tokio::test]
    async fn test_shared_browser_ownership() {
        let h = harness(RoomLifetime::KeepAlive);
        let room_id = h.room_id;
        let (a, b) = (peer(), peer());
        h.coordinator.join(a, room_id).await.unwrap();
        h.coordinator.join(b, room_id).await.unwrap();
        h.notifier.take(a.connection_id);
        h.notifier.take(b.connection_id);

        h.coordinator
            .start_shared_browser(a, room_id, "https://example.com".to_string())
            .await
            .unwrap();
        let started = ServerMessage::SharedBrowserStarted {
            room_id,
            owner_id: a.user_id,
            url: "https://example.com".to_string(),
        };
        assert_eq!(h.notifier.take(b.connection_id), vec![started.clone()]);
        assert_eq!(h.notifier.take(a.connection_id), vec![started]);

        let err = h
            .coordinator
            .start_shared_browser(b, room_id, "https://example.org".to_string())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SignalError::Registry(RegistryError::Browser(BrowserError::AlreadyActive))
        ));
        assert!(h.notifier.take(a.connection_id).is_empty());

        // Only the owner produces browser media
        let (_, _) = transports(&h, a).await;
        let (b_send, _) = transports(&h, b).await;
        assert!(matches!(
            h.coordinator
                .produce(b, b_send, MediaKind::Video, vp8(), ProducerSource::Browser)
                .await,
            Err(SignalError::Registry(RegistryError::BrowserNotOwner))
        ));

        let event = BrowserInputEvent::Click {
            x: 0.5,
            y: 0.25,
            button: huddle_protocol::MouseButton::Left,
        };
        h.coordinator
            .forward_browser_input(b, room_id, event.clone())
            .await
            .unwrap();
        assert_eq!(
            h.notifier.take(a.connection_id),
            vec![ServerMessage::SharedBrowserInput {
                room_id,
                from_user_id: b.user_id,
                event: event.clone(),
            }]
        );

        assert!(matches!(
            h.coordinator.stop_shared_browser(b, room_id).await,
            Err(SignalError::Registry(RegistryError::Browser(BrowserError::NotOwner)))
        ));
        h.coordinator.stop_shared_browser(a, room_id).await.unwrap();
        assert_eq!(
            h.notifier.take(b.connection_id),
            vec![ServerMessage::SharedBrowserStopped {
                room_id,
                owner_id: a.user_id,
                url: "https://example.com".to_string(),
            }]
        );

        // Input racing a stop is dropped without error
        h.coordinator
            .forward_browser_input(b, room_id, event)
            .await
            .unwrap();
        assert!(h.notifier.take(a.connection_id).iter().all(|m| !matches!(m, ServerMessage::SharedBrowserInput { .. })));

        h.coordinator
            .start_shared_browser(a, room_id, "https://example.net".to_string())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_browser_owner_leaving_stops_session() {
        let h = harness(RoomLifetime::KeepAlive);
        let (a, b) = (peer(), peer());
        h.coordinator.join(a, h.room_id).await.unwrap();
        h.coordinator.join(b, h.room_id).await.unwrap();
        h.coordinator
            .start_shared_browser(a, h.room_id, "https://example.com".to_string())
            .await
            .unwrap();
        h.notifier.take(b.connection_id);

        h.coordinator.disconnect(a).await;

        let to_b = h.notifier.take(b.connection_id);
        assert!(to_b.contains(&ServerMessage::SharedBrowserStopped {
            room_id: h.room_id,
            owner_id: a.user_id,
            url: "https://example.com".to_string(),
        }));
        h.coordinator
            .start_shared_browser(b, h.room_id, "https://example.org".to_string())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_joining_another_room_leaves_the_first() {
        let h = harness(RoomLifetime::KeepAlive);
        let (a, b) = (peer(), peer());
        h.coordinator.join(a, h.room_id).await.unwrap();
        h.coordinator.join(b, h.room_id).await.unwrap();
        h.notifier.take(b.connection_id);

        let other_room = Uuid::new_v4();
        h.coordinator.join(a, other_room).await.unwrap();

        assert_eq!(
            h.notifier.take(b.connection_id),
            vec![ServerMessage::UserLeftVoice {
                room_id: h.room_id,
                user_id: a.user_id,
            }]
        );
        assert!(matches!(
            h.coordinator.join(a, other_room).await,
            Err(SignalError::Registry(RegistryError::AlreadyInRoom))
        ));
    }

    #[tokio::test]
    async fn test_stale_connection_cannot_end_new_session() {
        let h = harness(RoomLifetime::KeepAlive);
        let old = peer();
        let new = Peer {
            user_id: old.user_id,
            connection_id: Uuid::new_v4(),
        };

        tokio_test::assert_ok!(h.coordinator.join(old, h.room_id).await);
        tokio_test::assert_ok!(h.coordinator.join(new, h.room_id).await);
        h.coordinator.disconnect(old).await;

        let stats = h.coordinator.room_stats().await;
        assert_eq!(stats[0].members, 1);
        assert!(matches!(
            h.coordinator.list_producers(old, h.room_id).await,
            Err(SignalError::Registry(RegistryError::NotInRoom))
        ));
    }

    #[tokio::test]
    async fn test_unauthorized_join_is_rejected() {
        let h = harness_with(
            RoomLifetime::KeepAlive,
            relay_settings(),
            Some(vec![Uuid::new_v4()]),
        );
        let a = peer();

        assert!(matches!(
            h.coordinator.join(a, h.room_id).await,
            Err(SignalError::Rejected(_))
        ));
        assert!(h.coordinator.room_stats().await.is_empty());
    }

    #[tokio::test]
    async fn test_bitrate_failure_does_not_abort_transport() {
        let relay = RelaySettings {
            max_incoming_bitrate: Some(50_000_000),
            ..relay_settings()
        };
        let h = harness_with(RoomLifetime::KeepAlive, relay, None);
        let a = peer();
        h.coordinator.join(a, h.room_id).await.unwrap();

        let (send, recv) = transports(&h, a).await;
        assert_ne!(send, recv);
    }

    #[tokio::test]
    async fn test_catch_up_lists_existing_producers() {
        let h = harness(RoomLifetime::KeepAlive);
        let (a, b) = (peer(), peer());
        h.coordinator.join(a, h.room_id).await.unwrap();
        let (a_send, _) = transports(&h, a).await;
        h.coordinator
            .produce(a, a_send, MediaKind::Audio, opus(), ProducerSource::Mic)
            .await
            .unwrap();

        h.coordinator.join(b, h.room_id).await.unwrap();
        h.notifier.take(b.connection_id);
        h.coordinator.list_producers(b, h.room_id).await.unwrap();

        let to_b = h.notifier.take(b.connection_id);
        assert!(matches!(
            &to_b[..],
            [ServerMessage::ProducersList { producers, .. }]
                if producers.len() == 1
                    && producers[0].user_id == a.user_id
                    && producers[0].source == ProducerSource::Mic
        ));
    }

    #[tokio::test]
    async fn test_room_lifetime_policies() {
        let keep = harness(RoomLifetime::KeepAlive);
        let a = peer();
        keep.coordinator.join(a, keep.room_id).await.unwrap();
        keep.coordinator
            .room_capabilities(a, keep.room_id)
            .await
            .unwrap();
        keep.coordinator.leave(a, None).await;
        assert!(keep.allocator.router(keep.room_id).await.is_some());

        let eager = harness(RoomLifetime::DestroyWhenEmpty);
        eager.coordinator.join(a, eager.room_id).await.unwrap();
        eager
            .coordinator
            .room_capabilities(a, eager.room_id)
            .await
            .unwrap();
        eager.coordinator.leave(a, None).await;
        assert!(eager.allocator.router(eager.room_id).await.is_none());
    }

    #[tokio::test]
    async fn test_linger_rejoin_keeps_router() {
        let h = harness(RoomLifetime::Linger { ttl_secs: 1 });
        let a = peer();
        h.coordinator.join(a, h.room_id).await.unwrap();
        h.coordinator.room_capabilities(a, h.room_id).await.unwrap();
        let router_id = h.allocator.router(h.room_id).await.unwrap().id();

        h.coordinator.leave(a, None).await;
        h.coordinator.join(a, h.room_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(h.allocator.router(h.room_id).await.unwrap().id(), router_id);

        h.coordinator.leave(a, None).await;
        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert!(h.allocator.router(h.room_id).await.is_none());
    }
}
