//! Session State Machine
//!
//! One [`VoiceSession`] drives a single visit to a voice room:
//!
//! `idle -> capability-exchange -> transports-pending -> active -> closing -> closed`
//!
//! The send transport is requested before the recv transport so local audio
//! can be produced as soon as it exists. Producer announcements that arrive
//! before the recv transport are queued and replayed in arrival order; live
//! announcements and the catch-up list are merged by producer id.
//!
//! The session never blocks on the network. Requests go to an outbox channel
//! and replies are fed back through [`VoiceSession::handle`]. Failed produce
//! and consume requests name the source or producer they were about, so a
//! failure is matched to its own pending entry rather than to reply order.

use super::browser::CoBrowse;
use super::capture::{CaptureBackend, CaptureError, CaptureRequest, LocalTrack};
use super::device::{Device, DeviceError};
use super::screen::{ScreenShare, SelfView};
use super::transport::{PeerTransport, TransportError};
use huddle_protocol::{
    AppData, BrowserInputEvent, ClientMessage, DtlsParameters, IceParameters, MediaKind,
    MemberInfo, Placement, ProducerInfo, ProducerSource, RequestSubject, RtpCapabilities,
    ServerMessage, SharedBrowserInfo, TransportDirection, TransportOptions,
};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    CapabilityExchange,
    TransportsPending,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::CapabilityExchange => "capability-exchange",
            SessionState::TransportsPending => "transports-pending",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Produce the microphone on join
    pub mic: bool,
    /// Produce the camera on join
    pub webcam: bool,
    /// Share the browser's audio along with its video when owning a session
    pub browser_audio: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            mic: true,
            webcam: false,
            browser_audio: false,
        }
    }
}

/// User-initiated operations
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    StartWebcam,
    StopWebcam,
    StartScreenShare { with_audio: bool },
    StopScreenShare,
    StartSharedBrowser { url: String },
    StopSharedBrowser,
    BrowserInput(BrowserInputEvent),
    Leave,
}

/// A remote track being received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTile {
    pub consumer_id: Uuid,
    pub producer_id: Uuid,
    pub user_id: Uuid,
    pub source: ProducerSource,
    pub kind: MediaKind,
    pub placement: Placement,
}

/// Everything the UI layer needs to know about
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    MembersSeeded(Vec<MemberInfo>),
    MemberJoined(MemberInfo),
    MemberLeft(Uuid),
    TileAdded(RemoteTile),
    TileRemoved {
        producer_id: Uuid,
        user_id: Uuid,
        placement: Placement,
    },
    LocalSourceStarted(ProducerSource),
    LocalSourceStopped(ProducerSource),
    SelfViewChanged(SelfView),
    SharedBrowserStarted(SharedBrowserInfo),
    SharedBrowserStopped(SharedBrowserInfo),
    /// Remote-control input for the browser this client owns
    BrowserInput {
        from_user_id: Uuid,
        event: BrowserInputEvent,
    },
    /// A user-initiated operation failed
    Notice(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("cannot {op} while {state}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },

    #[error("source {0} is already active")]
    SourceActive(ProducerSource),

    #[error("source {0} is not active")]
    SourceInactive(ProducerSource),

    #[error("a shared browser is already active in this room")]
    BrowserActive,

    #[error("no shared browser is active in this room")]
    NoBrowser,

    #[error("only the shared browser owner may stop it")]
    NotBrowserOwner,

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportSlot {
    NotRequested,
    Requested,
    Ready(Uuid),
    Closed,
}

impl TransportSlot {
    fn ready(self) -> Option<Uuid> {
        match self {
            TransportSlot::Ready(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum LocalProducer {
    /// Waiting for the send transport
    Deferred(CaptureRequest),
    /// Produce request sent
    Pending(LocalTrack),
    Live { track: LocalTrack, producer_id: Uuid },
}

impl LocalProducer {
    fn track(&self) -> Option<&LocalTrack> {
        match self {
            LocalProducer::Deferred(_) => None,
            LocalProducer::Pending(track) | LocalProducer::Live { track, .. } => Some(track),
        }
    }

    fn producer_id(&self) -> Option<Uuid> {
        match self {
            LocalProducer::Live { producer_id, .. } => Some(*producer_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingProduce {
    source: ProducerSource,
    /// Stopped before the server answered; close the producer on arrival
    abandoned: bool,
}

#[derive(Debug, Clone)]
enum RemoteProducer {
    Requested(ProducerInfo),
    Consuming(RemoteTile),
}

pub struct VoiceSession {
    user_id: Uuid,
    room_id: Option<Uuid>,
    state: SessionState,
    options: SessionOptions,
    device: Device,
    capture: Arc<dyn CaptureBackend>,
    outbox: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::UnboundedSender<SessionEvent>,
    send_transport: TransportSlot,
    recv_transport: TransportSlot,
    producers: HashMap<ProducerSource, LocalProducer>,
    /// Produce requests awaiting an answer, in send order
    pending_produces: VecDeque<PendingProduce>,
    /// Announcements received before the recv transport existed
    announcements: VecDeque<ProducerInfo>,
    /// Remote producers requested or consumed, keyed by producer id
    remote: HashMap<Uuid, RemoteProducer>,
    transports: HashMap<Uuid, PeerTransport>,
    self_view: SelfView,
    screen: Option<ScreenShare>,
    browser: Option<CoBrowse>,
}

impl VoiceSession {
    pub fn new(
        user_id: Uuid,
        capture: Arc<dyn CaptureBackend>,
        outbox: mpsc::UnboundedSender<ClientMessage>,
        events: mpsc::UnboundedSender<SessionEvent>,
        options: SessionOptions,
    ) -> Self {
        Self {
            user_id,
            room_id: None,
            state: SessionState::Idle,
            options,
            device: Device::new(),
            capture,
            outbox,
            events,
            send_transport: TransportSlot::NotRequested,
            recv_transport: TransportSlot::NotRequested,
            producers: HashMap::new(),
            pending_produces: VecDeque::new(),
            announcements: VecDeque::new(),
            remote: HashMap::new(),
            transports: HashMap::new(),
            self_view: SelfView::Avatar,
            screen: None,
            browser: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn room_id(&self) -> Option<Uuid> {
        self.room_id
    }

    pub fn self_view(&self) -> SelfView {
        self.self_view
    }

    /// Producer id of a live local source
    pub fn producer_id(&self, source: ProducerSource) -> Option<Uuid> {
        self.producers.get(&source).and_then(LocalProducer::producer_id)
    }

    pub fn consuming(&self) -> Vec<RemoteTile> {
        self.remote
            .values()
            .filter_map(|r| match r {
                RemoteProducer::Consuming(tile) => Some(tile.clone()),
                RemoteProducer::Requested(_) => None,
            })
            .collect()
    }

    pub fn shared_browser(&self) -> Option<&CoBrowse> {
        self.browser.as_ref()
    }

    fn send(&self, message: ClientMessage) {
        if self.outbox.send(message).is_err() {
            tracing::debug!("Signaling channel closed, dropping request");
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn notice(&self, message: String) {
        tracing::warn!("{}", message);
        self.emit(SessionEvent::Notice(message));
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        tracing::debug!(from = %self.state, to = %state, "Session state changed");
        self.state = state;
        self.emit(SessionEvent::StateChanged(state));
    }

    fn set_self_view(&mut self, view: SelfView) {
        if self.self_view != view {
            self.self_view = view;
            self.emit(SessionEvent::SelfViewChanged(view));
        }
    }

    fn require_joined(&self, op: &'static str) -> Result<Uuid, SessionError> {
        match (self.state, self.room_id) {
            (
                SessionState::CapabilityExchange
                | SessionState::TransportsPending
                | SessionState::Active,
                Some(room_id),
            ) => Ok(room_id),
            _ => Err(SessionError::InvalidState {
                op,
                state: self.state,
            }),
        }
    }

    /// Ask to join `room_id` and start the capability exchange
    pub fn join(&mut self, room_id: Uuid) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::InvalidState {
                op: "join",
                state: self.state,
            });
        }

        self.room_id = Some(room_id);
        self.send(ClientMessage::JoinVoiceRoom { room_id });
        self.send(ClientMessage::GetRoomCapabilities { room_id });
        self.set_state(SessionState::CapabilityExchange);

        if self.options.mic {
            self.defer(CaptureRequest::new(ProducerSource::Mic));
        }
        if self.options.webcam {
            self.defer(CaptureRequest::new(ProducerSource::Webcam));
            self.set_self_view(SelfView::Camera);
        }

        tracing::info!(room_id = %room_id, "Joining voice room");
        Ok(())
    }

    fn defer(&mut self, request: CaptureRequest) {
        self.producers
            .insert(request.source, LocalProducer::Deferred(request));
    }

    /// Apply a message from the server
    pub async fn handle(&mut self, message: ServerMessage) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            tracing::debug!("Session closed, ignoring {:?}", message);
            return;
        }
        let room = self.room_id;

        match message {
            ServerMessage::ExistingVoiceMembers {
                room_id,
                members,
                shared_browser,
            } if room == Some(room_id) => {
                self.emit(SessionEvent::MembersSeeded(members));
                if let Some(info) = shared_browser {
                    self.browser_started(info).await;
                }
            }
            ServerMessage::UserJoinedVoice { room_id, user } if room == Some(room_id) => {
                self.emit(SessionEvent::MemberJoined(user));
            }
            ServerMessage::UserLeftVoice { room_id, user_id } if room == Some(room_id) => {
                self.member_left(user_id);
            }
            ServerMessage::RoomCapabilities {
                room_id,
                rtp_capabilities,
            } if room == Some(room_id) => {
                self.capabilities_loaded(&rtp_capabilities);
            }
            ServerMessage::TransportCreated {
                room_id,
                direction,
                transport,
            } if room == Some(room_id) => {
                self.transport_created(direction, transport).await;
            }
            ServerMessage::TransportConnected { transport_id } => {
                self.transport_connected(transport_id);
            }
            ServerMessage::ProducerCreated {
                producer_id,
                source,
            } => self.producer_created(source, producer_id),
            ServerMessage::NewPeerProducer {
                producer_id,
                user_id,
                source,
                kind,
            } => self.announce(ProducerInfo {
                producer_id,
                user_id,
                source,
                kind,
            }),
            ServerMessage::ProducersList { room_id, producers } if room == Some(room_id) => {
                for producer in producers {
                    self.announce(producer);
                }
            }
            ServerMessage::ConsumerCreated {
                consumer_id,
                producer_id,
                user_id,
                source,
                kind,
                ..
            } => self.consumer_created(RemoteTile {
                consumer_id,
                producer_id,
                user_id,
                source,
                kind,
                placement: source.placement(),
            }),
            ServerMessage::ProducerClosed { producer_id, .. } => {
                self.producer_closed(producer_id);
            }
            ServerMessage::SharedBrowserStarted {
                room_id,
                owner_id,
                url,
            } if room == Some(room_id) => {
                self.browser_started(SharedBrowserInfo {
                    room_id,
                    owner_id,
                    url,
                })
                .await;
            }
            ServerMessage::SharedBrowserStopped {
                room_id,
                owner_id,
                url,
            } if room == Some(room_id) => {
                self.browser_stopped(SharedBrowserInfo {
                    room_id,
                    owner_id,
                    url,
                });
            }
            ServerMessage::SharedBrowserInput {
                from_user_id,
                event,
                ..
            } => {
                if self
                    .browser
                    .as_ref()
                    .is_some_and(|b| b.accepts_input_from(from_user_id))
                {
                    self.emit(SessionEvent::BrowserInput {
                        from_user_id,
                        event,
                    });
                } else {
                    tracing::debug!("Dropping browser input, not the owner");
                }
            }
            ServerMessage::RequestRejected {
                request,
                reason,
                subject,
            }
            | ServerMessage::RequestFailed {
                request,
                reason,
                subject,
            } => {
                self.request_failed(&request, &reason, subject);
            }
            ServerMessage::Error { message } => self.notice(message),
            ServerMessage::Authenticated { .. } | ServerMessage::Pong => {}
            other => {
                tracing::debug!("Ignoring message for another room: {:?}", other);
            }
        }
    }

    fn capabilities_loaded(&mut self, rtp_capabilities: &RtpCapabilities) {
        if self.state != SessionState::CapabilityExchange {
            tracing::debug!("Room capabilities already loaded");
            return;
        }
        let Some(room_id) = self.room_id else {
            return;
        };

        if let Err(e) = self.device.load(rtp_capabilities) {
            self.notice(format!("couldn't join voice: {}", e));
            self.leave();
            return;
        }

        self.set_state(SessionState::TransportsPending);
        // Send first: local audio starts as soon as it exists
        for direction in [TransportDirection::Send, TransportDirection::Recv] {
            self.send(ClientMessage::CreateTransport { room_id, direction });
        }
        self.send_transport = TransportSlot::Requested;
        self.recv_transport = TransportSlot::Requested;
    }

    async fn transport_created(
        &mut self,
        direction: TransportDirection,
        remote: TransportOptions,
    ) {
        let requested = match direction {
            TransportDirection::Send => self.send_transport,
            TransportDirection::Recv => self.recv_transport,
        };
        if requested != TransportSlot::Requested {
            tracing::warn!(%direction, "Unexpected transport, ignoring");
            return;
        }

        let transport_id = remote.id;
        let (ice_parameters, dtls_parameters) = match self.local_transport(remote).await {
            Ok(parameters) => parameters,
            Err(e) => {
                self.notice(format!("couldn't join voice: {}", e));
                self.leave();
                return;
            }
        };
        match direction {
            TransportDirection::Send => self.send_transport = TransportSlot::Ready(transport_id),
            TransportDirection::Recv => self.recv_transport = TransportSlot::Ready(transport_id),
        }

        self.send(ClientMessage::ConnectTransport {
            transport_id,
            ice_parameters,
            dtls_parameters,
        });
        tracing::debug!(%direction, transport_id = %transport_id, "Transport ready");

        match direction {
            TransportDirection::Send => self.flush_deferred().await,
            TransportDirection::Recv => {
                while let Some(info) = self.announcements.pop_front() {
                    self.consume(transport_id, info);
                }
                if let Some(room_id) = self.room_id {
                    self.send(ClientMessage::GetProducers { room_id });
                }
            }
        }

        if self.send_transport.ready().is_some() && self.recv_transport.ready().is_some() {
            self.set_state(SessionState::Active);
        }
    }

    /// Gather the local side of a relay transport and return its parameters
    async fn local_transport(
        &mut self,
        remote: TransportOptions,
    ) -> Result<(IceParameters, DtlsParameters), SessionError> {
        let api = self.device.api()?;
        let transport = PeerTransport::gather(&api, remote).await?;
        let parameters = transport.local_parameters().await?;
        self.transports.insert(transport.id(), transport);
        Ok(parameters)
    }

    fn transport_connected(&mut self, transport_id: Uuid) {
        let Some(transport) = self.transports.get_mut(&transport_id) else {
            tracing::debug!(transport_id = %transport_id, "Connected reply for unknown transport");
            return;
        };
        match transport.connect() {
            Ok(()) => tracing::debug!(transport_id = %transport_id, "Transport connecting"),
            Err(e) => tracing::debug!(transport_id = %transport_id, "{}", e),
        }
    }

    /// Produce every deferred source, if the send transport is ready
    async fn flush_deferred(&mut self) {
        let Some(transport_id) = self.send_transport.ready() else {
            return;
        };

        for source in ProducerSource::ALL {
            let request = match self.producers.get(&source) {
                Some(LocalProducer::Deferred(request)) => request.clone(),
                _ => continue,
            };
            self.produce(transport_id, request).await;
        }
    }

    async fn produce(&mut self, transport_id: Uuid, request: CaptureRequest) {
        let source = request.source;
        let kind = source.kind();

        let rtp_parameters = match self.device.rtp_parameters(kind) {
            Ok(params) => params,
            Err(e) => {
                self.source_failed(source, &e.to_string());
                return;
            }
        };
        let track = match self.capture.open(&request).await {
            Ok(track) => track,
            Err(e) => {
                self.source_failed(source, &e.to_string());
                return;
            }
        };

        self.send(ClientMessage::Produce {
            transport_id,
            kind,
            rtp_parameters,
            app_data: AppData { source },
        });
        self.producers.insert(source, LocalProducer::Pending(track));
        self.pending_produces.push_back(PendingProduce {
            source,
            abandoned: false,
        });
    }

    /// A local source could not be started; undo its side effects
    fn source_failed(&mut self, source: ProducerSource, reason: &str) {
        if let Some(producer) = self.producers.remove(&source) {
            if let Some(track) = producer.track() {
                track.release();
            }
        }

        match source {
            ProducerSource::Screen => {
                if let Some(share) = self.screen.take() {
                    let _ = self.stop_source(ProducerSource::ScreenAudio, true);
                    let camera = self.producers.contains_key(&ProducerSource::Webcam);
                    self.set_self_view(share.end(camera));
                }
            }
            ProducerSource::Webcam if self.self_view == SelfView::Camera => {
                self.set_self_view(SelfView::Avatar);
            }
            _ => {}
        }

        self.notice(format!("couldn't start {}: {}", source, reason));
    }

    fn producer_created(&mut self, source: ProducerSource, producer_id: Uuid) {
        let pending = self
            .pending_produces
            .iter()
            .position(|p| p.source == source)
            .and_then(|index| self.pending_produces.remove(index));

        let wanted = pending.is_some_and(|p| !p.abandoned);
        match self.producers.remove(&source) {
            Some(LocalProducer::Pending(track)) if wanted => {
                tracing::info!(%source, producer_id = %producer_id, "Producing");
                self.producers
                    .insert(source, LocalProducer::Live { track, producer_id });
                self.emit(SessionEvent::LocalSourceStarted(source));
            }
            other => {
                if let Some(other) = other {
                    self.producers.insert(source, other);
                }
                tracing::debug!(%source, "Source stopped before it was produced");
                self.send(ClientMessage::CloseProducer { producer_id });
            }
        }
    }

    /// Stop a local source. `notify` is false when the server already closed
    /// the producer.
    fn stop_source(&mut self, source: ProducerSource, notify: bool) -> Result<(), SessionError> {
        let producer = self
            .producers
            .remove(&source)
            .ok_or(SessionError::SourceInactive(source))?;

        match producer {
            LocalProducer::Deferred(_) => {}
            LocalProducer::Pending(track) => {
                track.release();
                if let Some(pending) = self
                    .pending_produces
                    .iter_mut()
                    .find(|p| p.source == source && !p.abandoned)
                {
                    pending.abandoned = true;
                }
            }
            LocalProducer::Live { track, producer_id } => {
                if notify {
                    self.send(ClientMessage::CloseProducer { producer_id });
                }
                track.release();
                self.emit(SessionEvent::LocalSourceStopped(source));
            }
        }
        tracing::info!(%source, "Stopped local source");
        Ok(())
    }

    fn announce(&mut self, info: ProducerInfo) {
        if info.user_id == self.user_id {
            return;
        }
        if self.remote.contains_key(&info.producer_id)
            || self
                .announcements
                .iter()
                .any(|queued| queued.producer_id == info.producer_id)
        {
            tracing::debug!(producer_id = %info.producer_id, "Producer already known");
            return;
        }

        match self.recv_transport.ready() {
            Some(transport_id) => self.consume(transport_id, info),
            None => {
                tracing::debug!(
                    producer_id = %info.producer_id,
                    "Recv transport not ready, queueing announcement"
                );
                self.announcements.push_back(info);
            }
        }
    }

    fn consume(&mut self, transport_id: Uuid, info: ProducerInfo) {
        let rtp_capabilities = match self.device.rtp_capabilities() {
            Ok(caps) => caps.clone(),
            Err(e) => {
                tracing::warn!("Cannot consume {}: {}", info.producer_id, e);
                return;
            }
        };

        self.remote
            .insert(info.producer_id, RemoteProducer::Requested(info));
        self.send(ClientMessage::Consume {
            transport_id,
            producer_id: info.producer_id,
            rtp_capabilities,
        });
    }

    fn consumer_created(&mut self, tile: RemoteTile) {
        match self.remote.get_mut(&tile.producer_id) {
            Some(entry @ RemoteProducer::Requested(_)) => {
                tracing::debug!(
                    user_id = %tile.user_id,
                    source = %tile.source,
                    "Consuming remote producer"
                );
                *entry = RemoteProducer::Consuming(tile.clone());
                self.emit(SessionEvent::TileAdded(tile));
            }
            _ => {
                tracing::debug!(producer_id = %tile.producer_id, "Consumer for unknown producer");
            }
        }
    }

    fn producer_closed(&mut self, producer_id: Uuid) {
        let own = self
            .producers
            .iter()
            .find(|(_, p)| p.producer_id() == Some(producer_id))
            .map(|(source, _)| *source);
        if let Some(source) = own {
            tracing::info!(%source, "Server closed local producer");
            let _ = self.stop_source(source, false);
            if source == ProducerSource::Screen {
                if let Some(share) = self.screen.take() {
                    let _ = self.stop_source(ProducerSource::ScreenAudio, true);
                    let camera = self.producers.contains_key(&ProducerSource::Webcam);
                    self.set_self_view(share.end(camera));
                }
            }
            return;
        }

        self.announcements.retain(|a| a.producer_id != producer_id);
        match self.remote.remove(&producer_id) {
            Some(RemoteProducer::Consuming(tile)) => self.emit(SessionEvent::TileRemoved {
                producer_id,
                user_id: tile.user_id,
                placement: tile.placement,
            }),
            Some(RemoteProducer::Requested(_)) | None => {
                tracing::debug!(producer_id = %producer_id, "Closed producer was not being consumed");
            }
        }
    }

    fn member_left(&mut self, user_id: Uuid) {
        let theirs: Vec<Uuid> = self
            .remote
            .iter()
            .filter(|(_, r)| match r {
                RemoteProducer::Requested(info) => info.user_id == user_id,
                RemoteProducer::Consuming(tile) => tile.user_id == user_id,
            })
            .map(|(id, _)| *id)
            .collect();
        for producer_id in theirs {
            self.producer_closed(producer_id);
        }
        self.announcements.retain(|a| a.user_id != user_id);

        self.emit(SessionEvent::MemberLeft(user_id));
    }

    async fn browser_started(&mut self, info: SharedBrowserInfo) {
        let session = CoBrowse::new(info.clone(), self.user_id);
        let requests = session
            .is_owner()
            .then(|| session.capture_requests(self.options.browser_audio))
            .unwrap_or_default();
        self.browser = Some(session);
        self.emit(SessionEvent::SharedBrowserStarted(info));

        if requests.is_empty() {
            return;
        }
        tracing::info!("Capturing shared browser");
        for request in requests {
            if !self.producers.contains_key(&request.source) {
                self.defer(request);
            }
        }
        self.flush_deferred().await;
    }

    fn browser_stopped(&mut self, info: SharedBrowserInfo) {
        if self.browser.take().is_some_and(|b| b.is_owner()) {
            // The server has already closed the browser producers
            for source in [ProducerSource::Browser, ProducerSource::BrowserAudio] {
                let _ = self.stop_source(source, false);
            }
        }
        self.emit(SessionEvent::SharedBrowserStopped(info));
    }

    fn request_failed(&mut self, request: &str, reason: &str, subject: Option<RequestSubject>) {
        match (request, subject) {
            ("produce", Some(RequestSubject::Produce { source })) => {
                self.produce_failed(source, reason);
            }
            ("consume", Some(RequestSubject::Consume { producer_id })) => {
                tracing::debug!(producer_id = %producer_id, "Consume failed: {}", reason);
                if matches!(
                    self.remote.get(&producer_id),
                    Some(RemoteProducer::Requested(_))
                ) {
                    self.remote.remove(&producer_id);
                }
            }
            ("produce" | "consume", None) => {
                tracing::debug!(request, "Failure names no subject: {}", reason);
            }
            (
                "join-voice-room" | "get-room-capabilities" | "create-transport"
                | "connect-transport",
                _,
            ) => {
                self.notice(format!("couldn't join voice: {}", reason));
                self.leave();
            }
            ("start-shared-browser", _) => {
                self.notice(format!("couldn't start shared browser: {}", reason));
            }
            ("stop-shared-browser", _) => {
                self.notice(format!("couldn't stop shared browser: {}", reason));
            }
            ("close-producer" | "get-producers" | "shared-browser-input" | "leave-voice-room", _) => {
                tracing::debug!(request, "Request failed: {}", reason);
            }
            _ => self.notice(format!("{} failed: {}", request, reason)),
        }
    }

    /// The oldest outstanding produce of `source` failed
    fn produce_failed(&mut self, source: ProducerSource, reason: &str) {
        let Some(pending) = self
            .pending_produces
            .iter()
            .position(|p| p.source == source)
            .and_then(|index| self.pending_produces.remove(index))
        else {
            tracing::debug!(%source, "Failure for a produce no longer pending");
            return;
        };
        if pending.abandoned {
            return;
        }
        if matches!(self.producers.get(&source), Some(LocalProducer::Pending(_))) {
            self.source_failed(source, reason);
        }
    }

    /// Apply a user command
    pub async fn command(&mut self, command: SessionCommand) -> Result<(), SessionError> {
        match command {
            SessionCommand::StartWebcam => {
                self.start_source(CaptureRequest::new(ProducerSource::Webcam))
                    .await?;
                if self.screen.is_none() {
                    self.set_self_view(SelfView::Camera);
                }
                Ok(())
            }
            SessionCommand::StopWebcam => {
                self.stop_source(ProducerSource::Webcam, true)?;
                if self.self_view == SelfView::Camera {
                    self.set_self_view(SelfView::Avatar);
                }
                Ok(())
            }
            SessionCommand::StartScreenShare { with_audio } => {
                self.start_screen_share(with_audio).await
            }
            SessionCommand::StopScreenShare => self.stop_screen_share(),
            SessionCommand::StartSharedBrowser { url } => {
                let room_id = self.require_joined("start a shared browser")?;
                if self.browser.is_some() {
                    return Err(SessionError::BrowserActive);
                }
                self.send(ClientMessage::StartSharedBrowser { room_id, url });
                Ok(())
            }
            SessionCommand::StopSharedBrowser => {
                let room_id = self.require_joined("stop a shared browser")?;
                match &self.browser {
                    None => Err(SessionError::NoBrowser),
                    Some(browser) if !browser.is_owner() => Err(SessionError::NotBrowserOwner),
                    Some(_) => {
                        self.send(ClientMessage::StopSharedBrowser { room_id });
                        Ok(())
                    }
                }
            }
            SessionCommand::BrowserInput(event) => {
                let room_id = self.require_joined("send browser input")?;
                match &self.browser {
                    Some(browser) if !browser.is_owner() => {
                        self.send(ClientMessage::SharedBrowserInput { room_id, event });
                    }
                    Some(_) => {}
                    None => tracing::debug!("No shared browser, dropping input"),
                }
                Ok(())
            }
            SessionCommand::Leave => {
                self.leave();
                Ok(())
            }
        }
    }

    async fn start_source(&mut self, request: CaptureRequest) -> Result<(), SessionError> {
        self.require_joined("start a source")?;
        if self.producers.contains_key(&request.source) {
            return Err(SessionError::SourceActive(request.source));
        }

        self.defer(request);
        self.flush_deferred().await;
        Ok(())
    }

    async fn start_screen_share(&mut self, with_audio: bool) -> Result<(), SessionError> {
        self.require_joined("share the screen")?;
        if self.screen.is_some() {
            return Err(SessionError::SourceActive(ProducerSource::Screen));
        }

        let share = ScreenShare::begin(self.self_view, with_audio);
        let requests = share.capture_requests();
        if let Some(busy) = requests
            .iter()
            .find(|r| self.producers.contains_key(&r.source))
        {
            return Err(SessionError::SourceActive(busy.source));
        }

        for request in requests {
            self.defer(request);
        }
        self.screen = Some(share);
        self.set_self_view(SelfView::Screen);
        self.flush_deferred().await;
        Ok(())
    }

    fn stop_screen_share(&mut self) -> Result<(), SessionError> {
        let share = self
            .screen
            .take()
            .ok_or(SessionError::SourceInactive(ProducerSource::Screen))?;

        let _ = self.stop_source(ProducerSource::Screen, true);
        if share.with_audio() {
            let _ = self.stop_source(ProducerSource::ScreenAudio, true);
        }
        let camera = self.producers.contains_key(&ProducerSource::Webcam);
        self.set_self_view(share.end(camera));
        Ok(())
    }

    /// Leave the room and release everything. Safe to call repeatedly.
    pub fn leave(&mut self) {
        match self.state {
            SessionState::Closing | SessionState::Closed => return,
            SessionState::Idle => {
                self.set_state(SessionState::Closed);
                return;
            }
            _ => {}
        }

        self.set_state(SessionState::Closing);
        for producer in self.producers.values() {
            if let Some(producer_id) = producer.producer_id() {
                self.send(ClientMessage::CloseProducer { producer_id });
            }
        }
        if let Some(room_id) = self.room_id {
            self.send(ClientMessage::LeaveVoiceRoom { room_id });
        }
        self.teardown();
        self.set_state(SessionState::Closed);
        tracing::info!("Left voice room");
    }

    /// The signaling connection is gone; release local state without
    /// talking to the server
    pub fn connection_closed(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.set_state(SessionState::Closing);
        self.teardown();
        self.set_state(SessionState::Closed);
    }

    fn teardown(&mut self) {
        let mut producers: Vec<_> = self.producers.drain().collect();
        producers.sort_by_key(|(source, _)| *source);
        for (source, producer) in producers {
            if let Some(track) = producer.track() {
                track.release();
            }
            if producer.producer_id().is_some() {
                self.emit(SessionEvent::LocalSourceStopped(source));
            }
        }

        for (producer_id, remote) in self.remote.drain() {
            if let RemoteProducer::Consuming(tile) = remote {
                let _ = self.events.send(SessionEvent::TileRemoved {
                    producer_id,
                    user_id: tile.user_id,
                    placement: tile.placement,
                });
            }
        }

        for (_, transport) in self.transports.drain() {
            transport.close();
        }
        self.pending_produces.clear();
        self.announcements.clear();
        self.send_transport = TransportSlot::Closed;
        self.recv_transport = TransportSlot::Closed;
        self.screen = None;
        self.browser = None;
        self.set_self_view(SelfView::Avatar);
    }
}
