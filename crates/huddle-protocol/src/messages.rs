use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{
    AppData, BrowserInputEvent, DtlsParameters, IceParameters, MediaKind, MemberInfo,
    ProducerInfo, ProducerSource, RequestSubject, RtpCapabilities, RtpParameters,
    SharedBrowserInfo, TransportDirection, TransportOptions,
};

/// Messages sent from client to server via WebSocket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Authenticate with the server; must be the first frame
    Authenticate { token: String },

    /// Ping to keep connection alive
    Ping,

    /// Join a voice room
    JoinVoiceRoom { room_id: Uuid },

    /// Leave the current voice room
    LeaveVoiceRoom { room_id: Uuid },

    /// Request the router capabilities of a room
    GetRoomCapabilities { room_id: Uuid },

    /// Create the send or recv transport of this session
    CreateTransport {
        room_id: Uuid,
        direction: TransportDirection,
    },

    /// Hand over the client's ICE credentials and DTLS fingerprints so the
    /// relay can complete the handshake
    ConnectTransport {
        transport_id: Uuid,
        ice_parameters: IceParameters,
        dtls_parameters: DtlsParameters,
    },

    /// Start sending a track
    Produce {
        transport_id: Uuid,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: AppData,
    },

    /// Catch-up list of producers already present in a room
    GetProducers { room_id: Uuid },

    /// Start receiving a remote producer
    Consume {
        transport_id: Uuid,
        producer_id: Uuid,
        rtp_capabilities: RtpCapabilities,
    },

    /// Stop sending a track
    CloseProducer { producer_id: Uuid },

    /// Start a shared-browser session owned by the sender
    StartSharedBrowser { room_id: Uuid, url: String },

    /// Stop the sender's shared-browser session
    StopSharedBrowser { room_id: Uuid },

    /// Remote-control input for the shared browser's owner
    SharedBrowserInput {
        room_id: Uuid,
        event: BrowserInputEvent,
    },
}

impl ClientMessage {
    /// Wire name of the message, used when rejecting a request
    pub fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::Authenticate { .. } => "authenticate",
            ClientMessage::Ping => "ping",
            ClientMessage::JoinVoiceRoom { .. } => "join-voice-room",
            ClientMessage::LeaveVoiceRoom { .. } => "leave-voice-room",
            ClientMessage::GetRoomCapabilities { .. } => "get-room-capabilities",
            ClientMessage::CreateTransport { .. } => "create-transport",
            ClientMessage::ConnectTransport { .. } => "connect-transport",
            ClientMessage::Produce { .. } => "produce",
            ClientMessage::GetProducers { .. } => "get-producers",
            ClientMessage::Consume { .. } => "consume",
            ClientMessage::CloseProducer { .. } => "close-producer",
            ClientMessage::StartSharedBrowser { .. } => "start-shared-browser",
            ClientMessage::StopSharedBrowser { .. } => "stop-shared-browser",
            ClientMessage::SharedBrowserInput { .. } => "shared-browser-input",
        }
    }

    /// What a reply to this request must refer to, if anything
    pub fn subject(&self) -> Option<RequestSubject> {
        match self {
            ClientMessage::Produce { app_data, .. } => Some(RequestSubject::Produce {
                source: app_data.source,
            }),
            ClientMessage::Consume { producer_id, .. } => Some(RequestSubject::Consume {
                producer_id: *producer_id,
            }),
            _ => None,
        }
    }
}

/// Messages sent from server to client via WebSocket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Authentication successful
    Authenticated { connection_id: Uuid },

    /// Error message
    Error { message: String },

    /// A request was refused without changing any shared state
    RequestRejected {
        request: String,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<RequestSubject>,
    },

    /// The relay could not carry out a request; nothing was kept
    RequestFailed {
        request: String,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<RequestSubject>,
    },

    /// Pong response to ping
    Pong,

    /// Full member list of the room just joined (excluding the joiner)
    ExistingVoiceMembers {
        room_id: Uuid,
        members: Vec<MemberInfo>,
        shared_browser: Option<SharedBrowserInfo>,
    },

    /// User joined the voice room
    UserJoinedVoice { room_id: Uuid, user: MemberInfo },

    /// User left the voice room
    UserLeftVoice { room_id: Uuid, user_id: Uuid },

    /// Router capabilities of a room
    RoomCapabilities {
        room_id: Uuid,
        rtp_capabilities: RtpCapabilities,
    },

    /// A transport was created for the requester
    TransportCreated {
        room_id: Uuid,
        direction: TransportDirection,
        transport: TransportOptions,
    },

    /// A transport's DTLS parameters were accepted
    TransportConnected { transport_id: Uuid },

    /// The requester's produce succeeded
    ProducerCreated {
        producer_id: Uuid,
        source: ProducerSource,
    },

    /// Another member started producing
    NewPeerProducer {
        producer_id: Uuid,
        user_id: Uuid,
        source: ProducerSource,
        kind: MediaKind,
    },

    /// Producers already present in the room
    ProducersList {
        room_id: Uuid,
        producers: Vec<ProducerInfo>,
    },

    /// The requester's consume succeeded
    ConsumerCreated {
        consumer_id: Uuid,
        producer_id: Uuid,
        user_id: Uuid,
        source: ProducerSource,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    /// A producer in the room was closed
    ProducerClosed { producer_id: Uuid, user_id: Uuid },

    /// A shared-browser session started
    SharedBrowserStarted {
        room_id: Uuid,
        owner_id: Uuid,
        url: String,
    },

    /// The shared-browser session stopped
    SharedBrowserStopped {
        room_id: Uuid,
        owner_id: Uuid,
        url: String,
    },

    /// Remote-control input, delivered to the shared-browser owner only
    SharedBrowserInput {
        room_id: Uuid,
        from_user_id: Uuid,
        event: BrowserInputEvent,
    },
}
