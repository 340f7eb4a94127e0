use std::fmt;

use serde::{Deserialize, Serialize};
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::sdp::session_description::RTCSessionDescription,
    rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType},
};

pub type PeerId = String;
pub type RoomId = String;

/// Media kinds a participant can send. Screen share is a video source with its own connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    Screen,
}

impl MediaKind {
    pub const ALL: [MediaKind; 3] = [MediaKind::Audio, MediaKind::Video, MediaKind::Screen];

    pub fn is_video(self) -> bool {
        matches!(self, MediaKind::Video | MediaKind::Screen)
    }

    pub fn codec_type(self) -> RTPCodecType {
        match self {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video | MediaKind::Screen => RTPCodecType::Video,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
            MediaKind::Screen => write!(f, "screen"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => write!(f, "send"),
            Direction::Recv => write!(f, "recv"),
        }
    }
}

/// Topology of a room. It is fixed by the first peer that joins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    #[default]
    Mesh,
    Sfu,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaState {
    pub audio: bool,
    pub video: bool,
    pub screen: bool,
}

impl MediaState {
    pub fn get(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
            MediaKind::Screen => self.screen,
        }
    }

    pub fn set(&mut self, kind: MediaKind, enabled: bool) {
        match kind {
            MediaKind::Audio => self.audio = enabled,
            MediaKind::Video => self.video = enabled,
            MediaKind::Screen => self.screen = enabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub peer_id: PeerId,
    pub identity: Identity,
    pub media: MediaState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodec {
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
    pub sdp_fmtp_line: String,
    pub payload_type: u8,
}

impl From<&RTCRtpCodecParameters> for RtpCodec {
    fn from(params: &RTCRtpCodecParameters) -> Self {
        Self {
            mime_type: params.capability.mime_type.clone(),
            clock_rate: params.capability.clock_rate,
            channels: params.capability.channels,
            sdp_fmtp_line: params.capability.sdp_fmtp_line.clone(),
            payload_type: params.payload_type,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodec>,
    pub header_extensions: Vec<String>,
}

impl RtpCapabilities {
    pub fn supports(&self, mime_type: &str) -> bool {
        self.codecs
            .iter()
            .any(|c| c.mime_type.eq_ignore_ascii_case(mime_type))
    }
}

/// One simulcast layer of an outgoing video source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncoding {
    pub rid: Option<String>,
    pub max_bitrate: Option<u32>,
    pub scale_resolution_down_by: Option<f64>,
    pub active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodec>,
    pub encodings: Vec<RtpEncoding>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    pub ice_lite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub protocol: String,
    pub candidate_type: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub direction: Direction,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: String,
    pub peer_id: PeerId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layers {
    pub spatial: u8,
    pub temporal: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: String,
    pub producer_id: String,
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
    pub priority: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SfuJoinInfo {
    pub router_rtp_capabilities: RtpCapabilities,
    pub send_transport: TransportParams,
    pub recv_transport: TransportParams,
    pub existing_producers: Vec<ProducerInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    Negotiation,
    Transport,
    ResourceNotFound,
    RoomNotFound,
    Room,
    InvalidRequest,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorCategory::Negotiation => "negotiation",
            ErrorCategory::Transport => "transport",
            ErrorCategory::ResourceNotFound => "resource-not-found",
            ErrorCategory::RoomNotFound => "room-not-found",
            ErrorCategory::Room => "room",
            ErrorCategory::InvalidRequest => "invalid-request",
            ErrorCategory::Internal => "internal",
        };
        write!(f, "{}", label)
    }
}

/// Messages sent from a client to the signaling server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: RoomId,
        identity: Identity,
        mode: CallMode,
        #[serde(default)]
        media: MediaState,
        #[serde(default)]
        create: bool,
        #[serde(default)]
        rtp_capabilities: Option<RtpCapabilities>,
    },
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: RoomId },
    #[serde(rename_all = "camelCase")]
    Offer {
        target_peer_id: PeerId,
        description: RTCSessionDescription,
        kind: MediaKind,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        target_peer_id: PeerId,
        description: RTCSessionDescription,
        kind: MediaKind,
    },
    // Browser-side RTCIceCandidate serializes to the same shape as RTCIceCandidateInit.
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        target_peer_id: PeerId,
        candidate: RTCIceCandidateInit,
        kind: MediaKind,
    },
    #[serde(rename_all = "camelCase")]
    ToggleMedia {
        room_id: RoomId,
        kind: MediaKind,
        enabled: bool,
    },
    #[serde(rename_all = "camelCase")]
    ScreenState { room_id: RoomId, active: bool },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        direction: Direction,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: String },
    #[serde(rename_all = "camelCase")]
    PauseConsumer { consumer_id: String },
    #[serde(rename_all = "camelCase")]
    SetConsumerLayers { consumer_id: String, layers: Layers },
    #[serde(rename_all = "camelCase")]
    SetConsumerPriority { consumer_id: String, priority: u8 },
    #[serde(rename_all = "camelCase")]
    RequestKeyframe { consumer_id: String },
    #[serde(rename_all = "camelCase")]
    CloseProducer { kind: MediaKind },
    #[serde(rename_all = "camelCase")]
    RecreateTransport { direction: Direction },
    Ping,
}

impl ClientMessage {
    pub fn action(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::LeaveRoom { .. } => "leave-room",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
            ClientMessage::ToggleMedia { .. } => "toggle-media",
            ClientMessage::ScreenState { .. } => "screen-state",
            ClientMessage::ConnectTransport { .. } => "connect-transport",
            ClientMessage::Produce { .. } => "produce",
            ClientMessage::Consume { .. } => "consume",
            ClientMessage::ResumeConsumer { .. } => "resume-consumer",
            ClientMessage::PauseConsumer { .. } => "pause-consumer",
            ClientMessage::SetConsumerLayers { .. } => "set-consumer-layers",
            ClientMessage::SetConsumerPriority { .. } => "set-consumer-priority",
            ClientMessage::RequestKeyframe { .. } => "request-keyframe",
            ClientMessage::CloseProducer { .. } => "close-producer",
            ClientMessage::RecreateTransport { .. } => "recreate-transport",
            ClientMessage::Ping => "ping",
        }
    }
}

/// A client message with an optional request id. Requests with an id are answered by
/// [`ServerMessage::Response`] or [`ServerMessage::Failure`] carrying the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Acknowledgment payloads of request/response messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SfuResponse {
    Joined(SfuJoinInfo),
    #[serde(rename_all = "camelCase")]
    TransportConnected { transport_id: String },
    #[serde(rename_all = "camelCase")]
    Produced { producer_id: String },
    Consumed(ConsumerParams),
    Ack,
    #[serde(rename_all = "camelCase")]
    TransportRecreated {
        transport: TransportParams,
        existing_producers: Vec<ProducerInfo>,
    },
}

/// Messages sent from the signaling server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    ExistingParticipants {
        room_id: RoomId,
        self_peer_id: PeerId,
        participants: Vec<Participant>,
        #[serde(default)]
        sfu: Option<SfuJoinInfo>,
    },
    #[serde(rename_all = "camelCase")]
    UserJoined { participant: Participant },
    #[serde(rename_all = "camelCase")]
    UserLeft { peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    ReceiveOffer {
        from_peer_id: PeerId,
        description: RTCSessionDescription,
        kind: MediaKind,
    },
    #[serde(rename_all = "camelCase")]
    ReceiveAnswer {
        from_peer_id: PeerId,
        description: RTCSessionDescription,
        kind: MediaKind,
    },
    #[serde(rename_all = "camelCase")]
    ReceiveIceCandidate {
        from_peer_id: PeerId,
        candidate: RTCIceCandidateInit,
        kind: MediaKind,
    },
    #[serde(rename_all = "camelCase")]
    MediaToggled {
        peer_id: PeerId,
        kind: MediaKind,
        enabled: bool,
    },
    #[serde(rename_all = "camelCase")]
    ScreenStateChanged { peer_id: PeerId, active: bool },
    #[serde(rename_all = "camelCase")]
    RoomNotFound { room_id: RoomId },
    #[serde(rename_all = "camelCase")]
    RoomError { message: String },
    #[serde(rename_all = "camelCase")]
    NewProducer { producer: ProducerInfo },
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        producer_id: String,
        peer_id: PeerId,
        kind: MediaKind,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerClosed {
        consumer_id: String,
        producer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Response { request_id: u64, payload: SfuResponse },
    #[serde(rename_all = "camelCase")]
    Failure {
        request_id: u64,
        category: ErrorCategory,
        message: String,
    },
    Pong,
}
