use std::fmt;

use crate::protocol::{Direction, MediaKind};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    WebRTCError(#[from] webrtc::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    SignalingError(#[from] SignalingError),
    #[error(transparent)]
    NegotiationError(#[from] NegotiationError),
    #[error(transparent)]
    TransportError(#[from] TransportError),
    #[error(transparent)]
    DeviceError(#[from] DeviceError),
    #[error(transparent)]
    RoomError(#[from] RoomError),
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SignalingError {
    pub kind: SignalingErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct NegotiationError {
    pub kind: NegotiationErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RoomError {
    pub kind: RoomErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SignalingErrorKind {
    #[error("signaling disconnected error")]
    DisconnectedError,
    #[error("signaling timeout error")]
    TimeoutError,
    #[error("request rejected error")]
    RejectedError,
    #[error("resource not found error")]
    ResourceNotFoundError,
    #[error("unexpected response error")]
    UnexpectedResponseError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationErrorKind {
    #[error("invalid state transition error")]
    InvalidTransitionError,
    #[error("ice restart exhausted error")]
    IceRestartExhaustedError,
    #[error("peer connection error")]
    PeerConnectionError,
    #[error("local description error")]
    LocalDescriptionError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportErrorKind {
    #[error("transport not ready error")]
    NotReadyError,
    #[error("transport connection error")]
    ConnectionError,
    #[error("transport recovery exhausted error")]
    RecoveryExhaustedError,
    #[error("produce error")]
    ProduceError,
    #[error("consume error")]
    ConsumeError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeviceErrorKind {
    #[error("media acquisition error")]
    AcquisitionError,
    #[error("capabilities not loaded error")]
    NotLoadedError,
    #[error("unsupported media error")]
    UnsupportedError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RoomErrorKind {
    #[error("room not found error")]
    NotFoundError,
    #[error("room rejected error")]
    RejectedError,
    #[error("not joined error")]
    NotJoinedError,
}

impl Error {
    pub fn new_signaling(message: String, kind: SignalingErrorKind) -> Error {
        Error::SignalingError(SignalingError { kind, message })
    }

    pub fn new_negotiation(message: String, kind: NegotiationErrorKind) -> Error {
        Error::NegotiationError(NegotiationError { kind, message })
    }

    pub fn new_transport(message: String, kind: TransportErrorKind) -> Error {
        Error::TransportError(TransportError { kind, message })
    }

    pub fn new_device(message: String, kind: DeviceErrorKind) -> Error {
        Error::DeviceError(DeviceError { kind, message })
    }

    pub fn new_room(message: String, kind: RoomErrorKind) -> Error {
        Error::RoomError(RoomError { kind, message })
    }

    pub(crate) fn peer_connection_missing(peer_id: &str, kind: MediaKind) -> Error {
        Error::new_negotiation(
            format!("PeerConnection for {} ({}) does not exist", peer_id, kind),
            NegotiationErrorKind::PeerConnectionError,
        )
    }

    pub(crate) fn transport_missing(direction: Direction) -> Error {
        Error::new_transport(
            format!("{} transport does not exist", direction),
            TransportErrorKind::NotReadyError,
        )
    }

    pub fn is_room_not_found(&self) -> bool {
        matches!(self, Error::RoomError(e) if e.kind == RoomErrorKind::NotFoundError)
    }

    /// Consuming a producer that was closed meanwhile is an expected race.
    pub fn is_resource_not_found(&self) -> bool {
        matches!(self, Error::SignalingError(e) if e.kind == SignalingErrorKind::ResourceNotFoundError)
    }
}

impl fmt::Debug for SignalingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("confab::SignalingError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("confab::NegotiationError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("confab::TransportError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("confab::DeviceError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for RoomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("confab::RoomError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}
