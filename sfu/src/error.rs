use std::fmt;

use confab::protocol::ErrorCategory;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    WebRTCError(#[from] webrtc::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    MetricsError(#[from] prometheus::Error),
    #[error(transparent)]
    RoomError(#[from] RoomError),
    #[error(transparent)]
    PeerError(#[from] PeerError),
    #[error(transparent)]
    TransportError(#[from] TransportError),
    #[error(transparent)]
    ProducerError(#[from] ProducerError),
    #[error(transparent)]
    ConsumerError(#[from] ConsumerError),
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RoomError {
    pub kind: RoomErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct PeerError {
    pub kind: PeerErrorKind,
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
pub struct ProducerError {
    pub kind: ProducerErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ConsumerError {
    pub kind: ConsumerErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RoomErrorKind {
    #[error("room not found error")]
    NotFoundError,
    #[error("room mode mismatch error")]
    ModeMismatchError,
    #[error("not joined error")]
    NotJoinedError,
    #[error("worker closed error")]
    WorkerClosedError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PeerErrorKind {
    #[error("peer not found error")]
    NotFoundError,
    #[error("rtp capabilities missing error")]
    CapabilitiesMissingError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportErrorKind {
    #[error("transport not found error")]
    NotFoundError,
    #[error("transport direction error")]
    DirectionError,
    #[error("media backend error")]
    BackendError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProducerErrorKind {
    #[error("producer not found error")]
    NotFoundError,
    #[error("unsupported codec error")]
    UnsupportedCodecError,
    #[error("media backend error")]
    BackendError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConsumerErrorKind {
    #[error("consumer not found error")]
    NotFoundError,
    #[error("cannot consume error")]
    CannotConsumeError,
    #[error("invalid priority error")]
    InvalidPriorityError,
    #[error("media backend error")]
    BackendError,
}

impl Error {
    pub fn new_room(message: String, kind: RoomErrorKind) -> Error {
        Error::RoomError(RoomError { kind, message })
    }

    pub fn new_peer(message: String, kind: PeerErrorKind) -> Error {
        Error::PeerError(PeerError { kind, message })
    }

    pub fn new_transport(message: String, kind: TransportErrorKind) -> Error {
        Error::TransportError(TransportError { kind, message })
    }

    pub fn new_producer(message: String, kind: ProducerErrorKind) -> Error {
        Error::ProducerError(ProducerError { kind, message })
    }

    pub fn new_consumer(message: String, kind: ConsumerErrorKind) -> Error {
        Error::ConsumerError(ConsumerError { kind, message })
    }

    pub(crate) fn not_joined() -> Error {
        Error::new_room(
            "connection has not joined a room".to_string(),
            RoomErrorKind::NotJoinedError,
        )
    }

    /// The category reported to clients in `failure` messages and used as the metrics label.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::WebRTCError(_) => ErrorCategory::Transport,
            Error::JsonError(_) => ErrorCategory::InvalidRequest,
            Error::MetricsError(_) => ErrorCategory::Internal,
            Error::RoomError(e) => match e.kind {
                RoomErrorKind::NotFoundError => ErrorCategory::RoomNotFound,
                RoomErrorKind::ModeMismatchError => ErrorCategory::Room,
                RoomErrorKind::NotJoinedError => ErrorCategory::InvalidRequest,
                RoomErrorKind::WorkerClosedError => ErrorCategory::Internal,
            },
            Error::PeerError(e) => match e.kind {
                PeerErrorKind::NotFoundError => ErrorCategory::ResourceNotFound,
                PeerErrorKind::CapabilitiesMissingError => ErrorCategory::InvalidRequest,
            },
            Error::TransportError(e) => match e.kind {
                TransportErrorKind::NotFoundError => ErrorCategory::ResourceNotFound,
                TransportErrorKind::DirectionError => ErrorCategory::InvalidRequest,
                TransportErrorKind::BackendError => ErrorCategory::Transport,
            },
            Error::ProducerError(e) => match e.kind {
                ProducerErrorKind::NotFoundError => ErrorCategory::ResourceNotFound,
                ProducerErrorKind::UnsupportedCodecError => ErrorCategory::Negotiation,
                ProducerErrorKind::BackendError => ErrorCategory::Transport,
            },
            Error::ConsumerError(e) => match e.kind {
                ConsumerErrorKind::NotFoundError => ErrorCategory::ResourceNotFound,
                ConsumerErrorKind::CannotConsumeError => ErrorCategory::Negotiation,
                ConsumerErrorKind::InvalidPriorityError => ErrorCategory::InvalidRequest,
                ConsumerErrorKind::BackendError => ErrorCategory::Transport,
            },
        }
    }
}

impl fmt::Debug for RoomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("confab_sfu::RoomError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("confab_sfu::PeerError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("confab_sfu::TransportError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for ProducerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("confab_sfu::ProducerError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("confab_sfu::ConsumerError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_resources_share_one_category() {
        let errors = [
            Error::new_producer("gone".to_string(), ProducerErrorKind::NotFoundError),
            Error::new_consumer("gone".to_string(), ConsumerErrorKind::NotFoundError),
            Error::new_transport("gone".to_string(), TransportErrorKind::NotFoundError),
        ];
        for error in errors.iter() {
            assert_eq!(error.category(), ErrorCategory::ResourceNotFound);
        }
        let room = Error::new_room("r1".to_string(), RoomErrorKind::NotFoundError);
        assert_eq!(room.category(), ErrorCategory::RoomNotFound);
    }
}
