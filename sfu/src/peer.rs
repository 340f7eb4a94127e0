use std::collections::HashMap;

use chrono::{DateTime, Utc};
use confab::protocol::{
    Direction, Identity, MediaKind, MediaState, Participant, PeerId, RtpCapabilities,
    ServerMessage,
};
use tokio::sync::mpsc;

use crate::transport::Transport;

/// Messages queued for one signaling connection.
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// A participant of a room. One peer exists per signaling connection.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub identity: Identity,
    pub media: MediaState,
    pub joined_at: DateTime<Utc>,
    pub rtp_capabilities: Option<RtpCapabilities>,
    pub send_transport: Option<Transport>,
    pub recv_transport: Option<Transport>,
    /// Producer id per kind.
    pub producers: HashMap<MediaKind, String>,
    /// Consumer id per consumed producer id.
    pub consumers: HashMap<String, String>,
    outbox: Outbox,
}

impl Peer {
    pub fn new(id: PeerId, identity: Identity, media: MediaState, outbox: Outbox) -> Self {
        Self {
            id,
            identity,
            media,
            joined_at: Utc::now(),
            rtp_capabilities: None,
            send_transport: None,
            recv_transport: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            outbox,
        }
    }

    pub fn participant(&self) -> Participant {
        Participant {
            peer_id: self.id.clone(),
            identity: self.identity.clone(),
            media: self.media,
        }
    }

    pub fn send(&self, message: ServerMessage) {
        if self.outbox.send(message).is_err() {
            tracing::debug!("connection of peer {} is already closed", self.id);
        }
    }

    /// Later joins from the same connection may carry a new outbox after a reconnect.
    pub fn replace_outbox(&mut self, outbox: Outbox) {
        self.outbox = outbox;
    }

    pub fn transport(&self, direction: Direction) -> Option<&Transport> {
        match direction {
            Direction::Send => self.send_transport.as_ref(),
            Direction::Recv => self.recv_transport.as_ref(),
        }
    }

    pub fn transport_mut(&mut self, direction: Direction) -> Option<&mut Transport> {
        match direction {
            Direction::Send => self.send_transport.as_mut(),
            Direction::Recv => self.recv_transport.as_mut(),
        }
    }

    pub fn set_transport(&mut self, transport: Transport) -> Option<Transport> {
        match transport.direction() {
            Direction::Send => self.send_transport.replace(transport),
            Direction::Recv => self.recv_transport.replace(transport),
        }
    }

    pub fn take_transport(&mut self, direction: Direction) -> Option<Transport> {
        match direction {
            Direction::Send => self.send_transport.take(),
            Direction::Recv => self.recv_transport.take(),
        }
    }
}
