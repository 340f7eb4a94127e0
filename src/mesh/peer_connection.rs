use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::{
    ice_transport::{ice_candidate::RTCIceCandidateInit, ice_connection_state::RTCIceConnectionState},
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription,
    },
};

use crate::{
    error::Error,
    media::LocalTrack,
    protocol::{MediaKind, PeerId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for ConnectionStatus {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => ConnectionStatus::Connecting,
            RTCPeerConnectionState::Connected => ConnectionStatus::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionStatus::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionStatus::Failed,
            RTCPeerConnectionState::Closed => ConnectionStatus::Closed,
            _ => ConnectionStatus::New,
        }
    }
}

impl From<RTCIceConnectionState> for ConnectionStatus {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Checking => ConnectionStatus::Connecting,
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                ConnectionStatus::Connected
            }
            RTCIceConnectionState::Disconnected => ConnectionStatus::Disconnected,
            RTCIceConnectionState::Failed => ConnectionStatus::Failed,
            RTCIceConnectionState::Closed => ConnectionStatus::Closed,
            _ => ConnectionStatus::New,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PeerConnectionEvent {
    LocalCandidate(RTCIceCandidateInit),
    StateChanged(ConnectionStatus),
    RemoteTrack { track_id: String, stream_id: String },
}

/// A [`PeerConnectionEvent`] tagged with the slot it came from.
#[derive(Debug, Clone)]
pub struct SlotEvent {
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub event: PeerConnectionEvent,
}

/// One negotiated media connection towards one remote peer.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<RTCSessionDescription, Error>;
    async fn create_answer(&self) -> Result<RTCSessionDescription, Error>;
    async fn set_local_description(&self, description: RTCSessionDescription) -> Result<(), Error>;
    async fn set_remote_description(&self, description: RTCSessionDescription)
        -> Result<(), Error>;
    /// Discards the pending local offer.
    async fn rollback(&self) -> Result<(), Error>;
    async fn local_description(&self) -> Option<RTCSessionDescription>;
    async fn has_remote_description(&self) -> bool;
    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error>;
    /// Adds a receive-only transceiver, used when there is nothing to send for this kind.
    async fn add_receiver(&self) -> Result<(), Error>;
    async fn has_sender(&self) -> bool;
    /// Swaps the outgoing track on the existing sender. `None` sends nothing. Never renegotiates.
    async fn replace_track(&self, track: Option<LocalTrack>) -> Result<(), Error>;
    async fn add_track(&self, track: LocalTrack) -> Result<(), Error>;
    async fn close(&self) -> Result<(), Error>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        remote_peer_id: &str,
        kind: MediaKind,
        events: mpsc::UnboundedSender<SlotEvent>,
    ) -> Result<Arc<dyn PeerConnection>, Error>;
}
