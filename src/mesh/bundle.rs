use std::{collections::HashMap, sync::Arc};

use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use super::{
    peer_connection::PeerConnection,
    state::{NegotiationState, Role, SlotMachine},
};
use crate::protocol::{MediaKind, PeerId};

/// One media kind towards one remote peer.
pub(crate) struct Slot {
    pub(crate) machine: SlotMachine,
    pub(crate) connection: Arc<dyn PeerConnection>,
    /// Remote candidates that arrived before the remote description.
    pub(crate) pending_candidates: Vec<RTCIceCandidateInit>,
    /// Bumped on every connection state report, so a stale settle timer can tell it is stale.
    pub(crate) epoch: u64,
    pub(crate) failed: bool,
}

impl Slot {
    pub(crate) fn new(machine: SlotMachine, connection: Arc<dyn PeerConnection>) -> Self {
        Self {
            machine,
            connection,
            pending_candidates: Vec::new(),
            epoch: 0,
            failed: false,
        }
    }

    pub(crate) async fn flush_candidates(&mut self) {
        for candidate in self.pending_candidates.drain(..) {
            tracing::debug!("Adding pending ICE candidate: {:?}", candidate);
            if let Err(err) = self.connection.add_ice_candidate(candidate).await {
                tracing::error!("failed to add_ice_candidate: {}", err);
            }
        }
    }
}

/// Every connection towards one remote peer, one slot per media kind.
pub struct ConnectionBundle {
    pub remote_peer_id: PeerId,
    pub role: Role,
    pub(crate) slots: HashMap<MediaKind, Slot>,
}

impl ConnectionBundle {
    pub(crate) fn new(remote_peer_id: PeerId, role: Role) -> Self {
        Self {
            remote_peer_id,
            role,
            slots: HashMap::new(),
        }
    }

    pub fn kinds(&self) -> Vec<MediaKind> {
        let mut kinds: Vec<MediaKind> = self.slots.keys().copied().collect();
        kinds.sort_by_key(|k| *k as u8);
        kinds
    }

    pub fn state(&self, kind: MediaKind) -> Option<NegotiationState> {
        self.slots.get(&kind).map(|slot| slot.machine.state())
    }

    pub(crate) async fn close_slot(&mut self, kind: MediaKind) {
        if let Some(slot) = self.slots.remove(&kind) {
            if let Err(err) = slot.connection.close().await {
                tracing::warn!(
                    "failed to close {} connection to {}: {}",
                    kind,
                    self.remote_peer_id,
                    err
                );
            }
        }
    }

    pub(crate) async fn close(mut self) {
        for kind in self.kinds() {
            self.close_slot(kind).await;
        }
        tracing::debug!("ConnectionBundle for {} is closed", self.remote_peer_id);
    }
}
