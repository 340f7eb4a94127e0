use std::collections::HashSet;

use chrono::{DateTime, Utc};
use confab::protocol::{MediaKind, PeerId, ProducerInfo, RtpParameters};

/// A media source one peer sends over its send transport.
#[derive(Debug, Clone)]
pub struct Producer {
    pub id: String,
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub transport_id: String,
    pub rtp_parameters: RtpParameters,
    /// Ids of every consumer forwarding this producer.
    pub consumers: HashSet<String>,
    pub created_at: DateTime<Utc>,
}

impl Producer {
    pub fn new(
        id: String,
        peer_id: PeerId,
        kind: MediaKind,
        transport_id: String,
        rtp_parameters: RtpParameters,
    ) -> Self {
        Self {
            id,
            peer_id,
            kind,
            transport_id,
            rtp_parameters,
            consumers: HashSet::new(),
            created_at: Utc::now(),
        }
    }

    pub fn info(&self) -> ProducerInfo {
        ProducerInfo {
            producer_id: self.id.clone(),
            peer_id: self.peer_id.clone(),
            kind: self.kind,
        }
    }

    /// A produce request that only repeats what created this producer.
    pub fn is_retry_of(&self, transport_id: &str, rtp_parameters: &RtpParameters) -> bool {
        self.transport_id == transport_id && &self.rtp_parameters == rtp_parameters
    }
}
