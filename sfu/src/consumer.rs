use confab::protocol::{ConsumerParams, Layers, MediaKind, PeerId, RtpParameters};

use crate::error::{ConsumerErrorKind, Error};

pub const DEFAULT_PRIORITY: u8 = 1;

/// One peer's subscription to a remote producer, on the peer's recv transport.
#[derive(Debug, Clone)]
pub struct Consumer {
    pub id: String,
    pub peer_id: PeerId,
    pub producer_id: String,
    pub producer_peer_id: PeerId,
    pub kind: MediaKind,
    pub transport_id: String,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
    pub priority: u8,
    pub preferred_layers: Option<Layers>,
}

impl Consumer {
    pub fn params(&self) -> ConsumerParams {
        ConsumerParams {
            id: self.id.clone(),
            producer_id: self.producer_id.clone(),
            peer_id: self.producer_peer_id.clone(),
            kind: self.kind,
            rtp_parameters: self.rtp_parameters.clone(),
            paused: self.paused,
            priority: self.priority,
        }
    }

    /// Priorities run from 1 to 255.
    pub fn check_priority(priority: u8) -> Result<u8, Error> {
        if priority == 0 {
            return Err(Error::new_consumer(
                "priority must be between 1 and 255".to_string(),
                ConsumerErrorKind::InvalidPriorityError,
            ));
        }
        Ok(priority)
    }

    /// Clamps `layers` to what the producer actually sends.
    pub fn clamp_layers(&self, layers: Layers) -> Layers {
        let spatial_layers = self.rtp_parameters.encodings.len().max(1);
        let max_spatial = u8::try_from(spatial_layers - 1).unwrap_or(u8::MAX);
        Layers {
            spatial: layers.spatial.min(max_spatial),
            temporal: layers.temporal,
        }
    }
}
