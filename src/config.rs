use std::{net::IpAddr, sync::Arc, time::Duration};

use derivative::Derivative;
use serde::{Deserialize, Serialize};
use webrtc::{
    api::setting_engine::SettingEngine, peer_connection::configuration::RTCConfiguration,
};
use webrtc_ice::network_type::NetworkType;

use crate::protocol::CallMode;

/// Configuration for every [`webrtc::peer_connection::RTCPeerConnection`] created by the mesh engine.
#[derive(Derivative)]
#[derivative(Clone, Debug)]
pub struct WebRTCTransportConfig {
    #[derivative(Debug = "ignore")]
    pub configuration: RTCConfiguration,
    pub announced_ips: Vec<IpAddr>,
    pub ice_disconnected_timeout: Option<Duration>,
    pub ice_failed_timeout: Option<Duration>,
    pub ice_keep_alive_interval: Option<Duration>,
    pub network_types: Vec<NetworkType>,
}

impl Default for WebRTCTransportConfig {
    fn default() -> Self {
        Self {
            configuration: RTCConfiguration {
                ..Default::default()
            },
            announced_ips: vec![],
            ice_disconnected_timeout: None,
            ice_failed_timeout: None,
            ice_keep_alive_interval: None,
            network_types: vec![],
        }
    }
}

impl WebRTCTransportConfig {
    pub fn configuration(&self) -> RTCConfiguration {
        self.configuration.clone()
    }

    pub(crate) fn setting_engine(&self) -> SettingEngine {
        let mut setting_engine = SettingEngine::default();

        if self.ice_disconnected_timeout.is_some()
            || self.ice_failed_timeout.is_some()
            || self.ice_keep_alive_interval.is_some()
        {
            setting_engine.set_ice_timeouts(
                self.ice_disconnected_timeout,
                self.ice_failed_timeout,
                self.ice_keep_alive_interval,
            );
        }

        if !self.announced_ips.is_empty() {
            let announced_ips = Arc::new(self.announced_ips.clone());
            setting_engine.set_ip_filter(Box::new({
                let announced_ips = Arc::clone(&announced_ips);
                move |ip| announced_ips.contains(&ip)
            }));
        }

        if !self.network_types.is_empty() {
            setting_engine.set_network_types(self.network_types.clone());
        }

        setting_engine
    }
}

/// Signaling channel settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalingConfig {
    pub url: String,
    /// Upper bound for a request/acknowledgment round trip.
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
    /// `None` keeps reconnecting until the client is closed.
    pub reconnect_attempts: Option<u32>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:4000/socket".to_string(),
            request_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
            reconnect_attempts: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeshConfig {
    /// ICE restarts attempted per connection before it is reported lost.
    pub ice_restart_limit: u32,
    /// How long a connection has to stay failed before an ICE restart is issued.
    pub ice_failure_settle: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ice_restart_limit: 3,
            ice_failure_settle: Duration::from_secs(3),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub transport_retry_limit: u32,
    pub transport_retry_delay: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            transport_retry_limit: 10,
            transport_retry_delay: Duration::from_secs(2),
        }
    }
}

/// Thresholds of [`crate::quality::QualityController`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QualityConfig {
    pub interval: Duration,
    pub window: usize,
    pub warmup_samples: usize,
    /// Consecutive evaluations that have to agree before a new level is applied.
    pub confirm_samples: usize,
    pub poor_loss_percent: f64,
    pub acceptable_loss_percent: f64,
    pub high_bitrate: u64,
    pub medium_bitrate: u64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            window: 10,
            warmup_samples: 3,
            confirm_samples: 3,
            poor_loss_percent: 10.0,
            acceptable_loss_percent: 3.0,
            high_bitrate: 1_200_000,
            medium_bitrate: 400_000,
        }
    }
}

/// Thresholds of [`crate::speaker::ActiveSpeakerDetector`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpeakerConfig {
    pub sample_interval: Duration,
    pub window: usize,
    pub energy_threshold: f32,
    pub dominance_window: Duration,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(100),
            window: 10,
            energy_threshold: 0.05,
            dominance_window: Duration::from_millis(1500),
        }
    }
}

/// Everything a [`crate::session::CallSession`] needs, selected once at start.
#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    pub mode: CallMode,
    pub signaling: SignalingConfig,
    pub transport: WebRTCTransportConfig,
    pub mesh: MeshConfig,
    pub recovery: RecoveryConfig,
    pub quality: QualityConfig,
    pub speaker: SpeakerConfig,
}
