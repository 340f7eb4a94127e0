use std::{collections::HashMap, fmt::Debug, net::IpAddr, time::Duration};

use derivative::Derivative;
use webrtc::{rtp_transceiver::rtp_codec::RTCRtpCodecParameters, sdp::extmap};
use webrtc_ice::network_type::NetworkType;

use crate::media_engine;

const EXT_TOFFSET: &str = "urn:ietf:params:rtp-hdrext:toffset";

/// Configuration for [`crate::manager::RoomManager`].
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Number of worker tasks rooms are spread over.
    pub worker_count: usize,
    /// How long an empty room is kept around waiting for a rejoin.
    pub empty_room_grace: Duration,
    /// How often transport byte counters are collected into metrics.
    pub stats_interval: Duration,
    pub media: MediaConfig,
    pub transport: TransportConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            empty_room_grace: Duration::from_secs(5 * 60),
            stats_interval: Duration::from_secs(10),
            media: MediaConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

/// Configuration for the transports handed out by [`crate::backend::LocalBackend`].
#[derive(Derivative)]
#[derivative(Clone, Debug)]
pub struct TransportConfig {
    /// Addresses announced in ICE candidates. Public IP address of your server.
    pub announced_ips: Vec<IpAddr>,
    /// First UDP port assigned to transports.
    pub port_min: u16,
    /// Last UDP port assigned to transports.
    pub port_max: u16,
    pub network_types: Vec<NetworkType>,
    /// Fixed ICE credentials, mostly for debugging. Generated per transport when `None`.
    #[derivative(Debug = "ignore")]
    pub ice_username_fragment: Option<String>,
    #[derivative(Debug = "ignore")]
    pub ice_password: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            announced_ips: vec![],
            port_min: 40000,
            port_max: 49999,
            network_types: vec![NetworkType::Udp4],
            ice_username_fragment: None,
            ice_password: None,
        }
    }
}

impl TransportConfig {
    pub(crate) fn ports(&self) -> u32 {
        u32::from(self.port_max.saturating_sub(self.port_min)) + 1
    }

    /// Whether candidates on `ip` are announced. An empty `network_types` allows every address.
    pub(crate) fn announces(&self, ip: &IpAddr) -> bool {
        if self.network_types.is_empty() {
            return true;
        }
        self.network_types.iter().any(|t| match ip {
            IpAddr::V4(_) => matches!(t, NetworkType::Udp4),
            IpAddr::V6(_) => matches!(t, NetworkType::Udp6),
        })
    }
}

/// Media configuration about codec and header extension for [`crate::router::Router`].
#[derive(Clone, Debug)]
pub struct MediaConfig {
    pub codec: CodecConfig,
    pub header_extension: HeaderExtensionConfig,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            codec: Default::default(),
            header_extension: Default::default(),
        }
    }
}

/// Media codec configuration for audio and video.
#[derive(Clone, Debug)]
pub struct CodecConfig {
    pub audio: Vec<RTCRtpCodecParameters>,
    pub video: Vec<RTCRtpCodecParameters>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            audio: media_engine::audio_codecs(),
            video: media_engine::video_codecs(),
        }
    }
}

/// Header extension configuration for audio and video.
#[derive(Clone, Debug)]
pub struct HeaderExtensionConfig {
    pub audio: Vec<String>,
    pub video: Vec<String>,
}

impl Default for HeaderExtensionConfig {
    fn default() -> Self {
        Self {
            audio: vec![
                extmap::AUDIO_LEVEL_URI.to_owned(),
                extmap::ABS_SEND_TIME_URI.to_owned(),
                extmap::TRANSPORT_CC_URI.to_owned(),
                extmap::SDES_MID_URI.to_owned(),
            ],
            video: vec![
                EXT_TOFFSET.to_string(),
                extmap::SDES_MID_URI.to_owned(),
                extmap::SDES_RTP_STREAM_ID_URI.to_owned(),
                extmap::SDES_REPAIR_RTP_STREAM_ID_URI.to_owned(),
                extmap::ABS_SEND_TIME_URI.to_owned(),
            ],
        }
    }
}

impl HeaderExtensionConfig {
    /// Every configured extension once, in negotiation order.
    pub(crate) fn ordered(&self) -> Vec<String> {
        let mut uris: Vec<String> = self
            .audio
            .iter()
            .chain(self.video.iter())
            .cloned()
            .collect();
        uris.sort_by(|a, b| {
            let a_order = find_extmap_order(a).unwrap_or(u16::MAX);
            let b_order = find_extmap_order(b).unwrap_or(u16::MAX);
            a_order.cmp(&b_order).then_with(|| a.cmp(b))
        });
        uris.dedup();
        uris
    }
}

fn extmap_order() -> HashMap<u16, String> {
    HashMap::from([
        (1, extmap::AUDIO_LEVEL_URI.to_owned()),
        (2, extmap::ABS_SEND_TIME_URI.to_owned()),
        (3, extmap::TRANSPORT_CC_URI.to_owned()),
        (4, extmap::SDES_MID_URI.to_owned()),
        (10, extmap::SDES_RTP_STREAM_ID_URI.to_owned()),
        (11, extmap::SDES_REPAIR_RTP_STREAM_ID_URI.to_owned()),
        (13, extmap::VIDEO_ORIENTATION_URI.to_owned()),
        (14, EXT_TOFFSET.to_string()),
    ])
}

pub(crate) fn find_extmap_order(uri: &str) -> Option<u16> {
    extmap_order()
        .into_iter()
        .find(|(_, v)| v == uri)
        .map(|(k, _)| k)
}
