use confab::protocol::{RtpCapabilities, RtpCodec};
use webrtc::{
    api::media_engine::{
        MIME_TYPE_G722, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_PCMA, MIME_TYPE_PCMU,
        MIME_TYPE_VP8, MIME_TYPE_VP9,
    },
    rtp_transceiver::{
        rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters},
        RTCPFeedback,
    },
};

use crate::config::MediaConfig;

const MIME_TYPE_RTX: &str = "video/rtx";

fn codec(
    mime_type: &str,
    clock_rate: u32,
    channels: u16,
    sdp_fmtp_line: &str,
    payload_type: u8,
    rtcp_feedback: Vec<RTCPFeedback>,
) -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            clock_rate,
            channels,
            sdp_fmtp_line: sdp_fmtp_line.to_owned(),
            rtcp_feedback,
        },
        payload_type,
        ..Default::default()
    }
}

fn rtx(apt: u8, payload_type: u8) -> RTCRtpCodecParameters {
    codec(MIME_TYPE_RTX, 90000, 0, &format!("apt={}", apt), payload_type, vec![])
}

fn video_rtcp_feedback() -> Vec<RTCPFeedback> {
    [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_owned(),
            parameter: parameter.to_owned(),
        })
        .collect()
}

pub fn audio_codecs() -> Vec<RTCRtpCodecParameters> {
    vec![
        codec(MIME_TYPE_OPUS, 48000, 2, "minptime=10;useinbandfec=1", 111, vec![]),
        codec(MIME_TYPE_G722, 8000, 0, "", 9, vec![]),
        codec(MIME_TYPE_PCMU, 8000, 0, "", 0, vec![]),
        codec(MIME_TYPE_PCMA, 8000, 0, "", 8, vec![]),
    ]
}

pub fn video_codecs() -> Vec<RTCRtpCodecParameters> {
    vec![
        codec(MIME_TYPE_VP8, 90000, 0, "", 96, video_rtcp_feedback()),
        rtx(96, 97),
        codec(MIME_TYPE_VP9, 90000, 0, "profile-id=0", 98, video_rtcp_feedback()),
        rtx(98, 99),
        codec(MIME_TYPE_VP9, 90000, 0, "profile-id=1", 100, video_rtcp_feedback()),
        rtx(100, 101),
        codec(
            MIME_TYPE_H264,
            90000,
            0,
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f",
            102,
            video_rtcp_feedback(),
        ),
        rtx(102, 121),
        codec(
            MIME_TYPE_H264,
            90000,
            0,
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
            125,
            video_rtcp_feedback(),
        ),
        rtx(125, 107),
    ]
}

pub(crate) fn is_rtx(codec: &RtpCodec) -> bool {
    codec.mime_type.eq_ignore_ascii_case(MIME_TYPE_RTX)
}

/// Capabilities a router announces to joining peers.
pub fn router_rtp_capabilities(config: &MediaConfig) -> RtpCapabilities {
    let codecs = config
        .codec
        .audio
        .iter()
        .chain(config.codec.video.iter())
        .map(RtpCodec::from)
        .collect();

    RtpCapabilities {
        codecs,
        header_extensions: config.header_extension.ordered(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn every_rtx_points_at_a_video_codec() {
        let codecs = video_codecs();
        for codec in codecs.iter().filter(|c| c.capability.mime_type == MIME_TYPE_RTX) {
            let apt: u8 = codec
                .capability
                .sdp_fmtp_line
                .trim_start_matches("apt=")
                .parse()
                .expect("invalid apt");
            assert!(codecs
                .iter()
                .any(|c| c.payload_type == apt && c.capability.mime_type != MIME_TYPE_RTX));
        }
    }

    #[test]
    fn router_capabilities_include_configured_codecs() {
        let caps = router_rtp_capabilities(&MediaConfig::default());
        assert!(caps.supports("audio/opus"));
        assert!(caps.supports("video/H264"));
        assert!(caps.codecs.iter().any(is_rtx));
        assert!(!caps.header_extensions.is_empty());
    }
}
