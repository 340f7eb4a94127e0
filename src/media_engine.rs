use webrtc::{
    api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9},
    error::Result,
    rtp_transceiver::{
        rtp_codec::{
            RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability,
            RTPCodecType,
        },
        RTCPFeedback,
    },
    sdp::extmap,
};

use crate::protocol::{RtpCapabilities, RtpCodec};

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
    vec![codec(
        MIME_TYPE_OPUS,
        48000,
        2,
        "minptime=10;useinbandfec=1",
        111,
        vec![],
    )]
}

/// VP8 is listed first because it is the codec every simulcast-capable browser can send.
pub fn video_codecs() -> Vec<RTCRtpCodecParameters> {
    vec![
        codec(MIME_TYPE_VP8, 90000, 0, "", 96, video_rtcp_feedback()),
        codec(MIME_TYPE_VP9, 90000, 0, "profile-id=0", 98, video_rtcp_feedback()),
        codec(
            MIME_TYPE_H264,
            90000,
            0,
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
            102,
            video_rtcp_feedback(),
        ),
    ]
}

pub fn register_default_codecs(me: &mut MediaEngine) -> Result<()> {
    for codec in audio_codecs() {
        me.register_codec(codec, RTPCodecType::Audio)?;
    }

    for codec in video_codecs() {
        me.register_codec(codec, RTPCodecType::Video)?;
    }

    Ok(())
}

fn audio_extensions() -> Vec<&'static str> {
    vec![extmap::SDES_MID_URI, extmap::AUDIO_LEVEL_URI]
}

fn video_extensions() -> Vec<&'static str> {
    vec![
        extmap::SDES_MID_URI,
        extmap::SDES_RTP_STREAM_ID_URI,
        extmap::SDES_REPAIR_RTP_STREAM_ID_URI,
        extmap::TRANSPORT_CC_URI,
    ]
}

pub fn register_extensions(media_engine: &mut MediaEngine) -> Result<()> {
    for extension in video_extensions() {
        media_engine.register_header_extension(
            RTCRtpHeaderExtensionCapability {
                uri: extension.to_owned(),
            },
            RTPCodecType::Video,
            None,
        )?;
    }

    for extension in audio_extensions() {
        media_engine.register_header_extension(
            RTCRtpHeaderExtensionCapability {
                uri: extension.to_owned(),
            },
            RTPCodecType::Audio,
            None,
        )?;
    }
    Ok(())
}

/// Capabilities this client announces on `join-room` and `consume`.
pub fn local_rtp_capabilities() -> RtpCapabilities {
    let codecs = audio_codecs()
        .iter()
        .chain(video_codecs().iter())
        .map(RtpCodec::from)
        .collect();
    let mut header_extensions: Vec<String> = audio_extensions()
        .into_iter()
        .chain(video_extensions())
        .map(|uri| uri.to_owned())
        .collect();
    header_extensions.sort();
    header_extensions.dedup();

    RtpCapabilities {
        codecs,
        header_extensions,
    }
}
