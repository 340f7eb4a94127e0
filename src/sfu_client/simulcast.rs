use crate::protocol::{MediaKind, RtpEncoding};

/// (rid, scale down factor, max bitrate in bps), lowest layer first.
const CAMERA_LAYERS: [(&str, f64, u32); 3] = [
    ("r0", 4.0, 150_000),
    ("r1", 2.0, 500_000),
    ("r2", 1.0, 1_500_000),
];

const SCREEN_MAX_BITRATE: u32 = 1_500_000;

/// Send encodings for a producer of `kind`.
///
/// Camera video is sent as three simulcast layers, screen share as a single full resolution
/// encoding and audio without explicit encodings.
pub fn encodings(kind: MediaKind) -> Vec<RtpEncoding> {
    match kind {
        MediaKind::Audio => vec![],
        MediaKind::Video => CAMERA_LAYERS
            .iter()
            .map(|(rid, scale, bitrate)| RtpEncoding {
                rid: Some(rid.to_string()),
                max_bitrate: Some(*bitrate),
                scale_resolution_down_by: Some(*scale),
                active: true,
            })
            .collect(),
        MediaKind::Screen => vec![RtpEncoding {
            rid: None,
            max_bitrate: Some(SCREEN_MAX_BITRATE),
            scale_resolution_down_by: Some(1.0),
            active: true,
        }],
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn camera_layers_grow_in_resolution_and_bitrate() {
        let layers = encodings(MediaKind::Video);
        let rids: Vec<_> = layers.iter().filter_map(|e| e.rid.clone()).collect();
        assert_eq!(rids, vec!["r0", "r1", "r2"]);
        for pair in layers.windows(2) {
            assert!(pair[0].max_bitrate < pair[1].max_bitrate);
            assert!(pair[0].scale_resolution_down_by > pair[1].scale_resolution_down_by);
        }
    }

    #[test]
    fn screen_and_audio_are_not_simulcast() {
        assert_eq!(encodings(MediaKind::Screen).len(), 1);
        assert!(encodings(MediaKind::Audio).is_empty());
    }
}
