use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use uuid::Uuid;
use webrtc::{
    media::Sample,
    rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
    track::track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
};

use crate::{
    error::{DeviceErrorKind, Error},
    media_engine,
    protocol::{MediaKind, MediaState},
};

/// A local capture source (microphone, camera, screen).
pub trait LocalSource: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    /// False once the underlying capture has ended.
    fn is_live(&self) -> bool;
    fn stop(&self);
    /// The track handed to webrtc-rs senders on the mesh path.
    fn rtc_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>>;
}

pub type LocalTrack = Arc<dyn LocalSource>;

/// Acquires capture sources. Failures are per kind and never fatal to a session.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalTrack, Error>;
}

/// Local source backed by [`TrackLocalStaticSample`]. The capture pipeline writes encoded samples into it.
pub struct SampleSource {
    id: String,
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    live: AtomicBool,
}

impl SampleSource {
    pub fn new(kind: MediaKind, stream_id: String) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        let capability = match kind {
            MediaKind::Audio => media_engine::audio_codecs(),
            MediaKind::Video | MediaKind::Screen => media_engine::video_codecs(),
        }
        .into_iter()
        .next()
        .map(|c| c.capability)
        .unwrap_or_else(|| RTCRtpCodecCapability {
            mime_type: webrtc::api::media_engine::MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        });
        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            stream_id,
        ));

        Arc::new(Self {
            id,
            kind,
            track,
            live: AtomicBool::new(true),
        })
    }

    pub async fn write_sample(&self, sample: &Sample) -> Result<(), Error> {
        if !self.is_live() {
            return Err(Error::new_device(
                format!("{} source {} has ended", self.kind, self.id),
                DeviceErrorKind::AcquisitionError,
            ));
        }
        self.track.write_sample(sample).await?;
        Ok(())
    }
}

impl LocalSource for SampleSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn stop(&self) {
        if self.live.swap(false, Ordering::AcqRel) {
            tracing::debug!("{} source {} stopped", self.kind, self.id);
        }
    }

    fn rtc_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        let track: Arc<dyn TrackLocal + Send + Sync> = self.track.clone();
        Some(track)
    }
}

impl fmt::Debug for SampleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleSource")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("live", &self.is_live())
            .finish()
    }
}

/// The local tracks of one session and whether each kind is currently enabled.
#[derive(Debug, Default)]
pub struct LocalMedia {
    tracks: HashMap<MediaKind, LocalTrack>,
    enabled: MediaState,
}

impl LocalMedia {
    /// Acquires every requested kind. A kind that cannot be acquired is skipped.
    pub async fn acquire(devices: &dyn MediaDevices, kinds: &[MediaKind]) -> Self {
        let mut media = Self::default();
        for kind in kinds {
            match devices.acquire(*kind).await {
                Ok(track) => media.insert(track),
                Err(err) => {
                    tracing::warn!("continuing without {}: {}", kind, err);
                }
            }
        }
        media
    }

    pub fn insert(&mut self, track: LocalTrack) {
        let kind = track.kind();
        self.enabled.set(kind, true);
        if let Some(old) = self.tracks.insert(kind, track) {
            old.stop();
        }
    }

    pub fn remove(&mut self, kind: MediaKind) -> Option<LocalTrack> {
        self.enabled.set(kind, false);
        self.tracks.remove(&kind)
    }

    pub fn track(&self, kind: MediaKind) -> Option<LocalTrack> {
        self.tracks.get(&kind).cloned()
    }

    /// The track to send for `kind`: present, live and enabled.
    pub fn sendable(&self, kind: MediaKind) -> Option<LocalTrack> {
        self.tracks
            .get(&kind)
            .filter(|t| t.is_live() && self.enabled.get(kind))
            .cloned()
    }

    pub fn set_enabled(&mut self, kind: MediaKind, enabled: bool) {
        self.enabled.set(kind, enabled);
    }

    pub fn is_enabled(&self, kind: MediaKind) -> bool {
        self.enabled.get(kind)
    }

    pub fn state(&self) -> MediaState {
        self.enabled
    }

    pub fn stop_all(&mut self) {
        for (_, track) in self.tracks.drain() {
            track.stop();
        }
        self.enabled = MediaState::default();
    }
}
